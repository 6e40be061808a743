//! Loading blocks from files: reindex of our own block files, a
//! `bootstrap.dat` in the data directory and `-loadblock` arguments.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::Instant;

use coind_chainstate::flatfiles::{FileLocation, RECORD_HEADER_SIZE};
use coind_consensus::constants::MAX_BLOCK_SIZE;
use coind_consensus::{hash256_to_hex, Hash256};
use coind_log::{log_cat, log_error, log_info, Category};
use coind_primitives::block::{Block, HEADER_SIZE};
use coind_primitives::encoding::Decoder;
use coind_storage::KeyValueStore;

use crate::context::NodeContext;

const BOOTSTRAP_FILE_NAME: &str = "bootstrap.dat";

#[derive(Clone, Debug, Default)]
pub struct ImportConfig {
    pub data_dir: PathBuf,
    pub load_block: Vec<PathBuf>,
    pub stop_after_import: bool,
}

/// Blocks read before their parent, keyed by the parent hash. They are
/// kept across files so a parent in a later file still releases them.
#[derive(Default)]
struct PendingBlocks {
    by_parent: HashMap<Hash256, Vec<(Block, Option<FileLocation>)>>,
}

pub struct BlockImporter<'a, S: KeyValueStore + 'static> {
    context: &'a NodeContext<S>,
    magic: [u8; 4],
    genesis: Hash256,
    pending: PendingBlocks,
}

impl<'a, S: KeyValueStore + 'static> BlockImporter<'a, S> {
    pub fn new(context: &'a NodeContext<S>) -> Result<Self, String> {
        let core = context.lock()?;
        let params = core.chain.params();
        let magic = params.message_start;
        let genesis = params.consensus.hash_genesis_block;
        drop(core);
        Ok(Self {
            context,
            magic,
            genesis,
            pending: PendingBlocks::default(),
        })
    }

    fn shutdown_requested(&self) -> Result<bool, String> {
        Ok(self.context.lock()?.chain.shutdown_flag().load(Ordering::SeqCst))
    }

    /// Scans `path` for framed blocks and feeds them to the chain. With
    /// `file_number` the file is one of our own block files and blocks are
    /// recorded at their existing position instead of being copied.
    pub fn load_external_block_file(&mut self, path: &Path, file_number: Option<u32>) -> Result<usize, String> {
        let started = Instant::now();
        let file = File::open(path).map_err(|err| format!("failed to open {}: {err}", path.display()))?;
        let mut reader = BufReader::with_capacity(2 * MAX_BLOCK_SIZE as usize, file);
        let mut offset: u64 = 0;
        let mut loaded = 0usize;

        loop {
            if self.shutdown_requested()? {
                break;
            }
            let found = skip_to_byte(&mut reader, self.magic[0], &mut offset)
                .map_err(|err| format!("error reading {}: {err}", path.display()))?;
            if !found {
                break;
            }
            let mut header = [0u8; RECORD_HEADER_SIZE as usize];
            if !read_or_eof(&mut reader, &mut header).map_err(|err| err.to_string())? {
                break;
            }
            let size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
            if header[..4] != self.magic || size < HEADER_SIZE as u32 || size > MAX_BLOCK_SIZE {
                // Resume the search one byte past the false start.
                reader
                    .seek_relative(1 - i64::from(RECORD_HEADER_SIZE))
                    .map_err(|err| err.to_string())?;
                offset += 1;
                continue;
            }
            let payload_pos = offset + u64::from(RECORD_HEADER_SIZE);
            let mut payload = vec![0u8; size as usize];
            if !read_or_eof(&mut reader, &mut payload).map_err(|err| err.to_string())? {
                break;
            }
            offset = payload_pos + u64::from(size);

            let block = match Block::consensus_decode_from(&mut Decoder::new(&payload)) {
                Ok(block) => block,
                Err(err) => {
                    log_info!(
                        "load_external_block_file: deserialize or I/O error at {} in {}: {err}",
                        payload_pos,
                        path.display()
                    );
                    continue;
                }
            };
            let disk_pos = match (file_number, u32::try_from(payload_pos)) {
                (Some(file), Ok(pos)) => Some(FileLocation::new(file, pos)),
                _ => None,
            };
            loaded += self.import_block(block, disk_pos)?;
        }

        log_info!(
            "Loaded {loaded} blocks from external file in {}ms",
            started.elapsed().as_millis()
        );
        Ok(loaded)
    }

    fn import_block(&mut self, block: Block, disk_pos: Option<FileLocation>) -> Result<usize, String> {
        let hash = block.hash();
        let parent = block.header.prev_block;
        {
            let core = self.context.lock()?;
            let index = core.chain.index();
            if hash != self.genesis && index.lookup(&parent).is_none() {
                log_cat!(
                    Category::Reindex,
                    "load_external_block_file: Out of order block {}, parent {} not known",
                    hash256_to_hex(&hash),
                    hash256_to_hex(&parent)
                );
                drop(core);
                self.pending.by_parent.entry(parent).or_default().push((block, disk_pos));
                return Ok(0);
            }
            if let Some(node) = index.get(&hash) {
                if node.have_data() {
                    if hash != self.genesis && node.height % 1000 == 0 {
                        log_info!(
                            "Block Import: already had block {} at height {}",
                            hash256_to_hex(&hash),
                            node.height
                        );
                    }
                    drop(core);
                    return self.release_children(hash);
                }
            }
        }

        let mut loaded = 0;
        if self.process(&block, disk_pos)? {
            loaded += 1;
        }
        Ok(loaded + self.release_children(hash)?)
    }

    /// Processes blocks that were waiting on `parent`, and recursively on
    /// those.
    fn release_children(&mut self, parent: Hash256) -> Result<usize, String> {
        let mut loaded = 0;
        let mut queue = VecDeque::from([parent]);
        while let Some(hash) = queue.pop_front() {
            let Some(children) = self.pending.by_parent.remove(&hash) else {
                continue;
            };
            for (child, disk_pos) in children {
                let child_hash = child.hash();
                log_info!(
                    "load_external_block_file: Processing out of order child {} of {}",
                    hash256_to_hex(&child_hash),
                    hash256_to_hex(&hash)
                );
                if self.process(&child, disk_pos)? {
                    loaded += 1;
                }
                queue.push_back(child_hash);
            }
        }
        Ok(loaded)
    }

    fn process(&self, block: &Block, disk_pos: Option<FileLocation>) -> Result<bool, String> {
        match self.context.process_block(block, disk_pos)? {
            Ok(()) => Ok(true),
            Err(state) => {
                log_cat!(
                    Category::Reindex,
                    "imported block {} rejected: {state}",
                    hash256_to_hex(&block.hash())
                );
                Ok(false)
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.by_parent.values().map(Vec::len).sum()
    }
}

/// Advances `reader` to the next occurrence of `byte`. Returns false at end
/// of file.
fn skip_to_byte<R: BufRead>(reader: &mut R, byte: u8, offset: &mut u64) -> io::Result<bool> {
    loop {
        let buffer = reader.fill_buf()?;
        if buffer.is_empty() {
            return Ok(false);
        }
        match buffer.iter().position(|candidate| *candidate == byte) {
            Some(skip) => {
                reader.consume(skip);
                *offset += skip as u64;
                return Ok(true);
            }
            None => {
                let len = buffer.len();
                reader.consume(len);
                *offset += len as u64;
            }
        }
    }
}

fn read_or_eof<R: Read>(reader: &mut R, buffer: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buffer) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(err),
    }
}

/// Runs every import source in order: the reindex, then `bootstrap.dat`,
/// then the `-loadblock` files. The chain is marked as importing for the
/// duration so peers are not asked for blocks that are about to load.
pub fn import_blocks<S: KeyValueStore + 'static>(
    context: &NodeContext<S>,
    config: &ImportConfig,
) -> Result<(), String> {
    context.lock()?.chain.set_importing(true);
    let result = run_imports(context, config);
    context.lock()?.chain.set_importing(false);
    result?;

    // Pick up better chains already sitting in the index.
    context.activate_best_chain(None)?;
    if config.stop_after_import {
        log_info!("Stopping after block import");
        context.lock()?.chain.shutdown_flag().store(true, Ordering::SeqCst);
    }
    Ok(())
}

fn run_imports<S: KeyValueStore + 'static>(context: &NodeContext<S>, config: &ImportConfig) -> Result<(), String> {
    let mut importer = BlockImporter::new(context)?;

    if context.lock()?.chain.is_reindexing() {
        let mut file = 0u32;
        loop {
            let path = context.lock()?.chain.block_store().blocks().file_path(file);
            if !path.exists() {
                break;
            }
            log_info!("Reindexing block file blk{file:05}.dat...");
            importer.load_external_block_file(&path, Some(file))?;
            if importer.shutdown_requested()? {
                return Ok(());
            }
            file += 1;
        }
        context
            .lock()?
            .chain
            .finish_reindex()
            .map_err(|err| err.to_string())?;
        log_info!("Reindexing finished");
    }

    let bootstrap = config.data_dir.join(BOOTSTRAP_FILE_NAME);
    if bootstrap.exists() {
        log_info!("Importing bootstrap.dat...");
        importer.load_external_block_file(&bootstrap, None)?;
        let old = bootstrap.with_extension("dat.old");
        if let Err(err) = std::fs::rename(&bootstrap, &old) {
            log_error!("failed to rename {}: {err}", bootstrap.display());
        }
    }

    for path in &config.load_block {
        if importer.shutdown_requested()? {
            break;
        }
        if path.exists() {
            log_info!("Importing blocks file {}...", path.display());
            importer.load_external_block_file(path, None)?;
        } else {
            log_info!("Warning: Could not open blocks file {}", path.display());
        }
    }

    if importer.pending_count() > 0 {
        log_info!(
            "{} imported blocks never found their parent",
            importer.pending_count()
        );
    }
    Ok(())
}
