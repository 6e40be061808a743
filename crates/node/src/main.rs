//! Node process wiring: configuration, storage backend, chain state, the
//! transaction memory pool and peer message processing.

pub mod accept;
pub mod config;
pub mod context;
pub mod import;
pub mod mempool;
pub mod orphans;
pub mod sync;
pub mod wire;

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use coind_chainstate::{ChainEvent, ChainState, FlushMode};
use coind_consensus::hash256_to_hex;
use coind_consensus::params::chain_params;
use coind_log::{self as logging, log_error, log_info, log_warn};
use coind_script::Interpreter;
use coind_storage::fjall::FjallStore;
use coind_storage::memory::MemoryStore;
use coind_storage::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch};
use crossbeam_channel::Receiver;
use fs2::FileExt;

pub use accept::{AcceptOptions, AcceptOutcome, MempoolPolicy};
pub use config::{parse_args, parse_args_from, usage, Backend, CliAction, Config};
pub use context::{CoreState, NodeContext, PeerAction};
pub use import::{import_blocks, ImportConfig};
pub use mempool::Mempool;

const DATA_DIR_LOCK_FILE_NAME: &str = ".lock";
const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

pub(crate) enum Store {
    Memory(MemoryStore),
    Fjall(FjallStore),
}

impl KeyValueStore for Store {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self {
            Store::Memory(store) => store.get(column, key),
            Store::Fjall(store) => store.get(column, key),
        }
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.put(column, key, value),
            Store::Fjall(store) => store.put(column, key, value),
        }
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.delete(column, key),
            Store::Fjall(store) => store.delete(column, key),
        }
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        match self {
            Store::Memory(store) => store.scan_prefix(column, prefix),
            Store::Fjall(store) => store.scan_prefix(column, prefix),
        }
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.for_each_prefix(column, prefix, visitor),
            Store::Fjall(store) => store.for_each_prefix(column, prefix, visitor),
        }
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.write_batch(batch),
            Store::Fjall(store) => store.write_batch(batch),
        }
    }

    fn sync(&self) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.sync(),
            Store::Fjall(store) => store.sync(),
        }
    }
}

fn open_store(backend: Backend, db_path: &Path) -> Result<Store, String> {
    match backend {
        Backend::Memory => Ok(Store::Memory(MemoryStore::new())),
        Backend::Fjall => FjallStore::open(db_path)
            .map(Store::Fjall)
            .map_err(|err| format!("failed to open database {}: {err}", db_path.display())),
    }
}

struct DataDirLock {
    _file: File,
}

fn lock_data_dir(data_dir: &Path) -> Result<DataDirLock, String> {
    let lock_path = data_dir.join(DATA_DIR_LOCK_FILE_NAME);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|err| format!("failed to open lock file {}: {err}", lock_path.display()))?;

    match file.try_lock_exclusive() {
        Ok(()) => {
            let pid = std::process::id();
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={pid}");
            let _ = file.flush();
            Ok(DataDirLock { _file: file })
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
            let mut holder = String::new();
            let _ =
                File::open(&lock_path).and_then(|mut reader| reader.read_to_string(&mut holder));
            let holder = holder.trim();
            if holder.is_empty() {
                Err(format!(
                    "data dir {} is already locked (another coind instance may be running); lock file {}",
                    data_dir.display(),
                    lock_path.display()
                ))
            } else {
                Err(format!(
                    "data dir {} is already locked (another coind instance may be running); lock file {} ({holder})",
                    data_dir.display(),
                    lock_path.display()
                ))
            }
        }
        Err(err) => Err(format!(
            "failed to lock data dir {} (lock file {}): {err}",
            data_dir.display(),
            lock_path.display()
        )),
    }
}

pub async fn run_entry() -> Result<(), String> {
    match parse_args()? {
        CliAction::PrintHelp => {
            println!("{}", usage());
            Ok(())
        }
        CliAction::PrintVersion => {
            println!("coind {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliAction::Run(config) => run_with_config(Instant::now(), *config).await,
    }
}

async fn run_with_config(start_time: Instant, config: Config) -> Result<(), String> {
    logging::init(config.log_config());
    for key in &config.unsupported_conf_keys {
        log_warn!(
            "Warning: ignoring unsupported key '{key}' in {}",
            config.conf_path.display()
        );
    }

    let params = chain_params(config.network);
    let network_dir = config.network_dir();
    fs::create_dir_all(&network_dir)
        .map_err(|err| format!("failed to create {}: {err}", network_dir.display()))?;
    let _lock = lock_data_dir(&network_dir)?;

    let threads = config.script_threads();
    if let Err(err) = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
    {
        log_warn!("script verification pool already initialised: {err}");
    }
    log_info!("Using {threads} threads for script verification");

    let db_path = network_dir.join("db");
    let store = Arc::new(open_store(config.backend, &db_path)?);
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut chain = ChainState::open(
        params.clone(),
        config.chain_config(),
        store,
        network_dir.join("blocks"),
        Arc::new(Interpreter::new()),
    )
    .map_err(|err| err.to_string())?
    .with_shutdown(Arc::clone(&shutdown));

    chain.load_block_index().map_err(|err| err.to_string())?;
    chain.init_genesis().map_err(|err| err.to_string())?;
    if !config.reindex {
        if let Err(err) = chain.verify_db(config.check_blocks, config.check_level) {
            log_error!("Corrupted block database detected: {err}");
            return Err(format!(
                "block database verification failed ({err}); restart with --reindex"
            ));
        }
    }
    match chain.tip_node() {
        Some(tip) => log_info!(
            "Loaded best chain: hash={} height={} date={}",
            hash256_to_hex(&tip.hash),
            tip.height,
            logging::format_unix_time(i64::from(tip.time))
        ),
        None => log_info!("Loaded empty block index"),
    }

    let events: Receiver<ChainEvent> = chain.subscribe();
    let context = Arc::new(NodeContext::new(
        chain,
        config.mempool_policy(&params),
        config.sync_config(),
    ));
    context
        .lock()?
        .mempool
        .set_check_ratio(config.mempool_check_ratio());

    let event_logger = std::thread::Builder::new()
        .name("chain-events".to_string())
        .spawn(move || {
            for event in events.iter() {
                if let ChainEvent::UpdatedBlockTip {
                    hash,
                    height,
                    initial_download,
                } = event
                {
                    if !initial_download {
                        log_info!("new tip {} at height {height}", hash256_to_hex(&hash));
                    }
                }
            }
        })
        .map_err(|err| format!("failed to spawn event thread: {err}"))?;

    let import_config = ImportConfig {
        data_dir: network_dir.clone(),
        load_block: config.load_block.clone(),
        stop_after_import: config.stop_after_import,
    };
    let import_context = Arc::clone(&context);
    let import = tokio::task::spawn_blocking(move || {
        import_blocks(import_context.as_ref(), &import_config)
    });

    log_info!("init done in {}ms", start_time.elapsed().as_millis());

    let signal_flag = Arc::clone(&shutdown);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log_info!("Shutdown requested");
            signal_flag.store(true, Ordering::SeqCst);
        }
    });

    let mut import = Some(import);
    while !shutdown.load(Ordering::SeqCst) {
        if import.as_ref().is_some_and(|handle| handle.is_finished()) {
            if let Some(handle) = import.take() {
                match handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        log_error!("block import failed: {err}");
                        shutdown.store(true, Ordering::SeqCst);
                    }
                    Err(err) => {
                        log_error!("block import task failed: {err}");
                        shutdown.store(true, Ordering::SeqCst);
                    }
                }
            }
        }
        tokio::time::sleep(SHUTDOWN_POLL).await;
    }

    if let Some(handle) = import {
        if let Ok(Err(err)) = handle.await {
            log_error!("block import failed: {err}");
        }
    }

    log_info!("Shutdown: flushing chain state");
    let flushed = {
        let mut core = context.lock()?;
        core.chain.flush_state(FlushMode::Always)
    };
    drop(context);
    let _ = event_logger.join();
    flushed.map_err(|err| err.to_string())?;
    log_info!("Shutdown: done");
    Ok(())
}
