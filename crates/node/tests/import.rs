mod common;

use std::fs;
use std::path::Path;
use std::sync::atomic::Ordering;

use coind::import::{import_blocks, ImportConfig};
use coind_primitives::block::Block;
use common::TestNode;

fn write_block_file(path: &Path, magic: [u8; 4], blocks: &[&Block]) {
    let mut bytes = b"junk before the first record".to_vec();
    for block in blocks {
        let payload = block.consensus_encode();
        bytes.extend_from_slice(&magic);
        bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&payload);
        // A stray magic byte that does not start a record.
        bytes.push(magic[0]);
    }
    fs::write(path, bytes).expect("write block file");
}

#[test]
fn loadblock_file_imports_blocks_in_any_order() {
    let source = TestNode::new();
    let blocks = source.mine_many(5);

    let node = TestNode::new();
    let path = node.dir.path().join("external.dat");
    let order = [&blocks[2], &blocks[3], &blocks[0], &blocks[4], &blocks[1]];
    write_block_file(&path, node.params.message_start, &order);
    node.advance_clock_to(&blocks[4]);

    let config = ImportConfig {
        data_dir: node.dir.path().to_path_buf(),
        load_block: vec![path, node.dir.path().join("missing.dat")],
        stop_after_import: true,
    };
    import_blocks(&node.context, &config).expect("import");

    assert_eq!(node.height(), 5);
    assert_eq!(node.tip_hash(), blocks[4].hash());
    let core = node.context.lock().expect("lock");
    assert!(!core.chain.is_importing());
    assert!(core.chain.shutdown_flag().load(Ordering::SeqCst));
}

#[test]
fn bootstrap_file_is_imported_and_retired() {
    let source = TestNode::new();
    let blocks = source.mine_many(3);

    let node = TestNode::new();
    let bootstrap = node.dir.path().join("bootstrap.dat");
    let order: Vec<&Block> = blocks.iter().collect();
    write_block_file(&bootstrap, node.params.message_start, &order);
    node.advance_clock_to(&blocks[2]);

    let config = ImportConfig {
        data_dir: node.dir.path().to_path_buf(),
        ..ImportConfig::default()
    };
    import_blocks(&node.context, &config).expect("import");

    assert_eq!(node.height(), 3);
    assert!(!bootstrap.exists());
    assert!(node.dir.path().join("bootstrap.dat.old").exists());
    let core = node.context.lock().expect("lock");
    assert!(!core.chain.shutdown_flag().load(Ordering::SeqCst));
}

#[test]
fn blocks_already_known_are_skipped() {
    let node = TestNode::new();
    let blocks = node.mine_many(2);
    let path = node.dir.path().join("again.dat");
    let order: Vec<&Block> = blocks.iter().collect();
    write_block_file(&path, node.params.message_start, &order);

    let config = ImportConfig {
        data_dir: node.dir.path().to_path_buf(),
        load_block: vec![path],
        stop_after_import: false,
    };
    import_blocks(&node.context, &config).expect("import");
    assert_eq!(node.height(), 2);
    assert_eq!(node.tip_hash(), blocks[1].hash());
}
