//! Integration tests across the block tree, the sled store and the chain
//! service.
//!
//! Two services are wired together by pumping each one's outbound queue into
//! the other's `handle_message`, which is exactly what a transport would do.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use arbor_protocol::blocktree::SharedBlockTree;
use arbor_protocol::config::{MIN_SUPPORTED_VERSION, PROTOCOL_VERSION, ROLE_FULL};
use arbor_protocol::genesis::{initialize_genesis, Genesis};
use arbor_protocol::network::{
    restore_tree, BlockResponseMessage, ChainService, Message, NetworkMessage, PeerManager,
    ServiceConfig, StatusMessage,
};
use arbor_protocol::storage::{Block, ChainDb};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

const SPEC: &str = r#"{
    "name": "Arbor Test",
    "id": "arbor_test",
    "bootnodes": [],
    "timestamp": 1000,
    "rawState": { "0x01": "0xff", "0x02": "0x00" }
}"#;

fn spec() -> Genesis {
    serde_json::from_str(SPEC).unwrap()
}

struct TestNode {
    service: Arc<ChainService>,
    outbound: mpsc::Receiver<NetworkMessage>,
}

fn start_node(db: Arc<ChainDb>, tree: SharedBlockTree) -> TestNode {
    let genesis_hash = db.genesis_hash().unwrap().unwrap();
    let best = tree.deepest_leaf();
    let (manager, peers) = PeerManager::new(StatusMessage {
        protocol_version: PROTOCOL_VERSION,
        min_supported_version: MIN_SUPPORTED_VERSION,
        roles: ROLE_FULL,
        best_block_number: best.number(),
        best_block_hash: best.hash(),
        genesis_hash,
    });
    tokio::spawn(manager.run());

    let (outbound_tx, outbound) = mpsc::channel(256);
    let (events, _) = broadcast::channel(256);
    let service = Arc::new(
        ChainService::new(
            ServiceConfig::default(),
            tree,
            db,
            peers,
            outbound_tx,
            events,
        )
        .with_genesis_hash(genesis_hash),
    );
    TestNode { service, outbound }
}

fn fresh_node() -> (TestNode, Block) {
    let db = Arc::new(ChainDb::open_temporary().unwrap());
    let genesis = initialize_genesis(&db, &spec()).unwrap();
    let tree = restore_tree(&db).unwrap();
    (start_node(db, tree), genesis)
}

/// `len` blocks on top of `parent`, each tagged with `tag` so sibling
/// chains get distinct hashes.
fn extend(service: &ChainService, parent: &Block, len: usize, tag: u8) -> Vec<Block> {
    let mut chain = Vec::with_capacity(len);
    let mut tip = parent.clone();
    for i in 0..len {
        let block = Block::new(&tip.header, vec![vec![tag, i as u8]], [tag; 32]);
        service.import_block(block.clone()).unwrap();
        tip = block.clone();
        chain.push(block);
    }
    chain
}

/// Deliver queued messages both ways until neither side has anything left.
async fn pump(a: &mut TestNode, b: &mut TestNode) {
    loop {
        let mut delivered = false;
        while let Ok(msg) = a.outbound.try_recv() {
            b.service
                .handle_message(NetworkMessage::new("a", msg.message))
                .await
                .unwrap();
            delivered = true;
        }
        while let Ok(msg) = b.outbound.try_recv() {
            a.service
                .handle_message(NetworkMessage::new("b", msg.message))
                .await
                .unwrap();
            delivered = true;
        }
        if !delivered {
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tree_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");

    let (best_hash, root_hash, nodes) = {
        let db = Arc::new(ChainDb::open(&path).unwrap());
        let genesis = initialize_genesis(&db, &spec()).unwrap();
        let node = start_node(Arc::clone(&db), restore_tree(&db).unwrap());

        let main = extend(&node.service, &genesis, 6, 1);
        extend(&node.service, &main[1], 2, 2);
        extend(&node.service, &main[3], 1, 3);
        node.service.finalize(&main[2].hash()).unwrap();

        let tree = node.service.tree();
        tree.check_invariants().unwrap();
        (tree.deepest_leaf().hash(), tree.root().hash(), tree.len())
    };

    let db = ChainDb::open(&path).unwrap();
    // Same spec again is a no-op.
    initialize_genesis(&db, &spec()).unwrap();
    let tree = restore_tree(&db).unwrap();

    assert_eq!(tree.deepest_leaf().hash(), best_hash);
    assert_eq!(tree.root().hash(), root_hash);
    assert_eq!(tree.root().number(), 3);
    assert_eq!(tree.len(), nodes);
    tree.check_invariants().unwrap();
}

#[tokio::test]
async fn different_genesis_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let db = ChainDb::open(dir.path().join("db")).unwrap();
    initialize_genesis(&db, &spec()).unwrap();

    let mut other = spec();
    other.raw_state.insert("0x03".into(), "0x01".into());
    assert!(initialize_genesis(&db, &other).is_err());
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

#[tokio::test]
async fn lagging_node_catches_up_from_status() {
    let (mut ahead, genesis) = fresh_node();
    let (mut behind, _) = fresh_node();
    let chain = extend(&ahead.service, &genesis, 10, 1);

    let status = ahead.service.local_status();
    behind
        .service
        .handle_message(NetworkMessage::new("a", Message::Status(status)))
        .await
        .unwrap();
    pump(&mut behind, &mut ahead).await;

    let tip = chain.last().unwrap();
    assert_eq!(behind.service.tree().deepest_leaf().hash(), tip.hash());
    assert_eq!(behind.service.tree().len(), 11);
    assert_eq!(behind.service.peers().count().await.unwrap(), 1);
    assert!(behind.service.db().has_block(&tip.hash()).unwrap());
}

#[tokio::test]
async fn orphan_tip_pulls_its_ancestors() {
    let (mut source, genesis) = fresh_node();
    let (mut sink, _) = fresh_node();
    let chain = extend(&source.service, &genesis, 8, 1);
    let tip = chain.last().unwrap().clone();

    sink.service
        .handle_message(NetworkMessage::new(
            "a",
            Message::BlockResponse(BlockResponseMessage {
                id: 0,
                blocks: vec![tip.clone()],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(sink.service.orphan_count(), 1);

    pump(&mut sink, &mut source).await;

    assert_eq!(sink.service.orphan_count(), 0);
    assert_eq!(sink.service.tree().deepest_leaf().hash(), tip.hash());
    let path: Vec<u64> = sink
        .service
        .tree()
        .longest_path()
        .iter()
        .map(|n| n.number())
        .collect();
    assert_eq!(path, (0..=8).collect::<Vec<u64>>());
}

#[tokio::test]
async fn both_forks_sync_and_best_agrees() {
    let (mut a, genesis) = fresh_node();
    let (mut b, _) = fresh_node();
    let short = extend(&a.service, &genesis, 3, 1);
    let long = extend(&b.service, &genesis, 5, 2);

    let status = b.service.local_status();
    a.service
        .handle_message(NetworkMessage::new("b", Message::Status(status)))
        .await
        .unwrap();
    pump(&mut a, &mut b).await;

    let best = a.service.tree().deepest_leaf();
    assert_eq!(best.hash(), long.last().unwrap().hash());
    assert!(a.service.tree().contains(&short[2].hash()));
    assert_eq!(a.service.tree().leaves().len(), 2);
    a.service.tree().check_invariants().unwrap();
}
