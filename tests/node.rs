// End-to-end tests driving real consensus nodes against the registry

use std::collections::HashMap;
use std::fs;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use apiary::raft::{NodeInfo, RaftConfig, RaftNode, StatusChange, StatusListener};
use apiary::registry::{BeeInfo, CellKey, Colony, HiveInfo, Registry, RegistryCommand, RegistryReply};
use apiary::Error;

type Node = RaftNode<Registry>;

const LEADER_WAIT: Duration = Duration::from_secs(10);

fn config(dir: &TempDir, snapshot_count: u64) -> RaftConfig {
    RaftConfig {
        snapshot_count,
        tick_interval_ms: 10,
        data_dir: dir.path().to_path_buf(),
        ..RaftConfig::default()
    }
}

fn start_single(dir: &TempDir, snapshot_count: u64) -> (Arc<Node>, Arc<Registry>) {
    let registry = Arc::new(Registry::new("hive-1"));
    let node = RaftNode::builder()
        .id(1)
        .config(config(dir, snapshot_count))
        .peers(vec![NodeInfo::new(1, "a")])
        .store(Arc::clone(&registry))
        .build()
        .unwrap();
    (Arc::new(node), registry)
}

async fn elect(node: &Node) {
    node.campaign().await.unwrap();
    node.wait_for_leader(LEADER_WAIT).await.expect("no leader elected");
}

fn stop(node: &Arc<Node>) {
    node.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn bootstrap_and_first_request() {
    let dir = TempDir::new().unwrap();
    let (node, registry) = start_single(&dir, 100);
    elect(&node).await;

    // The bootstrap peer reached the registry through the conf-change path.
    assert_eq!(registry.hives(), vec![HiveInfo::new(1, "a")]);

    // Hive ids start at one for the bootstrap hive, so the first allocation
    // returns two.
    let reply = node
        .process(RegistryCommand::NewHiveId {
            addr: "b".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(reply, Some(RegistryReply::Id(2)));

    let mut hives = registry.hives();
    hives.sort_by_key(|h| h.id);
    assert_eq!(hives, vec![HiveInfo::new(1, "a"), HiveInfo::new(2, "b")]);
    assert_eq!(node.inflight(), 0);
    stop(&node);
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_bee_is_reported_not_applied() {
    let dir = TempDir::new().unwrap();
    let (node, registry) = start_single(&dir, 100);
    elect(&node).await;

    for want in 1..=2u64 {
        let reply = node.process(RegistryCommand::NewBeeId).await.unwrap();
        assert_eq!(reply, Some(RegistryReply::Id(want)));
    }

    let bee = BeeInfo {
        id: 2,
        hive: 1,
        app: "x".to_string(),
        ..BeeInfo::default()
    };
    node.process(RegistryCommand::AddBee(bee.clone()))
        .await
        .unwrap();
    let err = node
        .process(RegistryCommand::AddBee(bee))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateBee));
    assert_eq!(registry.bees().iter().filter(|b| b.id == 2).count(), 1);
    stop(&node);
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_resumes_from_snapshot_and_log() {
    let dir = TempDir::new().unwrap();
    {
        let (node, _registry) = start_single(&dir, 100);
        elect(&node).await;
        for want in 1..=250u64 {
            let reply = node.process(RegistryCommand::NewBeeId).await.unwrap();
            assert_eq!(reply, Some(RegistryReply::Id(want)));
        }
        stop(&node);
    }

    // 250 applies with a threshold of 100 must have compacted at least twice.
    let snapshots = fs::read_dir(dir.path().join("snap"))
        .unwrap()
        .flatten()
        .filter(|e| e.path().extension().map_or(false, |x| x == "snap"))
        .count();
    assert!(snapshots >= 2, "expected at least two snapshots, got {snapshots}");

    let (node, registry) = start_single(&dir, 100);
    elect(&node).await;
    let reply = node.process(RegistryCommand::NewBeeId).await.unwrap();
    assert_eq!(reply, Some(RegistryReply::Id(251)));
    // The hive directory survived the restart too.
    assert_eq!(registry.hives(), vec![HiveInfo::new(1, "a")]);
    stop(&node);
}

struct RecordingListener(mpsc::Sender<StatusChange>);

impl StatusListener for RecordingListener {
    fn on_status_change(&self, change: StatusChange) {
        let _ = self.0.send(change);
    }
}

fn start_cluster(
    dirs: &[TempDir; 3],
    listener: Option<(u64, RecordingListener)>,
) -> (Vec<Arc<Node>>, Vec<Arc<Registry>>) {
    let peers: Vec<NodeInfo> = (1..=3u64)
        .map(|id| NodeInfo::new(id, format!("hive-{id}")))
        .collect();
    let router: Arc<Mutex<HashMap<u64, Arc<Node>>>> = Arc::new(Mutex::new(HashMap::new()));
    let mut listener = listener;

    let mut nodes = Vec::new();
    let mut registries = Vec::new();
    for id in 1..=3u64 {
        let registry = Arc::new(Registry::new(format!("hive-{id}")));
        let nodes_by_id = Arc::clone(&router);
        let mut builder = RaftNode::builder()
            .id(id)
            .config(config(&dirs[(id - 1) as usize], 1000))
            .peers(peers.clone())
            .store(Arc::clone(&registry))
            .transport(move |msgs| {
                for msg in msgs {
                    let target = nodes_by_id.lock().unwrap().get(&msg.to).cloned();
                    if let Some(node) = target {
                        let _ = node.step(msg);
                    }
                }
            });
        if listener.as_ref().map(|(listen_id, _)| *listen_id) == Some(id) {
            let (_, recording) = listener.take().unwrap();
            builder = builder.listener(recording);
        }
        let node = Arc::new(builder.build().unwrap());
        router.lock().unwrap().insert(id, Arc::clone(&node));
        nodes.push(node);
        registries.push(registry);
    }
    (nodes, registries)
}

#[tokio::test(flavor = "multi_thread")]
async fn conf_change_add_remove_readd() {
    let dirs = [
        TempDir::new().unwrap(),
        TempDir::new().unwrap(),
        TempDir::new().unwrap(),
    ];
    let (nodes, registries) = start_cluster(&dirs, None);
    elect(&nodes[0]).await;
    let leader = &nodes[0];
    let registry = &registries[0];

    // Every bootstrap peer is in the directory of every replica.
    assert_eq!(registry.hives().len(), 3);

    // A settled no-op confirms the pipeline before membership churn.
    leader.process(RegistryCommand::NoOp).await.unwrap();

    leader.add_node(4, "hive-4").await.unwrap();
    assert_eq!(registry.hive(4).unwrap(), HiveInfo::new(4, "hive-4"));

    leader.remove_node(4, "hive-4").await.unwrap();
    assert!(matches!(registry.hive(4), Err(Error::NoSuchHive)));

    // Validation runs against the current membership, not history: a removed
    // node can join again.
    leader.add_node(4, "hive-4").await.unwrap();
    assert_eq!(registry.hive(4).unwrap(), HiveInfo::new(4, "hive-4"));

    for node in &nodes {
        stop(node);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn leader_change_reaches_listener() {
    let dirs = [
        TempDir::new().unwrap(),
        TempDir::new().unwrap(),
        TempDir::new().unwrap(),
    ];
    let (events_tx, events_rx) = mpsc::channel();
    let (nodes, _registries) = start_cluster(&dirs, Some((1, RecordingListener(events_tx))));

    elect(&nodes[0]).await;
    // A proposal settles replication before the handover.
    nodes[0].process(RegistryCommand::NoOp).await.unwrap();

    nodes[1].campaign().await.unwrap();
    let deadline = std::time::Instant::now() + LEADER_WAIT;
    let mut handed_over = false;
    while std::time::Instant::now() < deadline {
        match events_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(StatusChange::LeaderChanged { new, .. }) if new == 2 => {
                handed_over = true;
                break;
            }
            Ok(_) => {}
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    assert!(handed_over, "node 1 never observed node 2 taking over");

    for node in &nodes {
        stop(node);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn cell_lock_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let (node, registry) = start_single(&dir, 100);
    elect(&node).await;

    let reply = node.process(RegistryCommand::NewBeeId).await.unwrap();
    assert_eq!(reply, Some(RegistryReply::Id(1)));
    node.process(RegistryCommand::AddBee(BeeInfo {
        id: 1,
        hive: 1,
        app: "a".to_string(),
        ..BeeInfo::default()
    }))
    .await
    .unwrap();

    let colony = Colony::new(1);
    let cells = vec![CellKey::new("d", "c1"), CellKey::new("d", "c2")];
    let lock = RegistryCommand::LockCells {
        colony: colony.clone(),
        app: "a".to_string(),
        cells: cells.clone(),
    };

    let first = node.process(lock.clone()).await.unwrap();
    assert_eq!(first, Some(RegistryReply::Colony(colony.clone())));
    let second = node.process(lock).await.unwrap();
    assert_eq!(second, Some(RegistryReply::Colony(colony)));

    let (bee, has_all) = registry.bee_for_cells("a", &cells).unwrap();
    assert_eq!(bee.id, 1);
    assert!(has_all);
    stop(&node);
}

#[tokio::test(flavor = "multi_thread")]
async fn sequential_effects_are_visible() {
    let dir = TempDir::new().unwrap();
    let (node, registry) = start_single(&dir, 100);
    elect(&node).await;

    // If a request returns success before the next is submitted, its state
    // effects are visible to the next.
    let reply = node.process(RegistryCommand::NewBeeId).await.unwrap();
    assert_eq!(reply, Some(RegistryReply::Id(1)));
    node.process(RegistryCommand::AddBee(BeeInfo {
        id: 1,
        hive: 1,
        app: "a".to_string(),
        ..BeeInfo::default()
    }))
    .await
    .unwrap();
    assert_eq!(registry.bee(1).unwrap().app, "a");
    stop(&node);
}
