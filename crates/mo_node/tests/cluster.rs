//! End-to-end cluster scenarios: a coordinator plus cache nodes on ephemeral
//! ports inside this process, with the synthetic producer standing in for
//! the operator engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mo_client::CacheClient;
use mo_cube::{BoundsCube, Cube3, QueryRect, Resolution, Srs, TimeKind};
use mo_index::{IndexConfig, IndexServer};
use mo_node::{synthetic::SyntheticProducer, NodeConfig, NodeManager, NodeServer};
use mo_types::{CacheType, Producer as _, SemanticId};

// --- Harness ---

struct ClusterIndex {
    port: u16,
    stop: Arc<AtomicBool>,
    join: Option<std::thread::JoinHandle<()>>,
}

fn init_logs() {
    use std::sync::Once;
    static START: Once = Once::new();
    START.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
            .is_test(true)
            .init();
    });
}

impl ClusterIndex {
    fn start(config: IndexConfig) -> Self {
        init_logs();
        let server = IndexServer::bind(config).expect("bind index");
        let port = server.local_addr().port();
        let stop = server.stop_flag();
        let join = std::thread::spawn(move || {
            server.run().expect("index run");
        });
        Self {
            port,
            stop,
            join: Some(join),
        }
    }

    fn client(&self) -> CacheClient {
        CacheClient::new("127.0.0.1", self.port)
    }
}

impl Drop for ClusterIndex {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            join.join().ok();
        }
    }
}

struct ClusterNode {
    producer: Arc<SyntheticProducer>,
    manager: Arc<NodeManager>,
    stop: Arc<AtomicBool>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl ClusterNode {
    fn start(index_port: u16, capacity: u64) -> Self {
        Self::start_with_producer(index_port, capacity, Arc::new(SyntheticProducer::new()))
    }

    fn start_with_producer(
        index_port: u16,
        capacity: u64,
        producer: Arc<SyntheticProducer>,
    ) -> Self {
        let config = NodeConfig {
            index_port,
            workers: 1,
            capacities: CacheType::ALL.iter().map(|t| (*t, capacity)).collect(),
            reconnect_delay: Duration::from_millis(200),
            ..NodeConfig::default()
        };
        let server = NodeServer::new(config, producer.clone()).expect("bind node");
        let manager = server.manager();
        let stop = server.stop_flag();
        let join = std::thread::spawn(move || {
            server.run().expect("node run");
        });
        Self {
            producer,
            manager,
            stop,
            join: Some(join),
        }
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            join.join().ok();
        }
    }

    fn raster_used(&self) -> u64 {
        self.manager.store(CacheType::Raster).usage().used
    }
}

impl Drop for ClusterNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn quick_index() -> IndexConfig {
    IndexConfig {
        port: 0,
        reorg_interval: Duration::from_millis(300),
        stats_interval: Duration::from_millis(1000),
        ..IndexConfig::default()
    }
}

fn rect(x1: f64, x2: f64, width: u32, height: u32) -> QueryRect {
    QueryRect::new(
        BoundsCube::new(
            Cube3::from_ranges(x1, x2, 0.0, 10.0, 0.0, 0.0),
            Srs::LatLon,
            TimeKind::Unix,
        ),
        Resolution::Pixels { width, height },
    )
}

/// What the producer would emit for this request, for content assertions.
fn expected_bytes(semantic_id: &SemanticId, rect: &QueryRect) -> Vec<u8> {
    SyntheticProducer::new()
        .produce(CacheType::Raster, semantic_id, rect)
        .expect("reference produce")
        .payload
        .to_vec()
}

fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn settle() {
    std::thread::sleep(Duration::from_millis(400));
}

// --- Scenarios ---

/// S1: a miss is produced once; the identical query afterwards is served
/// from cache, byte-identical, without another producer call.
#[test]
fn single_node_hit() {
    let index = ClusterIndex::start(quick_index());
    let node = ClusterNode::start(index.port, 10 * 1024 * 1024);
    settle();

    let sem = SemanticId::from("op/hit");
    let query = rect(0.0, 10.0, 256, 256);
    let client = index.client();

    let first = client
        .query_bytes(CacheType::Raster, &sem, query)
        .expect("first query");
    assert_eq!(first, expected_bytes(&sem, &query));
    assert_eq!(node.producer.produce_calls(), 1);

    let second = client
        .query_bytes(CacheType::Raster, &sem, query)
        .expect("second query");
    assert_eq!(second, first);
    assert_eq!(node.producer.produce_calls(), 1, "hit must not produce");
}

/// S2: two cached halves on two nodes puzzle into the full answer without
/// producing anything new.
#[test]
fn two_piece_puzzle_across_nodes() {
    let index = ClusterIndex::start(quick_index());
    let node1 = ClusterNode::start(index.port, 10 * 1024 * 1024);
    settle();
    let node2 = ClusterNode::start(index.port, 10 * 1024 * 1024);
    settle();

    let sem = SemanticId::from("op/puzzle");
    let client = index.client();

    // Seed the two halves; least-used placement puts them on distinct nodes.
    client
        .query_bytes(CacheType::Raster, &sem, rect(0.0, 5.0, 50, 100))
        .expect("left half");
    client
        .query_bytes(CacheType::Raster, &sem, rect(5.0, 10.0, 50, 100))
        .expect("right half");
    let produced_before = node1.producer.produce_calls() + node2.producer.produce_calls();
    assert_eq!(produced_before, 2);

    let whole = rect(0.0, 10.0, 100, 100);
    let assembled = client
        .query_bytes(CacheType::Raster, &sem, whole)
        .expect("puzzle query");
    assert_eq!(assembled, expected_bytes(&sem, &whole));

    let produced_after = node1.producer.produce_calls() + node2.producer.produce_calls();
    assert_eq!(produced_after, 2, "puzzling must not produce");
}

/// S3: half the query is cached; the producer runs exactly once more, for
/// the remainder rectangle.
#[test]
fn partial_puzzle_with_remainder() {
    let index = ClusterIndex::start(quick_index());
    let node = ClusterNode::start(index.port, 10 * 1024 * 1024);
    settle();

    let sem = SemanticId::from("op/partial");
    let client = index.client();

    client
        .query_bytes(CacheType::Raster, &sem, rect(0.0, 5.0, 50, 100))
        .expect("seed half");
    assert_eq!(node.producer.produce_calls(), 1);

    let whole = rect(0.0, 10.0, 100, 100);
    let answer = client
        .query_bytes(CacheType::Raster, &sem, whole)
        .expect("partial query");
    assert_eq!(answer, expected_bytes(&sem, &whole));
    assert_eq!(
        node.producer.produce_calls(),
        2,
        "exactly one more produce, for the remainder"
    );
}

/// S4: two near-simultaneous compatible requests are merged into one
/// produced job; both clients get the batched result.
#[test]
fn batching_merges_compatible_requests() {
    let index = ClusterIndex::start(quick_index());
    let node = ClusterNode::start_with_producer(
        index.port,
        10 * 1024 * 1024,
        Arc::new(SyntheticProducer::with_delay(Duration::from_millis(400))),
    );
    settle();

    // Occupy the node's single worker so the next two requests stay pending
    // long enough to meet in the queue.
    let warmup = std::thread::spawn({
        let client = index.client();
        move || {
            client
                .query_bytes(CacheType::Raster, &SemanticId::from("op/warmup"), rect(0.0, 50.0, 64, 64))
                .expect("warmup")
        }
    });
    std::thread::sleep(Duration::from_millis(150));

    let sem = SemanticId::from("op/batched");
    let a = std::thread::spawn({
        let client = index.client();
        let sem = sem.clone();
        move || {
            client
                .query_bytes(CacheType::Raster, &sem, rect(0.0, 10.0, 100, 100))
                .expect("client a")
        }
    });
    std::thread::sleep(Duration::from_millis(100));
    let b = std::thread::spawn({
        let client = index.client();
        let sem = sem.clone();
        move || {
            client
                .query_bytes(CacheType::Raster, &sem, rect(0.0, 12.0, 120, 100))
                .expect("client b")
        }
    });

    let bytes_a = a.join().expect("join a");
    let bytes_b = b.join().expect("join b");
    warmup.join().expect("join warmup");

    // One produce for the warmup, one for the merged rectangle.
    assert_eq!(node.producer.produce_calls(), 2);
    assert_eq!(bytes_a, bytes_b);
    assert_eq!(bytes_a, expected_bytes(&sem, &rect(0.0, 12.0, 120, 100)));
}

/// S5: a full node plus a fresh empty one rebalance; content survives and
/// both end below the target.
#[test]
fn capacity_reorg_rebalances_two_nodes() {
    let index = ClusterIndex::start(quick_index());
    let node1 = ClusterNode::start(index.port, 12 * 1024 * 1024);
    settle();

    let client = index.client();
    let sems: Vec<SemanticId> = (0..5)
        .map(|i| SemanticId::from(format!("op/reorg{i}")))
        .collect();

    // Five 2 MB rasters, all on the only node.
    for (i, sem) in sems.iter().enumerate() {
        let x = i as f64 * 10.0;
        client
            .query_bytes(CacheType::Raster, sem, rect(x, x + 10.0, 1024, 2048))
            .expect("seed");
    }
    assert_eq!(node1.raster_used(), 5 * 2 * 1024 * 1024);

    // A second node appears; the next reorg pass spreads the load.
    let node2 = ClusterNode::start(index.port, 10 * 1024 * 1024);

    assert!(
        eventually(Duration::from_secs(10), || {
            node2.raster_used() > 0 && node1.raster_used() <= 8 * 1024 * 1024
        }),
        "reorg should move entries to the new node (node1: {}, node2: {})",
        node1.raster_used(),
        node2.raster_used()
    );

    // Nothing was lost: every seeded rectangle is still answerable with the
    // original bytes, and without any new production.
    let produced_before = node1.producer.produce_calls() + node2.producer.produce_calls();
    for (i, sem) in sems.iter().enumerate() {
        let x = i as f64 * 10.0;
        let query = rect(x, x + 10.0, 1024, 2048);
        let bytes = client
            .query_bytes(CacheType::Raster, sem, query)
            .expect("post-reorg query");
        assert_eq!(bytes, expected_bytes(sem, &query));
    }
    let produced_after = node1.producer.produce_calls() + node2.producer.produce_calls();
    assert_eq!(produced_before, produced_after, "reorg must preserve content");
}

/// S6: entries of a dead node vanish from the index; the same query is
/// rebuilt as a create job on a surviving node and still answered.
#[test]
fn node_loss_rebuilds_jobs_elsewhere() {
    let index = ClusterIndex::start(quick_index());
    let node1 = ClusterNode::start(index.port, 10 * 1024 * 1024);
    settle();
    let mut node2 = ClusterNode::start(index.port, 10 * 1024 * 1024);
    settle();

    let client = index.client();
    let sem_x = SemanticId::from("op/stay");
    let sem_y = SemanticId::from("op/orphan");

    client
        .query_bytes(CacheType::Raster, &sem_x, rect(0.0, 10.0, 64, 64))
        .expect("first entry");
    client
        .query_bytes(CacheType::Raster, &sem_y, rect(0.0, 10.0, 64, 64))
        .expect("second entry");
    assert_eq!(
        node2.producer.produce_calls(),
        1,
        "least-used placement should send the second create to node 2"
    );

    node2.shutdown();
    settle();

    // The orphaned query must still be answered, now produced on node 1.
    let node1_calls = node1.producer.produce_calls();
    let bytes = client
        .query_bytes(CacheType::Raster, &sem_y, rect(0.0, 10.0, 64, 64))
        .expect("query after node loss");
    assert_eq!(bytes, expected_bytes(&sem_y, &rect(0.0, 10.0, 64, 64)));
    assert_eq!(node1.producer.produce_calls(), node1_calls + 1);
}

/// Producer failures surface verbatim to the waiting client.
#[test]
fn producer_errors_reach_the_client() {
    let index = ClusterIndex::start(quick_index());
    let _node = ClusterNode::start(index.port, 10 * 1024 * 1024);
    settle();

    let client = index.client();
    let err = client
        .query_bytes(CacheType::Raster, &SemanticId::from("fail/x"), rect(0.0, 1.0, 8, 8))
        .expect_err("must fail");
    let message = err.to_string();
    assert!(message.contains("no such source"), "got: {message}");
}

/// Without any attached node, a query is answered (with an error) rather
/// than parked forever.
#[test]
fn no_nodes_means_an_error_response() {
    let index = ClusterIndex::start(quick_index());
    settle();

    let client = index.client();
    let err = client
        .query_bytes(CacheType::Raster, &SemanticId::from("op/a"), rect(0.0, 1.0, 8, 8))
        .expect_err("must fail fast");
    assert!(err.to_string().contains("no cache nodes"));
}
