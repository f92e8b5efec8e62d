//! Replay-order and reconnect scenarios for the pending operation queue.
use offline::*;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use store::{DraftDb, SharedDb};

/// Records applied payload tags and rejects the tags listed in `failing`.
#[derive(Default)]
struct ScriptedSink {
    applied: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
}

impl ScriptedSink {
    fn fail_on(&self, tag: &str) {
        self.failing.lock().insert(tag.to_string());
    }

    fn heal(&self) {
        self.failing.lock().clear();
    }

    fn applied(&self) -> Vec<String> {
        self.applied.lock().clone()
    }
}

#[async_trait::async_trait]
impl RemoteSink for ScriptedSink {
    async fn apply(&self, operation: &PendingOperation) -> anyhow::Result<()> {
        let tag = operation.payload["tag"].as_str().unwrap_or_default().to_string();
        if self.failing.lock().contains(&tag) {
            anyhow::bail!("sink rejected {tag}");
        }
        self.applied.lock().push(tag);
        Ok(())
    }
}

fn setup() -> (SharedDb, ConnectivityMonitor, Arc<ScriptedSink>, PendingOpQueue) {
    let db = DraftDb::open_in_memory().unwrap().into_shared();
    let monitor = ConnectivityMonitor::open(db.clone()).unwrap();
    let sink = Arc::new(ScriptedSink::default());
    let queue = PendingOpQueue::new(db.clone(), monitor.clone(), sink.clone());
    (db, monitor, sink, queue)
}

fn tag(name: &str) -> serde_json::Value {
    serde_json::json!({ "tag": name })
}

#[tokio::test]
async fn failed_operation_halts_and_preserves_order() {
    let (_db, monitor, sink, queue) = setup();
    monitor.go_offline().unwrap();

    for name in ["op1", "op2", "op3"] {
        queue
            .enqueue(OpAction::Update, EntityType::Draft, tag(name))
            .await
            .unwrap();
    }
    assert_eq!(queue.len().unwrap(), 3);
    assert!(sink.applied().is_empty());

    sink.fail_on("op2");
    monitor.go_online().unwrap();
    let err = queue.drain().await.unwrap_err();
    assert!(matches!(err, OfflineError::Replay { .. }));
    assert_eq!(sink.applied(), vec!["op1"]);
    assert_eq!(monitor.state(), Connectivity::Offline);

    let remaining: Vec<String> = queue
        .pending()
        .unwrap()
        .into_iter()
        .map(|op| op.payload["tag"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(remaining, vec!["op2", "op3"]);

    sink.heal();
    monitor.go_online().unwrap();
    let report = queue.drain().await.unwrap();
    assert_eq!(report, DrainReport { applied: 2, remaining: 0 });
    assert_eq!(sink.applied(), vec!["op1", "op2", "op3"]);
    assert_eq!(monitor.state(), Connectivity::Online);
}

#[tokio::test]
async fn drain_is_inert_while_offline() {
    let (_db, monitor, sink, queue) = setup();
    monitor.go_offline().unwrap();
    queue
        .enqueue(OpAction::Create, EntityType::Project, tag("p"))
        .await
        .unwrap();

    let report = queue.drain().await.unwrap();
    assert_eq!(report, DrainReport { applied: 0, remaining: 1 });
    assert!(sink.applied().is_empty());
}

#[tokio::test]
async fn enqueue_while_online_replays_immediately() {
    let (_db, monitor, sink, queue) = setup();
    let mut events = queue.subscribe();

    queue
        .enqueue(OpAction::Delete, EntityType::Draft, tag("now"))
        .await
        .unwrap();
    assert_eq!(sink.applied(), vec!["now"]);
    assert!(queue.is_empty().unwrap());
    assert_eq!(monitor.state(), Connectivity::Online);

    assert!(matches!(events.recv().await.unwrap(), QueueEvent::Enqueued(_)));
    assert!(matches!(events.recv().await.unwrap(), QueueEvent::Applied(_)));
    assert_eq!(
        events.recv().await.unwrap(),
        QueueEvent::Drained { applied: 1 }
    );
}

#[tokio::test]
async fn queue_survives_reopen() {
    let (db, monitor, _sink, queue) = setup();
    monitor.go_offline().unwrap();
    queue
        .enqueue(OpAction::Update, EntityType::Draft, tag("persisted"))
        .await
        .unwrap();
    drop(queue);

    let monitor = ConnectivityMonitor::open(db.clone()).unwrap();
    assert_eq!(monitor.state(), Connectivity::Offline);
    let sink = Arc::new(ScriptedSink::default());
    let queue = PendingOpQueue::new(db, monitor.clone(), sink.clone());
    assert_eq!(queue.len().unwrap(), 1);

    monitor.go_online().unwrap();
    queue.drain().await.unwrap();
    assert_eq!(sink.applied(), vec!["persisted"]);
}

#[tokio::test(start_paused = true)]
async fn reconnect_signal_triggers_drain() {
    let (_db, monitor, sink, queue) = setup();
    monitor.go_offline().unwrap();
    let task = queue.spawn_reconnect_drain();
    tokio::task::yield_now().await;

    queue
        .enqueue(OpAction::Update, EntityType::Draft, tag("queued"))
        .await
        .unwrap();
    assert!(sink.applied().is_empty());

    monitor.go_online().unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(sink.applied(), vec!["queued"]);
    assert!(queue.is_empty().unwrap());

    task.abort();
}

#[tokio::test]
async fn null_sink_accepts_everything() {
    let db = DraftDb::open_in_memory().unwrap().into_shared();
    let monitor = ConnectivityMonitor::open(db.clone()).unwrap();
    let queue = PendingOpQueue::new(db, monitor, Arc::new(NullRemoteSink));
    queue
        .enqueue(OpAction::Create, EntityType::Draft, serde_json::Value::Null)
        .await
        .unwrap();
    assert!(queue.is_empty().unwrap());
}

#[tokio::test]
async fn drain_resumes_after_process_died_mid_sync() {
    let (db, monitor, _sink, queue) = setup();
    monitor.go_offline().unwrap();
    queue
        .enqueue(OpAction::Update, EntityType::Draft, tag("stranded"))
        .await
        .unwrap();
    monitor.go_online().unwrap();
    monitor.begin_sync().unwrap();
    drop(queue);
    drop(monitor);

    let monitor = ConnectivityMonitor::open(db.clone()).unwrap();
    assert_eq!(monitor.state(), Connectivity::Online);
    let sink = Arc::new(ScriptedSink::default());
    let queue = PendingOpQueue::new(db, monitor.clone(), sink.clone());

    let report = queue.drain().await.unwrap();
    assert_eq!(report, DrainReport { applied: 1, remaining: 0 });
    assert_eq!(sink.applied(), vec!["stranded"]);
    assert_eq!(monitor.state(), Connectivity::Online);
}

/// Accepts the operation, then removes the queue table underneath the drain.
struct TableDroppingSink {
    db: SharedDb,
}

#[async_trait::async_trait]
impl RemoteSink for TableDroppingSink {
    async fn apply(&self, _operation: &PendingOperation) -> anyhow::Result<()> {
        self.db
            .lock()
            .connection()
            .execute_batch("DROP TABLE pending_ops")?;
        Ok(())
    }
}

#[tokio::test]
async fn store_failure_mid_drain_leaves_syncing() {
    let db = DraftDb::open_in_memory().unwrap().into_shared();
    let monitor = ConnectivityMonitor::open(db.clone()).unwrap();
    monitor.go_offline().unwrap();
    let sink = Arc::new(TableDroppingSink { db: db.clone() });
    let queue = PendingOpQueue::new(db, monitor.clone(), sink);
    queue
        .enqueue(OpAction::Update, EntityType::Draft, tag("doomed"))
        .await
        .unwrap();

    monitor.go_online().unwrap();
    let err = queue.drain().await.unwrap_err();
    assert!(matches!(err, OfflineError::Store(_)));
    assert_eq!(monitor.state(), Connectivity::Online);
}

/// Never answers within the test's patience.
struct StalledSink;

#[async_trait::async_trait]
impl RemoteSink for StalledSink {
    async fn apply(&self, _operation: &PendingOperation) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn abandoned_drain_leaves_syncing() {
    let db = DraftDb::open_in_memory().unwrap().into_shared();
    let monitor = ConnectivityMonitor::open(db.clone()).unwrap();
    monitor.go_offline().unwrap();
    let queue = PendingOpQueue::new(db, monitor.clone(), Arc::new(StalledSink));
    queue
        .enqueue(OpAction::Update, EntityType::Draft, tag("slow"))
        .await
        .unwrap();

    monitor.go_online().unwrap();
    let timed_out = tokio::time::timeout(Duration::from_secs(5), queue.drain()).await;
    assert!(timed_out.is_err());
    assert_eq!(monitor.state(), Connectivity::Online);
    assert_eq!(queue.len().unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn quick_offline_online_flip_still_drains() {
    let (_db, monitor, sink, queue) = setup();
    let task = queue.spawn_reconnect_drain();

    // no await between the two signals, the watcher only sees "online"
    monitor.go_offline().unwrap();
    queue
        .enqueue(OpAction::Update, EntityType::Draft, tag("flipped"))
        .await
        .unwrap();
    monitor.go_online().unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(sink.applied(), vec!["flipped"]);
    assert!(queue.is_empty().unwrap());
    assert_eq!(monitor.state(), Connectivity::Online);

    task.abort();
}
