//! Several tabs on one hub, driven the way an editor process drives them.
use autosave::DocumentPersistence;
use offline::{Connectivity, ConnectivityMonitor, NullRemoteSink, PendingOpQueue};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use store::{DraftDb, DraftService, EngineConfig, SharedDb, VersionMetadata, VersionStore};
use tabs::*;

fn record(channel: &CrossTabChannel, kind: TabEventKind) -> (Arc<Mutex<Vec<TabEvent>>>, Subscription) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let sub = channel
        .subscribe(kind, move |event| {
            sink.lock().push(event.clone());
            Ok(())
        })
        .unwrap();
    (seen, sub)
}

fn shared_db() -> SharedDb {
    DraftDb::open_in_memory().unwrap().into_shared()
}

#[test]
fn connectivity_change_reaches_other_tab_in_one_pump() {
    let hub = TabHub::new(shared_db());
    let a = CrossTabChannel::open(&hub).unwrap();
    let b = CrossTabChannel::open(&hub).unwrap();
    assert_eq!(hub.live_tabs(), 2);
    let (seen, _sub) = record(&b, TabEventKind::ConnectivityChanged);

    a.set_connectivity(Connectivity::Offline).unwrap();
    assert_eq!(b.pump().unwrap(), 1);

    let seen = seen.lock();
    assert_eq!(seen[0].origin, a.id());
    assert_eq!(seen[0].data, serde_json::json!("offline"));
    assert_eq!(b.state().connectivity, Connectivity::Offline);
}

#[test]
fn late_tab_inherits_durable_state() {
    let hub = TabHub::new(shared_db());
    let a = CrossTabChannel::open(&hub).unwrap();
    a.set_current_project(Some("p1")).unwrap();
    a.set_current_draft(Some("d1")).unwrap();
    a.set_connectivity(Connectivity::Offline).unwrap();
    a.close();

    let late = CrossTabChannel::open(&hub).unwrap();
    let state = late.state();
    assert_eq!(state.current_project_id.as_deref(), Some("p1"));
    assert_eq!(state.current_draft_id.as_deref(), Some("d1"));
    assert_eq!(state.connectivity, Connectivity::Offline);
}

#[test]
fn last_committed_write_wins_everywhere() {
    let hub = TabHub::new(shared_db());
    let a = CrossTabChannel::open(&hub).unwrap();
    let b = CrossTabChannel::open(&hub).unwrap();

    let draft_a = EditorSnapshot {
        cursor_position: 3,
        unsaved_content: Some("from a".into()),
        ..EditorSnapshot::default()
    };
    let draft_b = EditorSnapshot {
        cursor_position: 9,
        unsaved_content: Some("from b".into()),
        ..EditorSnapshot::default()
    };
    a.set_editor_state(Some(&draft_a)).unwrap();
    b.set_editor_state(Some(&draft_b)).unwrap();

    a.pump().unwrap();
    b.pump().unwrap();

    // a's unsaved edit is discarded in favour of the later commit
    assert_eq!(a.state().editor_state, Some(draft_b.clone()));
    assert_eq!(b.state().editor_state, Some(draft_b));
}

#[test]
fn resync_picks_up_writes_made_without_broadcast() {
    let db = shared_db();
    let hub = TabHub::new(db.clone());
    let a = CrossTabChannel::open(&hub).unwrap();
    let (seen, _sub) = record(&a, TabEventKind::DraftChanged);

    // a second process sharing the database, invisible to this hub
    let other = TabHub::new(db);
    let remote = CrossTabChannel::open(&other).unwrap();
    remote.set_current_draft(Some("elsewhere")).unwrap();

    assert_eq!(a.pump().unwrap(), 0);
    assert_eq!(a.resync().unwrap(), 1);
    assert_eq!(a.state().current_draft_id.as_deref(), Some("elsewhere"));
    assert_eq!(seen.lock().len(), 1);
}

struct Editor {
    hub: TabHub,
    persistence: DocumentPersistence,
    monitor: ConnectivityMonitor,
    config: EngineConfig,
    draft_id: String,
}

fn editor() -> Editor {
    let db = shared_db();
    let config = EngineConfig::default();
    let monitor = ConnectivityMonitor::open(db.clone()).unwrap();
    monitor.go_offline().unwrap();
    let persistence = DocumentPersistence::new(
        Arc::new(DraftService::new(db.clone(), &config)),
        Arc::new(VersionStore::new(db.clone(), &config)),
        PendingOpQueue::new(db.clone(), monitor.clone(), Arc::new(NullRemoteSink)),
    );
    let project = persistence.drafts().create_project("Letters", None).unwrap();
    let draft = persistence
        .drafts()
        .create_draft(&project.id, "Dear reader", "Hello")
        .unwrap();
    Editor {
        hub: TabHub::new(db),
        persistence,
        monitor,
        config,
        draft_id: draft.id,
    }
}

fn open_session(editor: &Editor) -> EditorSession {
    let channel = CrossTabChannel::open(&editor.hub).unwrap();
    EditorSession::open(
        channel,
        editor.persistence.clone(),
        editor.monitor.clone(),
        &editor.config,
        &editor.draft_id,
    )
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn debounced_save_is_announced_to_other_tabs() {
    let editor = editor();
    let session = open_session(&editor);
    let watcher = CrossTabChannel::open(&editor.hub).unwrap();
    assert_eq!(
        watcher.state().current_draft_id.as_deref(),
        Some(editor.draft_id.as_str())
    );
    let (saved, _sub) = record(&watcher, TabEventKind::DraftSaved);

    session.edit("Hello world", 11).unwrap();
    watcher.pump().unwrap();
    let unsaved = watcher.state().editor_state.unwrap();
    assert_eq!(unsaved.unsaved_content.as_deref(), Some("Hello world"));
    assert_eq!(unsaved.cursor_position, 11);

    tokio::time::sleep(Duration::from_secs(3)).await;
    watcher.pump().unwrap();

    let saved = saved.lock();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].data["status"], "saved");
    let state = watcher.state();
    let snapshot = state.editor_state.unwrap();
    assert_eq!(snapshot.unsaved_content, None);
    assert!(snapshot.last_saved.is_some());
    assert_eq!(state.pending_sync.len(), 1);
    assert_eq!(
        editor.persistence.drafts().get_draft(&editor.draft_id).unwrap().content,
        "Hello world"
    );

    session.close();
}

#[tokio::test(start_paused = true)]
async fn restore_rewrites_draft_and_notifies() {
    let editor = editor();
    let versions = editor.persistence.versions();
    let first = versions
        .create_version(&editor.draft_id, "Hello", 1, VersionMetadata::manual("first"))
        .unwrap();
    versions
        .create_version(&editor.draft_id, "Hello again", 2, VersionMetadata::auto_save())
        .unwrap();

    let session = open_session(&editor);
    let watcher = CrossTabChannel::open(&editor.hub).unwrap();
    let (restored, _sub) = record(&watcher, TabEventKind::VersionRestored);

    let version = session.restore_version(first).await.unwrap();
    assert_eq!(version.content, "Hello");
    assert_eq!(
        editor.persistence.drafts().get_draft(&editor.draft_id).unwrap().content,
        "Hello"
    );
    assert_eq!(versions.version_count(&editor.draft_id).unwrap(), 2);
    assert_eq!(session.scheduler().last_saved_content().as_deref(), Some("Hello"));

    watcher.pump().unwrap();
    let restored = restored.lock();
    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].data["versionId"], first.to_string());

    assert!(matches!(
        session.restore_version(store::VersionId::new()).await,
        Err(TabError::Store(e)) if e.is_not_found()
    ));
}

fn queued_contents(editor: &Editor) -> Vec<String> {
    editor
        .persistence
        .queue()
        .pending()
        .unwrap()
        .into_iter()
        .map(|op| op.payload["content"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn restore_drops_a_pending_debounce() {
    let editor = editor();
    let first = editor
        .persistence
        .versions()
        .create_version(&editor.draft_id, "Hello", 1, VersionMetadata::manual("first"))
        .unwrap();
    let session = open_session(&editor);

    session.edit("stray typing", 12).unwrap();
    session.restore_version(first).await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(
        editor.persistence.drafts().get_draft(&editor.draft_id).unwrap().content,
        "Hello"
    );
    assert_eq!(queued_contents(&editor), vec!["Hello"]);
    session.close();
}

#[tokio::test(start_paused = true)]
async fn restored_content_is_queued_for_sync() {
    let editor = editor();
    let first = editor
        .persistence
        .versions()
        .create_version(&editor.draft_id, "Hello", 1, VersionMetadata::manual("first"))
        .unwrap();
    let session = open_session(&editor);

    assert!(session.save("Hello there").await.is_saved());
    session.restore_version(first).await.unwrap();

    assert_eq!(queued_contents(&editor), vec!["Hello there", "Hello"]);
    session.close();
}

#[tokio::test(start_paused = true)]
async fn checkpoint_stores_sanitized_content() {
    let editor = editor();
    let session = open_session(&editor);

    let saved = session.save("Hello\u{0} world").await;
    assert!(saved.is_saved());
    let id = session.checkpoint("clean").await.unwrap();

    let version = editor.persistence.versions().get_version(id).unwrap();
    assert_eq!(version.content, "Hello world");
    assert!(!version.content.contains('\u{0}'));
    session.close();
}

#[tokio::test(start_paused = true)]
async fn checkpoint_names_the_saved_content() {
    let editor = editor();
    let session = open_session(&editor);

    assert!(session.save("Hello, chapter two").await.is_saved());
    let id = session.checkpoint("end of day").await.unwrap();

    let versions = editor.persistence.versions();
    let current = versions.current_version(&editor.draft_id).unwrap().unwrap();
    assert_eq!(current.id, id);
    assert_eq!(current.content, "Hello, chapter two");
    assert_eq!(current.metadata.comment.as_deref(), Some("end of day"));
    assert_eq!(versions.version_count(&editor.draft_id).unwrap(), 2);

    session.close();
}

#[tokio::test(start_paused = true)]
async fn connectivity_and_drain_are_bridged() {
    let editor = editor();
    let session = open_session(&editor);
    let watcher = CrossTabChannel::open(&editor.hub).unwrap();
    let (drained, _sub) = record(&watcher, TabEventKind::QueueDrained);

    assert!(session.save("Hello there").await.is_saved());
    tokio::time::sleep(Duration::from_millis(10)).await;
    watcher.pump().unwrap();
    assert_eq!(watcher.state().pending_sync.len(), 1);

    editor.monitor.go_online().unwrap();
    editor.persistence.queue().drain().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    watcher.pump().unwrap();

    let state = watcher.state();
    assert_eq!(state.connectivity, Connectivity::Online);
    assert!(state.pending_sync.is_empty());
    assert_eq!(drained.lock().len(), 1);
    assert_eq!(drained.lock()[0].data["applied"], 1);

    let channel = session.channel().clone();
    session.close();
    assert!(channel.is_closed());
    assert!(matches!(
        channel.set_connectivity(Connectivity::Offline),
        Err(TabError::Closed)
    ));
}
