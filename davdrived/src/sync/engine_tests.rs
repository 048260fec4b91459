use super::*;
use crate::sync::backoff::Backoff;
use crate::sync::context::SyncConfig;
use crate::sync::events::EventBus;
use crate::sync::local_item::ItemLifecycle;
use crate::sync::mapping::Mapping;
use crate::sync::monitor::{
    EventFilter, MonitorConfig, MonitorMode, MonitorState, PlaceholderFilter, RemoteMonitor,
};
use crate::sync::placeholder::{DirPlaceholderFs, PlaceholderFs};
use crate::sync::side_store::{LockMode, SideStore, column_ids};
use crate::sync::testing::MemoryRemote;
use davdrive_core::{
    ChangeConnection, ChangeFeedError, ChangeKind, ChangeSource, LockInfo, RemoteStore,
};
use reqwest::StatusCode;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::{TempDir, tempdir};

struct Harness {
    _dir: TempDir,
    root: PathBuf,
    remote: Arc<MemoryRemote>,
    fs: Arc<DirPlaceholderFs>,
    engine: SyncEngine,
}

fn test_config() -> SyncConfig {
    SyncConfig {
        current_user: Some("me".into()),
        retry_backoff: Backoff::fixed(Duration::from_millis(1)),
        ..SyncConfig::default()
    }
}

fn harness_at(remote_root: &str, config: SyncConfig) -> Harness {
    let dir = tempdir().unwrap();
    let root = dir.path().join("drive");
    std::fs::create_dir_all(&root).unwrap();
    let remote = Arc::new(MemoryRemote::new("me"));
    if remote_root != "/" {
        remote.put_folder(remote_root);
    }
    let fs = Arc::new(DirPlaceholderFs::new(&root, dir.path().join("placeholders")));
    let ctx = DriveContext::new(
        Mapping::new(&root, remote_root),
        SideStore::new(dir.path().join("side-store")),
        fs.clone(),
        remote.clone(),
        config,
    );
    let engine = SyncEngine::new(Arc::new(ctx), CancellationToken::new());
    Harness {
        _dir: dir,
        root,
        remote,
        fs,
        engine,
    }
}

fn harness() -> Harness {
    harness_at("/", test_config())
}

impl Harness {
    fn ctx(&self) -> &Arc<DriveContext> {
        self.engine.context()
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    fn write(&self, relative: &str, content: &str) -> PathBuf {
        let path = self.path(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    fn read(&self, relative: &str) -> String {
        std::fs::read_to_string(self.path(relative)).unwrap()
    }

    async fn etag(&self, relative: &str) -> Option<String> {
        self.ctx()
            .side_store
            .get_etag(Path::new(relative))
            .await
            .unwrap()
    }
}

fn foreign_lock(owner: &str) -> LockInfo {
    LockInfo {
        token: String::new(),
        owner: owner.into(),
        exclusive: true,
        expires_at: None,
    }
}

#[tokio::test]
async fn new_local_file_is_created_remotely() {
    let h = harness();
    let path = h.write("doc.txt", "hello");
    assert!(h.ctx().items().is_new(&path).await.unwrap());

    let report = h.engine.full_pass().await.unwrap();

    assert_eq!(report.uploaded, 1);
    assert_eq!(report.failures, 0);
    assert_eq!(h.remote.content("/doc.txt").as_deref(), Some("hello"));
    assert_eq!(h.etag("doc.txt").await, h.remote.etag("/doc.txt"));
    assert!(!h.ctx().items().is_new(&path).await.unwrap());
}

#[tokio::test]
async fn second_full_pass_changes_nothing() {
    let h = harness();
    h.write("local.txt", "local");
    h.write("nested/inner.txt", "inner");
    h.remote.put_folder("/shared");
    h.remote.put_file("/shared/remote.txt", "remote");

    let first = h.engine.full_pass().await.unwrap();
    assert!(first.mutations() > 0);
    assert_eq!(first.failures, 0);
    let remote_mutations = h.remote.mutations();

    let second = h.engine.full_pass().await.unwrap();
    assert_eq!(second.mutations(), 0);
    assert_eq!(second.failures, 0);
    assert_eq!(h.remote.mutations(), remote_mutations);
}

#[tokio::test]
async fn new_folder_brings_its_contents() {
    let h = harness();
    let folder = h.path("album");
    h.write("album/one.txt", "1");
    h.write("album/sub/two.txt", "22");

    let outcome = h.engine.outgoing().create(&folder).await.unwrap();

    assert_eq!(outcome, SyncOutcome::Synced);
    assert!(h.remote.exists("/album/sub"));
    assert_eq!(h.remote.content("/album/one.txt").as_deref(), Some("1"));
    assert_eq!(h.remote.content("/album/sub/two.txt").as_deref(), Some("22"));
}

#[tokio::test]
async fn remote_file_arrives_offline_and_hydrates_when_pinned() {
    let h = harness();
    h.remote.put_folder("/docs");
    h.remote.put_file("/docs/report.txt", "remote body");

    let report = h.engine.full_pass().await.unwrap();
    assert_eq!(report.created, 2);

    let path = h.path("docs/report.txt");
    let items = h.ctx().items();
    assert!(items.is_offline(&path).await.unwrap());
    assert!(items.in_sync(&path).await.unwrap());
    assert_eq!(h.read("docs/report.txt"), "");

    let mut attributes = h.fs.attributes(&path).await.unwrap();
    attributes.pinned = true;
    h.fs.set_attributes(&path, attributes).await.unwrap();

    let report = h.engine.full_pass().await.unwrap();
    assert_eq!(report.hydrated, 1);
    assert_eq!(h.read("docs/report.txt"), "remote body");
    assert!(!items.is_offline(&path).await.unwrap());
    assert!(items.in_sync(&path).await.unwrap());
}

#[tokio::test]
async fn remote_update_replaces_in_sync_content() {
    let h = harness();
    let path = h.write("report.xlsx", "first");
    h.engine.full_pass().await.unwrap();
    let first = h.etag("report.xlsx").await;

    let second = h.remote.put_file("/report.xlsx", "second version");
    let outcome = h
        .engine
        .incoming()
        .apply(&ChangeEvent::new(ChangeKind::Updated, "/report.xlsx"))
        .await
        .unwrap();

    assert_eq!(outcome, SyncOutcome::Synced);
    assert_ne!(first.as_deref(), Some(second.as_str()));
    assert_eq!(h.read("report.xlsx"), "second version");
    assert_eq!(h.etag("report.xlsx").await, Some(second));
    assert!(h.ctx().items().in_sync(&path).await.unwrap());
}

#[tokio::test]
async fn concurrent_edits_raise_conflict_and_keep_local_content() {
    let h = harness();
    let path = h.write("plan.txt", "first");
    h.engine.full_pass().await.unwrap();
    let base = h.etag("plan.txt").await;

    h.remote.put_file("/plan.txt", "remote edit");
    std::fs::write(&path, "local edit, not yet uploaded").unwrap();
    let remote_mutations = h.remote.mutations();

    let err = h
        .engine
        .incoming()
        .apply(&ChangeEvent::new(ChangeKind::Updated, "/plan.txt"))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Conflict(_)));
    assert_eq!(h.read("plan.txt"), "local edit, not yet uploaded");
    assert_eq!(h.etag("plan.txt").await, base);

    let err = h.engine.outgoing().update(&path).await.unwrap_err();
    assert!(matches!(err, SyncError::Conflict(_)));
    assert_eq!(h.remote.content("/plan.txt").as_deref(), Some("remote edit"));
    assert_eq!(h.remote.mutations(), remote_mutations);
    assert!(
        h.ctx()
            .has_conflict(Path::new("plan.txt"))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn conflicts_resolve_either_way() {
    let h = harness();
    let mine = h.write("mine.txt", "base");
    let theirs = h.write("theirs.txt", "base");
    h.engine.full_pass().await.unwrap();

    h.remote.put_file("/mine.txt", "remote mine");
    h.remote.put_file("/theirs.txt", "remote theirs");
    std::fs::write(&mine, "local mine!").unwrap();
    std::fs::write(&theirs, "local theirs!").unwrap();
    assert!(h.engine.outgoing().update(&mine).await.is_err());
    assert!(h.engine.outgoing().update(&theirs).await.is_err());

    h.engine.outgoing().take_local(&mine).await.unwrap();
    assert_eq!(h.remote.content("/mine.txt").as_deref(), Some("local mine!"));
    assert_eq!(h.etag("mine.txt").await, h.remote.etag("/mine.txt"));
    assert!(!h.ctx().has_conflict(Path::new("mine.txt")).await.unwrap());

    h.engine.incoming().take_remote(&theirs).await.unwrap();
    assert_eq!(h.read("theirs.txt"), "remote theirs");
    assert_eq!(h.etag("theirs.txt").await, h.remote.etag("/theirs.txt"));
    assert!(!h.ctx().has_conflict(Path::new("theirs.txt")).await.unwrap());

    let report = h.engine.full_pass().await.unwrap();
    assert_eq!(report.mutations(), 0);
}

#[tokio::test]
async fn local_rename_moves_remote_item() {
    let h = harness();
    let from = h.write("a.txt", "body");
    h.engine.full_pass().await.unwrap();
    let etag = h.etag("a.txt").await;
    let remote_mutations = h.remote.mutations();

    let to = h.path("b.txt");
    std::fs::rename(&from, &to).unwrap();
    h.engine
        .handle_local_event(LocalEvent::Renamed {
            from: from.clone(),
            to: to.clone(),
        })
        .await;

    assert!(!h.remote.exists("/a.txt"));
    assert_eq!(h.remote.content("/b.txt").as_deref(), Some("body"));
    assert_eq!(h.remote.mutations(), remote_mutations + 1);
    assert_eq!(h.etag("a.txt").await, None);
    assert_eq!(h.etag("b.txt").await, etag);
    assert_eq!(
        h.ctx().items().original_path(&to).await.unwrap(),
        Some(PathBuf::from("b.txt"))
    );
    assert_eq!(h.engine.full_pass().await.unwrap().mutations(), 0);
}

#[tokio::test]
async fn rename_halves_in_separate_batches_move_the_remote_item() {
    let h = harness();
    let from = h.write("a.txt", "body");
    h.engine.full_pass().await.unwrap();
    let etag = h.etag("a.txt").await;
    let remote_mutations = h.remote.mutations();

    let to = h.path("b.txt");
    std::fs::rename(&from, &to).unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    let feed = async {
        tx.send(LocalEvent::MovedAway {
            path: from.clone(),
            tracker: Some(7),
        })
        .unwrap();
        // Lets the old half go through as a batch of its own.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.remote.exists("/a.txt"));
        tx.send(LocalEvent::MovedIn {
            path: to.clone(),
            tracker: Some(7),
        })
        .unwrap();
        drop(tx);
    };
    tokio::join!(h.engine.run_local_events(rx), feed);

    assert!(!h.remote.exists("/a.txt"));
    assert_eq!(h.remote.content("/b.txt").as_deref(), Some("body"));
    assert_eq!(h.remote.mutations(), remote_mutations + 1);
    assert_eq!(h.etag("b.txt").await, etag);
}

#[tokio::test]
async fn unpaired_old_half_deletes_once_the_window_passes() {
    let h = harness_at(
        "/",
        SyncConfig {
            rename_window: Duration::from_millis(10),
            ..test_config()
        },
    );
    let path = h.write("gone.txt", "bye");
    h.engine.full_pass().await.unwrap();

    std::fs::remove_file(&path).unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    let feed = async {
        tx.send(LocalEvent::MovedAway {
            path: path.clone(),
            tracker: Some(1),
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!h.remote.exists("/gone.txt"));
        drop(tx);
    };
    tokio::join!(h.engine.run_local_events(rx), feed);

    assert_eq!(h.etag("gone.txt").await, None);
}

#[tokio::test]
async fn rename_after_a_premature_delete_still_uploads_the_edit() {
    let h = harness();
    let from = h.write("a.txt", "body");
    h.engine.full_pass().await.unwrap();

    h.write("a.txt", "edited before rename");
    let to = h.path("b.txt");
    std::fs::rename(&from, &to).unwrap();
    h.engine
        .handle_local_event(LocalEvent::Removed { path: from.clone() })
        .await;
    h.engine
        .handle_local_event(LocalEvent::Renamed {
            from,
            to: to.clone(),
        })
        .await;

    assert!(!h.remote.exists("/a.txt"));
    assert_eq!(
        h.remote.content("/b.txt").as_deref(),
        Some("edited before rename")
    );
    assert_eq!(h.etag("b.txt").await, h.remote.etag("/b.txt"));
    assert_eq!(
        h.ctx().items().lifecycle(&to).await.unwrap(),
        ItemLifecycle::InSync
    );
}

/// Syncs `a.txt`, edits it and renames it to `b.txt`; the rename is refused.
async fn refused_edited_rename(h: &Harness) -> PathBuf {
    let from = h.write("a.txt", "body");
    h.engine.full_pass().await.unwrap();

    h.write("a.txt", "edited before rename");
    let to = h.path("b.txt");
    std::fs::rename(&from, &to).unwrap();
    let mut events = h.engine.subscribe();
    h.engine
        .handle_local_event(LocalEvent::Renamed {
            from,
            to: to.clone(),
        })
        .await;

    let mut conflicts = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, SyncEvent::Conflict { ref path } if *path == to) {
            conflicts += 1;
        }
    }
    assert_eq!(conflicts, 1);
    to
}

#[tokio::test]
async fn moving_an_edited_file_is_flagged_and_left_alone() {
    let h = harness();
    let to = refused_edited_rename(&h).await;

    assert_eq!(
        h.ctx().items().lifecycle(&to).await.unwrap(),
        ItemLifecycle::Conflicted
    );
    assert!(h.ctx().has_conflict(Path::new("b.txt")).await.unwrap());
    for _ in 0..3 {
        let report = h.engine.full_pass().await.unwrap();
        assert_eq!(report.failures, 0);
        assert_eq!(report.mutations(), 0);
    }
    assert!(!h.path("a.txt").exists());
    assert_eq!(h.read("b.txt"), "edited before rename");
    assert_eq!(h.remote.content("/a.txt").as_deref(), Some("body"));
    assert!(!h.remote.exists("/b.txt"));
}

#[tokio::test]
async fn refused_move_resolves_with_the_local_copy() {
    let h = harness();
    let to = refused_edited_rename(&h).await;

    let outcome = h.engine.outgoing().take_local(&to).await.unwrap();

    assert_eq!(outcome, SyncOutcome::Synced);
    assert!(!h.remote.exists("/a.txt"));
    assert_eq!(
        h.remote.content("/b.txt").as_deref(),
        Some("edited before rename")
    );
    assert_eq!(h.etag("a.txt").await, None);
    assert_eq!(h.etag("b.txt").await, h.remote.etag("/b.txt"));
    assert_eq!(
        h.ctx().items().lifecycle(&to).await.unwrap(),
        ItemLifecycle::InSync
    );
    assert_eq!(h.engine.full_pass().await.unwrap().mutations(), 0);
}

#[tokio::test]
async fn refused_move_resolves_with_the_remote_copy() {
    let h = harness();
    let to = refused_edited_rename(&h).await;

    let outcome = h.engine.incoming().take_remote(&to).await.unwrap();

    assert_eq!(outcome, SyncOutcome::Synced);
    let home = h.path("a.txt");
    assert!(!to.exists());
    assert_eq!(h.read("a.txt"), "body");
    assert_eq!(h.remote.content("/a.txt").as_deref(), Some("body"));
    assert!(!h.remote.exists("/b.txt"));
    assert_eq!(h.etag("a.txt").await, h.remote.etag("/a.txt"));
    assert!(!h.ctx().has_conflict(Path::new("b.txt")).await.unwrap());
    assert_eq!(
        h.ctx().items().lifecycle(&home).await.unwrap(),
        ItemLifecycle::InSync
    );
    assert_eq!(h.engine.full_pass().await.unwrap().mutations(), 0);
}

#[tokio::test]
async fn one_failing_item_does_not_stop_the_pass() {
    let h = harness();
    h.write("a.txt", "a");
    let failing = h.write("b.txt", "b");
    h.write("c.txt", "c");
    h.remote.fail_path("/b.txt", Some(StatusCode::INTERNAL_SERVER_ERROR));
    let mut events = h.engine.subscribe();

    let report = h.engine.full_pass().await.unwrap();

    assert_eq!(report.failures, 1);
    assert_eq!(report.uploaded, 2);
    assert!(h.remote.exists("/a.txt"));
    assert!(h.remote.exists("/c.txt"));
    assert!(!h.remote.exists("/b.txt"));
    assert_eq!(h.etag("b.txt").await, None);
    assert!(h.ctx().items().is_new(&failing).await.unwrap());
    let mut failed = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::ItemFailed { path, .. } = event {
            failed.push(path);
        }
    }
    assert_eq!(failed, vec![failing.clone()]);

    h.remote.fail_path("/b.txt", None);
    let report = h.engine.full_pass().await.unwrap();
    assert_eq!(report.failures, 0);
    assert_eq!(report.uploaded, 1);
    assert_eq!(h.etag("b.txt").await, h.remote.etag("/b.txt"));
}

#[tokio::test]
async fn transient_remote_failure_is_retried_within_the_upload() {
    let h = harness();
    let path = h.write("doc.txt", "v1");
    h.engine.full_pass().await.unwrap();
    let remote_mutations = h.remote.mutations();

    h.write("doc.txt", "second version");
    h.remote.fail_next(StatusCode::SERVICE_UNAVAILABLE);
    h.engine
        .handle_local_event(LocalEvent::Changed { path: path.clone() })
        .await;

    assert_eq!(h.remote.content("/doc.txt").as_deref(), Some("second version"));
    assert_eq!(h.remote.mutations(), remote_mutations + 1);
    assert_eq!(h.etag("doc.txt").await, h.remote.etag("/doc.txt"));
    assert!(h.ctx().items().in_sync(&path).await.unwrap());
}

#[tokio::test]
async fn editor_save_through_temp_file_uploads_once() {
    let h = harness();
    let doc = h.write("doc.docx", "first save");
    h.engine.full_pass().await.unwrap();
    let remote_mutations = h.remote.mutations();

    let temp = h.write("~WRL0001.tmp", "second save");
    std::fs::remove_file(&doc).unwrap();
    std::fs::rename(&temp, &doc).unwrap();
    h.engine
        .handle_local_event(LocalEvent::Removed { path: doc.clone() })
        .await;
    h.engine
        .handle_local_event(LocalEvent::Renamed {
            from: temp,
            to: doc.clone(),
        })
        .await;

    assert_eq!(h.remote.content("/doc.docx").as_deref(), Some("second save"));
    assert!(!h.remote.exists("/~WRL0001.tmp"));
    assert_eq!(h.remote.mutations(), remote_mutations + 1);
    assert_eq!(h.etag("doc.docx").await, h.remote.etag("/doc.docx"));
}

#[tokio::test]
async fn remote_delete_removes_unmodified_local_copy() {
    let h = harness();
    let path = h.write("old.txt", "old");
    h.engine.full_pass().await.unwrap();
    assert!(
        !h.ctx()
            .side_store
            .columns(Path::new("old.txt"))
            .await
            .unwrap()
            .is_empty()
    );

    h.remote.remove("/old.txt");
    let outcome = h
        .engine
        .incoming()
        .apply(&ChangeEvent::new(ChangeKind::Deleted, "/old.txt"))
        .await
        .unwrap();

    assert_eq!(outcome, SyncOutcome::Synced);
    assert!(!path.exists());
    assert_eq!(h.etag("old.txt").await, None);
    assert!(
        h.ctx()
            .side_store
            .columns(Path::new("old.txt"))
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn remote_delete_keeps_locally_modified_copy() {
    let h = harness();
    let path = h.write("keep.txt", "v1");
    h.engine.full_pass().await.unwrap();
    std::fs::write(&path, "edited locally").unwrap();

    h.remote.remove("/keep.txt");
    let err = h
        .engine
        .incoming()
        .apply(&ChangeEvent::new(ChangeKind::Deleted, "/keep.txt"))
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::Conflict(_)));
    assert_eq!(h.read("keep.txt"), "edited locally");
}

#[tokio::test]
async fn local_delete_removes_remote_item() {
    let h = harness();
    let path = h.write("gone.txt", "bye");
    h.engine.full_pass().await.unwrap();

    std::fs::remove_file(&path).unwrap();
    h.engine
        .handle_local_event(LocalEvent::Removed { path })
        .await;

    assert!(!h.remote.exists("/gone.txt"));
    assert_eq!(h.etag("gone.txt").await, None);
}

#[tokio::test]
async fn remote_move_relocates_local_item() {
    let h = harness();
    h.remote.put_folder("/a");
    h.remote.put_file("/a/x.txt", "x");
    h.engine.full_pass().await.unwrap();

    h.remote.rename("/a/x.txt", "/a/y.txt");
    let outcome = h
        .engine
        .incoming()
        .apply(&ChangeEvent::moved("/a/x.txt", "/a/y.txt"))
        .await
        .unwrap();

    let moved = h.path("a/y.txt");
    assert_eq!(outcome, SyncOutcome::Synced);
    assert!(!h.path("a/x.txt").exists());
    assert!(moved.exists());
    assert_eq!(h.etag("a/x.txt").await, None);
    assert_eq!(h.etag("a/y.txt").await, h.remote.etag("/a/y.txt"));
    assert_eq!(
        h.ctx().items().original_path(&moved).await.unwrap(),
        Some(PathBuf::from("a/y.txt"))
    );

    // The echo of a move already applied is a no-op.
    let outcome = h
        .engine
        .incoming()
        .apply(&ChangeEvent::moved("/a/x.txt", "/a/y.txt"))
        .await
        .unwrap();
    assert_eq!(outcome, SyncOutcome::Unchanged);
}

#[tokio::test]
async fn moves_across_the_remote_root_become_create_or_delete() {
    let h = harness_at("/drive", test_config());
    h.remote.put_file("/outside.txt", "outside");
    h.engine.full_pass().await.unwrap();

    h.remote.rename("/outside.txt", "/drive/inside.txt");
    let outcome = h
        .engine
        .incoming()
        .apply(&ChangeEvent::moved("/outside.txt", "/drive/inside.txt"))
        .await
        .unwrap();
    assert_eq!(outcome, SyncOutcome::Synced);
    assert!(h.path("inside.txt").exists());

    h.remote.rename("/drive/inside.txt", "/elsewhere.txt");
    let outcome = h
        .engine
        .incoming()
        .apply(&ChangeEvent::moved("/drive/inside.txt", "/elsewhere.txt"))
        .await
        .unwrap();
    assert_eq!(outcome, SyncOutcome::Synced);
    assert!(!h.path("inside.txt").exists());
}

#[tokio::test]
async fn foreign_lock_marks_file_read_only_until_released() {
    let h = harness();
    let path = h.write("shared.txt", "shared");
    h.engine.full_pass().await.unwrap();
    let relative = Path::new("shared.txt");

    h.remote.set_lock("/shared.txt", Some(foreign_lock("bob")));
    let outcome = h
        .engine
        .incoming()
        .apply(&ChangeEvent::new(ChangeKind::Locked, "/shared.txt"))
        .await
        .unwrap();
    assert_eq!(outcome, SyncOutcome::Synced);
    assert!(h.fs.attributes(&path).await.unwrap().read_only);
    let stored = h.ctx().side_store.get_lock_info(relative).await.unwrap();
    assert_eq!(stored.map(|lock| lock.owner).as_deref(), Some("bob"));
    assert!(
        h.ctx()
            .side_store
            .has_column(relative, column_ids::LOCK_OWNER)
            .await
            .unwrap()
    );

    let err = h
        .engine
        .outgoing()
        .lock(&path, LockMode::Manual)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::LockedByAnother { ref owner, .. } if owner == "bob"));

    h.remote.set_lock("/shared.txt", None);
    let outcome = h
        .engine
        .incoming()
        .apply(&ChangeEvent::new(ChangeKind::Unlocked, "/shared.txt"))
        .await
        .unwrap();
    assert_eq!(outcome, SyncOutcome::Synced);
    assert!(!h.fs.attributes(&path).await.unwrap().read_only);
    assert!(
        h.ctx()
            .side_store
            .get_lock_info(relative)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn upload_to_foreign_locked_file_is_deferred() {
    let h = harness();
    let path = h.write("memo.txt", "memo");
    h.engine.full_pass().await.unwrap();

    h.remote.set_lock("/memo.txt", Some(foreign_lock("carol")));
    std::fs::write(&path, "memo, edited").unwrap();
    let outcome = h.engine.outgoing().update(&path).await.unwrap();

    assert_eq!(outcome, SyncOutcome::Deferred);
    assert_eq!(h.remote.content("/memo.txt").as_deref(), Some("memo"));
    assert!(!h.ctx().items().in_sync(&path).await.unwrap());
}

#[tokio::test]
async fn own_lock_is_sent_with_uploads_and_released() {
    let h = harness();
    let path = h.write("own.txt", "own");
    h.engine.full_pass().await.unwrap();
    let relative = Path::new("own.txt");

    let lock = h
        .engine
        .outgoing()
        .lock(&path, LockMode::Manual)
        .await
        .unwrap();
    assert_eq!(lock.owner, "me");
    assert_eq!(
        h.ctx().side_store.get_lock_mode(relative).await.unwrap(),
        LockMode::Manual
    );

    std::fs::write(&path, "edited under lock").unwrap();
    let outcome = h.engine.outgoing().update(&path).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Synced);
    assert_eq!(
        h.remote.content("/own.txt").as_deref(),
        Some("edited under lock")
    );

    h.engine
        .incoming()
        .apply(&ChangeEvent::new(ChangeKind::Locked, "/own.txt"))
        .await
        .unwrap();
    assert!(!h.fs.attributes(&path).await.unwrap().read_only);

    let outcome = h.engine.outgoing().unlock(&path).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Synced);
    assert!(
        h.ctx()
            .side_store
            .get_lock_info(relative)
            .await
            .unwrap()
            .is_none()
    );
    assert!(h.remote.get_item("/own.txt").await.unwrap().lock.is_none());
}

#[tokio::test]
async fn auto_lock_follows_open_and_close() {
    let h = harness_at(
        "/",
        SyncConfig {
            auto_lock: true,
            ..test_config()
        },
    );
    let path = h.write("draft.txt", "draft");
    h.engine.full_pass().await.unwrap();
    let relative = Path::new("draft.txt");

    h.engine
        .handle_local_event(LocalEvent::OpenedForWrite { path: path.clone() })
        .await;
    assert_eq!(
        h.ctx().side_store.get_lock_mode(relative).await.unwrap(),
        LockMode::Auto
    );
    assert!(h.remote.get_item("/draft.txt").await.unwrap().lock.is_some());

    std::fs::write(&path, "draft, revised").unwrap();
    h.engine
        .handle_local_event(LocalEvent::Closed { path: path.clone() })
        .await;
    assert_eq!(h.remote.content("/draft.txt").as_deref(), Some("draft, revised"));
    assert_eq!(
        h.ctx().side_store.get_lock_mode(relative).await.unwrap(),
        LockMode::None
    );
    assert!(h.remote.get_item("/draft.txt").await.unwrap().lock.is_none());
}

#[tokio::test]
async fn placeholder_filter_drops_changes_the_tree_cannot_use() {
    let h = harness();
    std::fs::create_dir_all(h.path("docs")).unwrap();
    h.write("docs/here.txt", "here");
    let filter = PlaceholderFilter::new(Arc::clone(h.ctx()));

    let accepted = [
        ChangeEvent::new(ChangeKind::Created, "/docs/new.txt"),
        ChangeEvent::new(ChangeKind::Updated, "/docs/here.txt"),
        ChangeEvent::new(ChangeKind::Deleted, "/docs/any.txt"),
        ChangeEvent::moved("/elsewhere/a.txt", "/docs/a.txt"),
    ];
    for event in &accepted {
        assert!(filter.accepts(event).await, "{event:?}");
    }

    let rejected = [
        ChangeEvent::new(ChangeKind::Created, "/missing/new.txt"),
        ChangeEvent::new(ChangeKind::Updated, "/docs/absent.txt"),
        ChangeEvent::new(ChangeKind::Deleted, "/missing/old.txt"),
        ChangeEvent::moved("/elsewhere/a.txt", "/missing/a.txt"),
    ];
    for event in &rejected {
        assert!(!filter.accepts(event).await, "{event:?}");
    }
}

struct ScriptedSource {
    scripts: Mutex<VecDeque<Vec<ChangeEvent>>>,
    connects: AtomicUsize,
}

struct ScriptedConnection {
    events: Option<VecDeque<ChangeEvent>>,
}

#[async_trait]
impl ChangeSource for ScriptedSource {
    async fn connect(&self) -> Result<Box<dyn ChangeConnection>, ChangeFeedError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let events = self.scripts.lock().unwrap().pop_front();
        Ok(Box::new(ScriptedConnection {
            events: events.map(VecDeque::from),
        }))
    }
}

#[async_trait]
impl ChangeConnection for ScriptedConnection {
    async fn next_event(&mut self) -> Result<Option<ChangeEvent>, ChangeFeedError> {
        match &mut self.events {
            Some(events) => Ok(events.pop_front()),
            None => std::future::pending().await,
        }
    }
}

#[derive(Default)]
struct SlowDispatcher {
    applied: AtomicUsize,
    passes: AtomicUsize,
}

#[async_trait]
impl ChangeDispatcher for SlowDispatcher {
    async fn full_pass(&self) -> Result<(), SyncError> {
        self.passes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn apply(&self, _event: &ChangeEvent) -> Result<SyncOutcome, SyncError> {
        tokio::time::sleep(Duration::from_millis(2)).await;
        self.applied.fetch_add(1, Ordering::SeqCst);
        Ok(SyncOutcome::Unchanged)
    }
}

struct AcceptAll;

#[async_trait]
impl EventFilter for AcceptAll {
    async fn accepts(&self, _event: &ChangeEvent) -> bool {
        true
    }
}

#[tokio::test]
async fn flooded_monitor_drops_excess_without_blocking() {
    let flood: Vec<ChangeEvent> = (0..500)
        .map(|i| ChangeEvent::new(ChangeKind::Updated, format!("/flood/{i}.txt")))
        .collect();
    let source = Arc::new(ScriptedSource {
        scripts: Mutex::new(VecDeque::from([flood])),
        connects: AtomicUsize::new(0),
    });
    let dispatcher = Arc::new(SlowDispatcher::default());
    let monitor = Arc::new(RemoteMonitor::new(
        source.clone(),
        dispatcher.clone(),
        Arc::new(AcceptAll),
        MonitorConfig {
            mode: MonitorMode::Crud,
            queue_capacity: 8,
            reconnect_delay: Duration::from_millis(10),
        },
        EventBus::default(),
    ));
    let mut state = monitor.watch_state();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let monitor = Arc::clone(&monitor);
        let cancel = cancel.clone();
        async move { monitor.run(cancel).await }
    });

    tokio::time::timeout(Duration::from_secs(5), async {
        while source.connects.load(Ordering::SeqCst) < 2
            || dispatcher.passes.load(Ordering::SeqCst) == 0
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("monitor reconnected after the flood");
    assert_eq!(*state.borrow_and_update(), MonitorState::Connected);

    cancel.cancel();
    let dropped = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("monitor stopped")
        .unwrap();

    assert!(dropped > 0);
    assert!(dispatcher.applied.load(Ordering::SeqCst) < 500);
    assert_eq!(monitor.state(), MonitorState::Disconnected);
}
