//! Integration tests for fleetctl
//!
//! These tests drive the components together over real store backends.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use fleetctl::bus::{BusConfig, MessageBus, bus_handler};
use fleetctl::config::{Config, StoreBackend};
use fleetctl::elevation::{
    AgentContext, DenialReason, ElevationConfig, ElevationManager, ElevationOutcome, PermissionLevel,
};
use fleetctl::lock::{LockConfig, LockError, LockManager};
use fleetctl::messages::{Message, MessageKind, MessageType, TaskRequest, TaskResponse};
use fleetctl::rollback::{ChangeType, FileSystem, LocalFileSystem, RollbackConfig, RollbackJournal};
use fleetctl::runtime::{ChangeScope, ControlPlane, FileChange, FileChangeOutcome, FileChangeRequest};
use sharedstore::{MemoryStore, SharedStore, SqliteStore};
use tempfile::TempDir;

// =============================================================================
// Distributed lock
// =============================================================================

#[tokio::test]
async fn test_two_processes_contend_for_one_lock() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db = temp_dir.path().join("fleet.db");

    // Two connections stand in for two agent processes
    let a: Arc<dyn SharedStore> = Arc::new(SqliteStore::open(&db).unwrap());
    let b: Arc<dyn SharedStore> = Arc::new(SqliteStore::open(&db).unwrap());
    let locks_a = LockManager::new(a, LockConfig::default());
    let locks_b = LockManager::new(b, LockConfig::default());

    let options = locks_a
        .default_options()
        .with_ttl(Duration::from_secs(5))
        .with_timeout(Duration::from_secs(1));

    let started = Instant::now();
    let (first, second) = tokio::join!(locks_a.acquire("x", options), locks_b.acquire("x", options));
    let elapsed = started.elapsed();

    let (winner, loser) = match (first, second) {
        (Ok(guard), Err(e)) | (Err(e), Ok(guard)) => (guard, e),
        (Ok(_), Ok(_)) => panic!("Both acquired the same lock"),
        (Err(a), Err(b)) => panic!("Neither acquired: {} / {}", a, b),
    };
    match loser {
        LockError::Timeout { waited, .. } => assert!(waited >= Duration::from_millis(900)),
        other => panic!("Wrong variant: {}", other),
    }
    assert!(elapsed >= Duration::from_millis(900));
    assert!(elapsed < Duration::from_secs(4));
    assert!(winner.owned().await.unwrap());

    // Once released the other side gets it immediately
    assert!(winner.release().await.unwrap());
    let guard = locks_b.try_acquire("x", Duration::from_secs(5)).await.unwrap();
    assert!(guard.is_some());
}

#[tokio::test]
async fn test_expired_holder_cannot_release_new_owner() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let locks = LockManager::new(store, LockConfig::default());

    let stale = locks
        .try_acquire("job", Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    let fresh = locks
        .try_acquire("job", Duration::from_secs(5))
        .await
        .unwrap()
        .expect("lock should be free after TTL");

    assert!(!stale.release().await.unwrap());
    assert!(!stale.extend(Duration::from_secs(60)).await.unwrap());
    assert!(fresh.owned().await.unwrap());
    assert!(locks.is_locked("job").await.unwrap());
}

// =============================================================================
// Message bus
// =============================================================================

#[tokio::test]
async fn test_concurrent_requests_get_their_own_replies() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let server = MessageBus::new(store.clone(), "worker", BusConfig::default());
    let client = MessageBus::new(store.clone(), "client", BusConfig::default());

    // Slow replies for "slow", fast for everything else, so replies arrive out of order
    server
        .register_handler(
            MessageType::TaskRequest,
            bus_handler(|message: Message| async move {
                let MessageKind::TaskRequest(request) = &message.kind else {
                    return Ok(None);
                };
                if request.task_type == "slow" {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                }
                Ok(Some(MessageKind::TaskResponse(TaskResponse::completed(
                    &message.id,
                    serde_json::json!({ "task_type": request.task_type }),
                ))))
            }),
        )
        .await;
    server.start().await.unwrap();
    client.start().await.unwrap();

    let slow = Message::new("client", MessageKind::TaskRequest(TaskRequest::new("slow", serde_json::Value::Null)));
    let fast = Message::new("client", MessageKind::TaskRequest(TaskRequest::new("fast", serde_json::Value::Null)));
    let (slow_id, fast_id) = (slow.id.clone(), fast.id.clone());

    let timeout = Some(Duration::from_secs(5));
    let (slow_reply, fast_reply) = tokio::join!(
        client.send_request("worker", slow, timeout),
        client.send_request("worker", fast, timeout)
    );
    let slow_reply = slow_reply.unwrap();
    let fast_reply = fast_reply.unwrap();

    assert_eq!(slow_reply.correlation_id.as_deref(), Some(slow_id.as_str()));
    assert_eq!(fast_reply.correlation_id.as_deref(), Some(fast_id.as_str()));
    match (&slow_reply.kind, &fast_reply.kind) {
        (MessageKind::TaskResponse(s), MessageKind::TaskResponse(f)) => {
            assert_eq!(s.task_id, slow_id);
            assert_eq!(f.task_id, fast_id);
        }
        _ => panic!("Wrong variant"),
    }
    assert_eq!(client.pending_count(), 0);

    // A reply nobody is waiting for is dropped without side effects
    let mut orphan = Message::new(
        "worker",
        MessageKind::TaskResponse(TaskResponse::completed("nobody", serde_json::Value::Null)),
    )
    .with_target("client");
    orphan.correlation_id = Some("no-such-request".to_string());
    server.send_response(&orphan).await.unwrap();
    for _ in 0..40 {
        if client.stats().unmatched_responses == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(client.stats().unmatched_responses, 1);
    assert_eq!(client.pending_count(), 0);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_request_to_silent_service_times_out() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let client = MessageBus::new(store, "client", BusConfig::default());
    client.start().await.unwrap();

    let request = Message::new("client", MessageKind::TaskRequest(TaskRequest::new("ping", serde_json::Value::Null)));
    let result = client
        .send_request("nobody-home", request, Some(Duration::from_millis(200)))
        .await;
    assert!(matches!(result, Err(fleetctl::BusError::Timeout { .. })));
    assert_eq!(client.pending_count(), 0);
    assert_eq!(client.stats().timeouts, 1);
    client.stop().await;
}

// =============================================================================
// Elevation
// =============================================================================

#[tokio::test]
async fn test_eleventh_auto_elevation_in_an_hour_is_rate_limited() {
    let manager = ElevationManager::new(ElevationConfig::default());
    let ctx = AgentContext::new("agent-7", "coder", PermissionLevel::STANDARD);

    for i in 0..10 {
        let outcome = manager
            .request_elevation(&ctx, PermissionLevel::ELEVATED, "write_file", None, "edit", None)
            .await;
        assert!(outcome.is_auto_approved(), "request {} should auto-approve", i + 1);
        let grant = outcome.grant().unwrap();
        assert_eq!(grant.expires_at - grant.granted_at, chrono::Duration::seconds(300));
    }

    match manager
        .request_elevation(&ctx, PermissionLevel::ELEVATED, "write_file", None, "edit", None)
        .await
    {
        ElevationOutcome::Denied { reason, .. } => assert_eq!(reason, DenialReason::RateLimited),
        other => panic!("Wrong variant: {:?}", other),
    }
    assert_eq!(manager.remaining_auto_elevations("coder").await, 0);

    // Another agent type has its own budget
    let other = AgentContext::new("agent-8", "reviewer", PermissionLevel::STANDARD);
    assert!(
        manager
            .request_elevation(&other, PermissionLevel::ELEVATED, "write_file", None, "edit", None)
            .await
            .is_auto_approved()
    );
}

// =============================================================================
// Rollback journal
// =============================================================================

/// In-memory filesystem that records every mutation in order
#[derive(Default)]
struct RecordingFs {
    files: Mutex<HashMap<PathBuf, String>>,
    ops: Mutex<Vec<String>>,
}

impl RecordingFs {
    fn put(&self, path: &str, content: &str) {
        self.files.lock().unwrap().insert(PathBuf::from(path), content.to_string());
    }

    fn get(&self, path: &str) -> Option<String> {
        self.files.lock().unwrap().get(Path::new(path)).cloned()
    }

    fn take_ops(&self) -> Vec<String> {
        std::mem::take(&mut *self.ops.lock().unwrap())
    }
}

#[async_trait]
impl FileSystem for RecordingFs {
    async fn read(&self, path: &Path) -> io::Result<Option<String>> {
        Ok(self.files.lock().unwrap().get(path).cloned())
    }

    async fn write(&self, path: &Path, content: &str) -> io::Result<()> {
        self.ops.lock().unwrap().push(format!("write {}", path.display()));
        self.files.lock().unwrap().insert(path.to_path_buf(), content.to_string());
        Ok(())
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        self.ops.lock().unwrap().push(format!("remove {}", path.display()));
        self.files.lock().unwrap().remove(path);
        Ok(())
    }

    async fn exists(&self, path: &Path) -> io::Result<bool> {
        Ok(self.files.lock().unwrap().contains_key(path))
    }
}

fn recording_journal() -> (Arc<RecordingFs>, RollbackJournal) {
    let fs = Arc::new(RecordingFs::default());
    let journal = RollbackJournal::new(Arc::new(MemoryStore::new()), fs.clone(), RollbackConfig::default());
    (fs, journal)
}

#[tokio::test]
async fn test_rollback_reverses_mutation_order() {
    let (fs, journal) = recording_journal();
    fs.put("/t1.txt", "one");
    fs.put("/t2.txt", "two");
    journal.start_plan("p", None).await.unwrap();

    journal.snapshot_file("p", "s1", "/t1.txt", ChangeType::Modify).await.unwrap();
    fs.put("/t1.txt", "one-new");
    journal.snapshot_file("p", "s1", "/t2.txt", ChangeType::Modify).await.unwrap();
    fs.put("/t2.txt", "two-new");

    let result = journal.rollback_step("p", "s1", false).await;
    assert!(result.success);
    assert_eq!(fs.take_ops(), vec!["write /t2.txt", "write /t1.txt"]);
    assert_eq!(result.processed_paths(), vec!["/t2.txt", "/t1.txt"]);
}

#[tokio::test]
async fn test_round_trip_over_many_files() {
    let (fs, journal) = recording_journal();
    journal.start_plan("p", None).await.unwrap();

    let paths: Vec<String> = (0..8).map(|i| format!("/src/file{}.rs", i)).collect();
    for (i, path) in paths.iter().enumerate() {
        // Mix of creates and modifies
        if i % 2 == 0 {
            fs.put(path, &format!("before {}", i));
        }
        journal.snapshot_file("p", "s1", path, ChangeType::Modify).await.unwrap();
        fs.put(path, &format!("after {}", i));
        journal.capture_after_content("p", "s1", path).await.unwrap();
    }

    let undo = journal.rollback_step("p", "s1", false).await;
    assert!(undo.success);
    for (i, path) in paths.iter().enumerate() {
        let expected = if i % 2 == 0 { Some(format!("before {}", i)) } else { None };
        assert_eq!(fs.get(path), expected);
    }

    let redo = journal.redo_step("p", "s1", false).await;
    assert!(redo.success);
    for (i, path) in paths.iter().enumerate() {
        assert_eq!(fs.get(path), Some(format!("after {}", i)));
    }
    let info = journal.get_rollback_info("p").await.unwrap().unwrap();
    assert_eq!(info.total_files, paths.len());
    assert_eq!(info.rolled_back_files, 0);
}

#[tokio::test]
async fn test_plan_rollback_on_disk_then_cleanup() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db = temp_dir.path().join("fleet.db");
    let store: Arc<dyn SharedStore> = Arc::new(SqliteStore::open(&db).unwrap());
    let journal = RollbackJournal::new(store.clone(), Arc::new(LocalFileSystem), RollbackConfig::default());

    let a = temp_dir.path().join("a.txt").to_string_lossy().into_owned();
    std::fs::write(&a, "orig").unwrap();

    journal.start_plan("plan-b", Some("conv-1")).await.unwrap();
    journal.start_step("plan-b", "s1", "edit a").await.unwrap();
    journal.snapshot_file("plan-b", "s1", &a, ChangeType::Modify).await.unwrap();
    std::fs::write(&a, "new").unwrap();
    journal.capture_after_content("plan-b", "s1", &a).await.unwrap();
    journal.complete_step("plan-b", "s1").await.unwrap();

    assert!(journal.rollback_step("plan-b", "s1", false).await.success);
    assert_eq!(std::fs::read_to_string(&a).unwrap(), "orig");
    assert!(journal.redo_step("plan-b", "s1", false).await.success);
    assert_eq!(std::fs::read_to_string(&a).unwrap(), "new");

    // The record lives in the shared store with a TTL
    let ttl = store.ttl("rollback:plan-b").await.unwrap().unwrap();
    assert!(ttl > Duration::from_secs(6 * 24 * 3600));

    assert!(journal.rollback_plan("plan-b", false).await.success);
    assert_eq!(std::fs::read_to_string(&a).unwrap(), "orig");
    assert!(journal.get_rollback_info("plan-b").await.unwrap().is_none());
    assert!(!store.exists("rollback:plan-b").await.unwrap());
}

// =============================================================================
// Control plane
// =============================================================================

#[tokio::test]
async fn test_control_plane_change_then_undo() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mut config = Config::default();
    config.store.backend = StoreBackend::Sqlite;
    config.store.path = temp_dir.path().join("fleet.db");

    let plane = ControlPlane::new(config, "planner").await.unwrap();
    plane.start().await.unwrap();

    let path = temp_dir.path().join("notes.md").to_string_lossy().into_owned();
    std::fs::write(&path, "draft").unwrap();
    let ctx = AgentContext::new("agent-1", "writer", PermissionLevel::STANDARD);
    let outcome = plane
        .apply_file_change(
            &ctx,
            FileChangeRequest {
                scope: ChangeScope::Step {
                    plan_id: "p".to_string(),
                    step_id: "s".to_string(),
                },
                path: path.clone(),
                change: FileChange::Write("final".to_string()),
                tool_name: "write_file".to_string(),
                required_level: PermissionLevel::STANDARD,
                reason: "publish notes".to_string(),
            },
        )
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        FileChangeOutcome::Applied {
            change_type: ChangeType::Modify,
            snapshotted: true
        }
    ));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "final");

    assert!(plane.journal().rollback_step("p", "s", false).await.success);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "draft");
    plane.stop().await;
}
