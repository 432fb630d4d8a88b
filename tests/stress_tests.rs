//! Stress tests for safebox
//!
//! Many sandboxes running at once must not share state, leak workspaces
//! or lose reports.

use safebox::{ExecutionPolicy, ManagerConfig, ReportStatus, SandboxRegistry, SandboxState};
use std::collections::HashSet;
use std::fs;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::{TempDir, tempdir};

static STRESS_TEST_LOCK: Mutex<()> = Mutex::new(());

fn registry() -> (TempDir, Arc<SandboxRegistry>) {
    let tmp = tempdir().unwrap();
    let config = ManagerConfig::default()
        .storage_dir(tmp.path().join("storage"))
        .workspace_dir(tmp.path().join("workspaces"))
        .poll_interval(Duration::from_millis(30))
        .grace_period(Duration::from_millis(300));
    (tmp, Arc::new(SandboxRegistry::new(config)))
}

/// Rapid creation yields unique ids and one workspace each
#[test]
fn stress_rapid_creation() {
    let _lock = STRESS_TEST_LOCK.lock();
    let (tmp, registry) = registry();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                (0..25)
                    .map(|_| registry.create(ExecutionPolicy::default()).unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let ids: HashSet<String> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    assert_eq!(ids.len(), 200);
    assert_eq!(registry.list().len(), 200);
    assert_eq!(
        fs::read_dir(tmp.path().join("workspaces")).unwrap().count(),
        200
    );
}

/// Concurrent executions complete independently
#[test]
fn stress_parallel_executions() {
    let _lock = STRESS_TEST_LOCK.lock();
    let (_tmp, registry) = registry();

    let handles: Vec<_> = (0..12)
        .map(|i| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                let id = registry.create(ExecutionPolicy::default()).unwrap();
                let script = format!("sleep 0.{}; exit {}", i % 5 + 1, i % 4);
                let report = registry
                    .execute(&id, "/bin/sh", &["-c".to_string(), script])
                    .unwrap();
                (i, id, report)
            })
        })
        .collect();

    for handle in handles {
        let (i, id, report) = handle.join().unwrap();
        assert_eq!(report.sandbox_id, id);
        assert_eq!(report.status, ReportStatus::Completed);
        assert_eq!(report.return_code, Some(i % 4));
    }

    let reports = fs::read_dir(registry.config().reports_dir()).unwrap().count();
    assert_eq!(reports, 12);
    assert!(
        registry
            .list()
            .iter()
            .all(|s| s.state == SandboxState::Completed && !s.workspace.exists())
    );
}

/// Readers racing a writer always see whole sandboxes
#[test]
fn stress_list_while_creating_and_removing() {
    let _lock = STRESS_TEST_LOCK.lock();
    let (_tmp, registry) = registry();

    let writer = {
        let registry = Arc::clone(&registry);
        thread::spawn(move || {
            for _ in 0..100 {
                let id = registry.create(ExecutionPolicy::default()).unwrap();
                registry.remove(&id).unwrap();
            }
        })
    };

    let deadline = Instant::now() + Duration::from_secs(30);
    while !writer.is_finished() && Instant::now() < deadline {
        for summary in registry.list() {
            // a listed sandbox is always resolvable or already removed
            match registry.get_report(&summary.id) {
                Ok(report) => assert_eq!(report.sandbox_id, summary.id),
                Err(e) => assert!(matches!(e, safebox::SandboxError::NotFound(_))),
            }
        }
    }
    writer.join().unwrap();
    assert!(registry.list().is_empty());
}

/// Many stop() calls racing on one running sandbox all succeed
#[test]
fn stress_concurrent_stops() {
    let _lock = STRESS_TEST_LOCK.lock();
    let (_tmp, registry) = registry();
    let id = registry.create(ExecutionPolicy::default()).unwrap();

    let runner = {
        let registry = Arc::clone(&registry);
        let id = id.clone();
        thread::spawn(move || registry.execute(&id, "sleep", &["30".to_string()]))
    };

    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline
        && !registry
            .list()
            .iter()
            .any(|s| s.id == id && s.state == SandboxState::Running)
    {
        thread::sleep(Duration::from_millis(10));
    }

    let stoppers: Vec<_> = (0..6)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let id = id.clone();
            thread::spawn(move || registry.stop(&id))
        })
        .collect();
    for stopper in stoppers {
        stopper.join().unwrap().unwrap();
    }

    let report = runner.join().unwrap().unwrap();
    assert_eq!(report.status, ReportStatus::Terminated);
    assert_eq!(
        fs::read_dir(registry.config().reports_dir()).unwrap().count(),
        1
    );
}
