//! Integration tests for the durable job registry.
//!
//! These validate the crash-recovery contract: ids survive process
//! restarts, readers never see torn writes, and a persistence failure
//! leaves the in-memory set untouched.

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;

use runpod_worker::registry::JobRegistry;

fn registry_path(dir: &TempDir) -> PathBuf {
    dir.path().join(".runpod_jobs.json")
}

#[tokio::test]
async fn test_starts_empty_without_file() {
    let dir = TempDir::new().unwrap();
    let registry = JobRegistry::load(registry_path(&dir)).unwrap();

    assert_eq!(registry.count().await, 0);
    assert!(registry.snapshot().await.is_empty());
}

#[tokio::test]
async fn test_add_and_remove_round_trip() {
    let dir = TempDir::new().unwrap();
    let registry = JobRegistry::load(registry_path(&dir)).unwrap();

    assert!(registry.add("job-1").await.unwrap());
    assert!(registry.add("job-2").await.unwrap());
    assert_eq!(registry.count().await, 2);
    assert!(registry.contains("job-1").await);

    assert!(registry.remove("job-1").await.unwrap());
    assert!(!registry.contains("job-1").await);
    assert_eq!(registry.snapshot().await, vec!["job-2".to_string()]);
}

#[tokio::test]
async fn test_add_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let registry = JobRegistry::load(registry_path(&dir)).unwrap();

    assert!(registry.add("dup").await.unwrap());
    assert!(!registry.add("dup").await.unwrap());
    assert_eq!(registry.count().await, 1);

    assert!(registry.remove("dup").await.unwrap());
    assert!(!registry.remove("dup").await.unwrap());
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = registry_path(&dir);

    // First "process" records a job and crashes before removing it.
    {
        let registry = JobRegistry::load(&path).unwrap();
        registry.add("F").await.unwrap();
    }

    // The restarted worker sees the pending job again.
    let restarted = JobRegistry::load(&path).unwrap();
    assert_eq!(restarted.snapshot().await, vec!["F".to_string()]);
}

#[tokio::test]
async fn test_read_ids_sees_the_backing_file() {
    let dir = TempDir::new().unwrap();
    let path = registry_path(&dir);

    let registry = JobRegistry::load(&path).unwrap();
    registry.add("A").await.unwrap();
    registry.add("B").await.unwrap();

    // The heartbeat's view: re-open the file, no shared in-memory state.
    let ids = JobRegistry::read_ids(&path).unwrap();
    assert_eq!(ids, vec!["A".to_string(), "B".to_string()]);
}

#[tokio::test]
async fn test_read_ids_tolerates_absent_file() {
    let dir = TempDir::new().unwrap();
    let ids = JobRegistry::read_ids(&registry_path(&dir)).unwrap();
    assert!(ids.is_empty());
}

#[tokio::test]
async fn test_file_is_valid_json_after_every_mutation() {
    let dir = TempDir::new().unwrap();
    let path = registry_path(&dir);
    let registry = JobRegistry::load(&path).unwrap();

    for i in 0..10 {
        registry.add(&format!("job-{i}")).await.unwrap();
        let body = std::fs::read(&path).unwrap();
        let parsed: Vec<String> = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.len(), i + 1);
    }
}

#[tokio::test]
async fn test_concurrent_mutators_serialize() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(JobRegistry::load(registry_path(&dir)).unwrap());

    let mut handles = Vec::new();
    for i in 0..20 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            registry.add(&format!("job-{i}")).await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(registry.count().await, 20);
    let on_disk = JobRegistry::read_ids(registry.path()).unwrap();
    assert_eq!(on_disk.len(), 20);
}

#[tokio::test]
async fn test_persistence_failure_rejects_mutation() {
    let dir = TempDir::new().unwrap();
    let path = registry_path(&dir);
    let registry = JobRegistry::load(&path).unwrap();
    registry.add("kept").await.unwrap();

    // Remove the directory out from under the registry so the atomic
    // rewrite cannot land.
    drop(dir);

    assert!(registry.add("lost").await.is_err());
    assert!(!registry.contains("lost").await);
    assert!(registry.contains("kept").await);
}
