//! Durable registry of in-progress job identifiers.
//!
//! The registry is the worker's crash-recovery record: a job id is present
//! iff its terminal result has not yet been sent. The backing file is
//! rewritten atomically (temp file + rename) under an advisory file lock so
//! the heartbeat, which may run in a sibling execution context, never
//! observes a torn write.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tokio::sync::Mutex;

use crate::error::Result;

/// Advisory lock held for the duration of one read-modify-write. Released
/// when the descriptor closes on drop.
struct RegistryLock {
    file: File,
}

impl RegistryLock {
    fn exclusive(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).write(true).open(path)?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }

    fn shared(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).write(true).open(path)?;
        file.lock_shared()?;
        Ok(Self { file })
    }
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[derive(Debug)]
pub struct JobRegistry {
    data_path: PathBuf,
    lock_path: PathBuf,
    jobs: Mutex<BTreeSet<String>>,
}

impl JobRegistry {
    /// Load the registry from disk. A missing or empty file is an empty
    /// set; ids recorded by a previous process reappear here.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let data_path = path.into();
        let lock_path = lock_path_for(&data_path);
        let jobs = read_set(&data_path, &lock_path)?;

        if !jobs.is_empty() {
            tracing::info!(count = jobs.len(), "Recovered in-progress jobs from registry");
        }

        Ok(Self {
            data_path,
            lock_path,
            jobs: Mutex::new(jobs),
        })
    }

    /// Record a job id. The in-memory set is only updated after the id is
    /// durably on disk; a persistence failure leaves the registry unchanged.
    /// Returns `false` if the id was already present.
    pub async fn add(&self, id: &str) -> Result<bool> {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains(id) {
            return Ok(false);
        }

        let mut next = jobs.clone();
        next.insert(id.to_string());
        self.persist(&next)?;
        *jobs = next;

        tracing::debug!(job_id = %id, "Job added to registry");
        Ok(true)
    }

    /// Remove a job id, with the same durability contract as [`add`].
    /// Returns `false` if the id was not present.
    ///
    /// [`add`]: JobRegistry::add
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let mut jobs = self.jobs.lock().await;
        if !jobs.contains(id) {
            return Ok(false);
        }

        let mut next = jobs.clone();
        next.remove(id);
        self.persist(&next)?;
        *jobs = next;

        tracing::debug!(job_id = %id, "Job removed from registry");
        Ok(true)
    }

    /// Consistent point-in-time view of the registered ids.
    pub async fn snapshot(&self) -> Vec<String> {
        self.jobs.lock().await.iter().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.jobs.lock().await.contains(id)
    }

    pub fn path(&self) -> &Path {
        &self.data_path
    }

    fn persist(&self, jobs: &BTreeSet<String>) -> Result<()> {
        let _lock = RegistryLock::exclusive(&self.lock_path)?;

        let tmp_path = self.data_path.with_extension("tmp");
        let body = serde_json::to_vec(jobs)?;
        fs::write(&tmp_path, &body)?;
        fs::rename(&tmp_path, &self.data_path)?;
        Ok(())
    }

    /// Read the registered ids straight from the backing file, without any
    /// in-memory state. This is the heartbeat's view: it re-opens the file
    /// every tick so it also works from a sibling execution context.
    pub fn read_ids(path: &Path) -> Result<Vec<String>> {
        let jobs = read_set(path, &lock_path_for(path))?;
        Ok(jobs.into_iter().collect())
    }
}

fn lock_path_for(data_path: &Path) -> PathBuf {
    data_path.with_extension("lock")
}

fn read_set(data_path: &Path, lock_path: &Path) -> Result<BTreeSet<String>> {
    if !data_path.exists() {
        return Ok(BTreeSet::new());
    }

    let _lock = RegistryLock::shared(lock_path)?;
    let body = fs::read(data_path)?;
    if body.is_empty() {
        return Ok(BTreeSet::new());
    }
    Ok(serde_json::from_slice(&body)?)
}
