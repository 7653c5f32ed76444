use std::collections::VecDeque;

use tokio::sync::{Mutex, Notify};

use crate::job::Job;

/// Bounded FIFO of jobs shared by the fetch and run loops.
///
/// Capacity equals the current concurrency budget. The capacity is only
/// replaced while the queue is drained, so a resize is observed atomically
/// by both loops. Closing the queue stops further pushes while letting the
/// consumer drain what is already buffered.
#[derive(Debug)]
pub struct JobQueue {
    inner: Mutex<Inner>,
    space_available: Notify,
    job_available: Notify,
}

#[derive(Debug)]
struct Inner {
    buf: VecDeque<Job>,
    capacity: usize,
    closed: bool,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                buf: VecDeque::new(),
                capacity: capacity.max(1),
                closed: false,
            }),
            space_available: Notify::new(),
            job_available: Notify::new(),
        }
    }

    /// Push a job, waiting while the queue is at capacity. Returns `false`
    /// if the queue was closed before the job could be enqueued.
    pub async fn push(&self, job: Job) -> bool {
        loop {
            {
                let mut inner = self.inner.lock().await;
                if inner.closed {
                    return false;
                }
                if inner.buf.len() < inner.capacity {
                    inner.buf.push_back(job);
                    self.job_available.notify_one();
                    return true;
                }
            }
            self.space_available.notified().await;
        }
    }

    /// Pop the oldest job, waiting while the queue is empty. Returns `None`
    /// once the queue is closed and fully drained.
    pub async fn pop(&self) -> Option<Job> {
        loop {
            {
                let mut inner = self.inner.lock().await;
                if let Some(job) = inner.buf.pop_front() {
                    self.space_available.notify_one();
                    return Some(job);
                }
                if inner.closed {
                    return None;
                }
            }
            self.job_available.notified().await;
        }
    }

    /// Stop accepting new jobs. Buffered jobs remain poppable.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        self.job_available.notify_waiters();
        self.space_available.notify_waiters();
    }

    /// Replace the capacity. Callers must drain the queue first; the new
    /// bound only applies to subsequent pushes.
    pub async fn set_capacity(&self, capacity: usize) {
        let mut inner = self.inner.lock().await;
        inner.capacity = capacity.max(1);
        self.space_available.notify_one();
    }

    pub async fn capacity(&self) -> usize {
        self.inner.lock().await.capacity
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.buf.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.buf.is_empty()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.lock().await.buf.iter().any(|job| job.id == id)
    }
}
