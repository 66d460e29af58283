//! Per-session advisory locking. Turns within a session are processed
//! serially; the lock is held for the duration of the pipeline stages.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

#[derive(Clone, Default)]
pub struct SessionLockManager {
    locks: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
    /// Optional global concurrency limit across all sessions.
    global_semaphore: Option<Arc<Semaphore>>,
}

impl SessionLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_global_limit(max_concurrent: usize) -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
            global_semaphore: Some(Arc::new(Semaphore::new(max_concurrent))),
        }
    }

    /// Acquire exclusive access to a session. The returned guard releases
    /// the lock when dropped.
    pub async fn acquire(&self, session_key: &str) -> SessionLockGuard {
        let global_permit = if let Some(ref sem) = self.global_semaphore {
            Some(sem.clone().acquire_owned().await.expect("semaphore closed"))
        } else {
            None
        };

        let session_sem = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(session_key.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };

        let session_permit = session_sem.acquire_owned().await.expect("semaphore closed");

        SessionLockGuard {
            _session_permit: session_permit,
            _global_permit: global_permit,
        }
    }

    /// Drop semaphores nobody is holding or waiting on.
    pub async fn cleanup_unused(&self) {
        let mut locks = self.locks.lock().await;
        locks.retain(|_, sem| Arc::strong_count(sem) > 1 || sem.available_permits() == 0);
    }
}

pub struct SessionLockGuard {
    _session_permit: OwnedSemaphorePermit,
    _global_permit: Option<OwnedSemaphorePermit>,
}
