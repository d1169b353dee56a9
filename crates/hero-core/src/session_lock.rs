//! Per-session write leases.
//!
//! Frame order within a session is defined by append sequence, so only
//! one turn may write at a time. Reads never take this lock.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

#[derive(Clone)]
pub struct SessionLockManager {
    locks: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
    /// Optional cap on concurrently running turns across all sessions.
    global_semaphore: Option<Arc<Semaphore>>,
}

impl SessionLockManager {
    pub fn new() -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
            global_semaphore: None,
        }
    }

    pub fn with_global_limit(max_concurrent: usize) -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
            global_semaphore: Some(Arc::new(Semaphore::new(max_concurrent))),
        }
    }

    /// Acquire the write lease for a session, waiting if another turn
    /// holds it.
    pub async fn acquire(&self, session_id: &str) -> SessionLockGuard {
        let global_permit = if let Some(ref sem) = self.global_semaphore {
            Some(sem.clone().acquire_owned().await.expect("semaphore closed"))
        } else {
            None
        };

        let session_sem = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };

        let session_permit = session_sem.acquire_owned().await.expect("semaphore closed");

        SessionLockGuard {
            _session_permit: session_permit,
            _global_permit: global_permit,
        }
    }

    /// Non-blocking acquire. `None` means the session is busy.
    pub async fn try_acquire(&self, session_id: &str) -> Option<SessionLockGuard> {
        let global_permit = if let Some(ref sem) = self.global_semaphore {
            match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => return None,
            }
        } else {
            None
        };

        let session_sem = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };

        match session_sem.try_acquire_owned() {
            Ok(permit) => Some(SessionLockGuard {
                _session_permit: permit,
                _global_permit: global_permit,
            }),
            Err(_) => None,
        }
    }

    /// Drop semaphores for sessions nobody is holding or waiting on.
    pub async fn cleanup_unused(&self) {
        let mut locks = self.locks.lock().await;
        locks.retain(|_, sem| sem.available_permits() < 1);
    }
}

impl Default for SessionLockManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases the lease when dropped, including on panic unwind.
pub struct SessionLockGuard {
    _session_permit: OwnedSemaphorePermit,
    _global_permit: Option<OwnedSemaphorePermit>,
}
