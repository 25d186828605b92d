//! Live-turn bookkeeping. One handle per active session, keyed by session
//! id (or a synthetic key until the real id is learned from output).
//! Abort is fire-and-forget: the entry is removed immediately and the
//! owning turn observes the cancellation token and tears the process down.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

#[derive(Clone)]
pub struct ProcessHandle {
    pub key: String,
    pub pid: Option<u32>,
    pub cancel: CancellationToken,
    pub staged_files: Vec<PathBuf>,
    pub staging_dir: Option<PathBuf>,
    pub spawned_at: Instant,
    pub received_output: Arc<AtomicBool>,
}

impl ProcessHandle {
    pub fn new(key: impl Into<String>, pid: Option<u32>) -> Self {
        Self {
            key: key.into(),
            pid,
            cancel: CancellationToken::new(),
            staged_files: Vec::new(),
            staging_dir: None,
            spawned_at: Instant::now(),
            received_output: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[derive(Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<Mutex<HashMap<String, ProcessHandle>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle. Fails when the key already has a live process,
    /// which enforces at most one active turn per session.
    pub fn try_insert(&self, handle: ProcessHandle) -> bool {
        let mut map = self.lock();
        if map.contains_key(&handle.key) {
            return false;
        }
        debug!(key = %handle.key, pid = ?handle.pid, "registering process");
        map.insert(handle.key.clone(), handle);
        true
    }

    /// Move a handle from its synthetic key to the session id learned
    /// from provider output. No-op when the old key is gone (the process
    /// may have exited or been aborted in the meantime).
    pub fn rekey(&self, old_key: &str, new_key: &str) {
        let mut map = self.lock();
        if let Some(mut handle) = map.remove(old_key) {
            debug!(from = old_key, to = new_key, "re-keying process");
            handle.key = new_key.to_string();
            map.insert(new_key.to_string(), handle);
        }
    }

    pub fn remove(&self, key: &str) -> Option<ProcessHandle> {
        self.lock().remove(key)
    }

    pub fn get(&self, key: &str) -> Option<ProcessHandle> {
        self.lock().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Cancel the process registered for `session_id`. Falls back to a
    /// substring match so callers holding a truncated or prefixed id can
    /// still abort. Returns whether anything was cancelled.
    pub fn abort(&self, session_id: &str) -> bool {
        let handle = {
            let mut map = self.lock();
            let key = if map.contains_key(session_id) {
                Some(session_id.to_string())
            } else {
                map.keys()
                    .find(|k| k.contains(session_id) || session_id.contains(k.as_str()))
                    .cloned()
            };
            key.and_then(|k| map.remove(&k))
        };
        match handle {
            Some(handle) => {
                debug!(key = %handle.key, pid = ?handle.pid, "aborting process");
                handle.cancel.cancel();
                true
            }
            None => {
                warn!(session_id, "abort requested for unknown session");
                false
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ProcessHandle>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
