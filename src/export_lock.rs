use crate::frame::StorageHandle;
use parking_lot::Mutex;
use tracing::debug;

/// Guards frames referenced by an active playback/export snapshot against
/// deletion.
///
/// While a session holds the lock, eviction-driven deletions are queued
/// instead of executed; releasing the lock hands the queue back to the
/// caller for flushing. The lock never blocks: window eviction consults it
/// and defers on conflict.
pub struct ExportLock {
    state: Mutex<LockState>,
}

#[derive(Default)]
struct LockState {
    held: bool,
    deferred: Vec<StorageHandle>,
}

impl ExportLock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState::default()),
        }
    }

    /// Mark a playback/export session as active. Deletions requested from
    /// now until `end_session` are deferred.
    pub fn begin_session(&self) {
        let mut state = self.state.lock();
        state.held = true;
        debug!("Export lock acquired");
    }

    /// End the session and return every deletion that was deferred while it
    /// ran. The caller flushes them against the frame store.
    pub fn end_session(&self) -> Vec<StorageHandle> {
        let mut state = self.state.lock();
        state.held = false;
        let deferred = std::mem::take(&mut state.deferred);
        debug!(
            "Export lock released, {} deferred deletions to flush",
            deferred.len()
        );
        deferred
    }

    /// Ask to delete a handle. Returns the handle back when the caller may
    /// delete it immediately; returns `None` when a session is active and
    /// the deletion has been queued instead.
    pub fn request_delete(&self, handle: StorageHandle) -> Option<StorageHandle> {
        let mut state = self.state.lock();
        if state.held {
            debug!("Deferring deletion of frame {}", handle.sequence);
            state.deferred.push(handle);
            None
        } else {
            Some(handle)
        }
    }

    pub fn is_held(&self) -> bool {
        self.state.lock().held
    }
}

impl Default for ExportLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn handle(sequence: u64) -> StorageHandle {
        StorageHandle {
            sequence,
            path: PathBuf::from(format!("/tmp/frames/{}", sequence)),
        }
    }

    #[test]
    fn test_delete_passes_through_when_not_held() {
        let lock = ExportLock::new();
        assert_eq!(lock.request_delete(handle(1)), Some(handle(1)));
    }

    #[test]
    fn test_delete_is_deferred_while_held() {
        let lock = ExportLock::new();
        lock.begin_session();

        assert_eq!(lock.request_delete(handle(1)), None);
        assert_eq!(lock.request_delete(handle(2)), None);

        let deferred = lock.end_session();
        let sequences: Vec<u64> = deferred.iter().map(|h| h.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
    }

    #[test]
    fn test_flush_happens_exactly_once() {
        let lock = ExportLock::new();
        lock.begin_session();
        lock.request_delete(handle(1));

        assert_eq!(lock.end_session().len(), 1);
        // A second release has nothing left to flush
        assert!(lock.end_session().is_empty());
    }

    #[test]
    fn test_deletes_resume_after_release() {
        let lock = ExportLock::new();
        lock.begin_session();
        lock.request_delete(handle(1));
        lock.end_session();

        assert!(!lock.is_held());
        assert_eq!(lock.request_delete(handle(2)), Some(handle(2)));
    }
}
