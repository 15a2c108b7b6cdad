//! Signals that a document on disk changed underneath an in-memory copy.

use parking_lot::Mutex;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

pub trait StalenessSignal: Send + Sync + fmt::Debug {
    /// True when the document may differ from what was last observed.
    fn is_stale(&self) -> bool;

    /// Records the document's current state as seen, after a load or a write.
    fn observe(&self);
}

/// Compares the file's modification time against the one seen at the last
/// load or write. A file appearing or disappearing also counts as a change.
#[derive(Debug)]
pub struct ModifiedTimePoll {
    path: PathBuf,
    seen: Mutex<Option<SystemTime>>,
}

impl ModifiedTimePoll {
    pub fn new(path: PathBuf) -> Self {
        ModifiedTimePoll {
            path,
            seen: Mutex::new(None),
        }
    }

    fn current(&self) -> Option<SystemTime> {
        fs::metadata(&self.path)
            .and_then(|metadata| metadata.modified())
            .ok()
    }
}

impl StalenessSignal for ModifiedTimePoll {
    fn is_stale(&self) -> bool {
        *self.seen.lock() != self.current()
    }

    fn observe(&self) {
        *self.seen.lock() = self.current();
    }
}

/// Raised explicitly, e.g. by a file system watcher. Cleared on observe.
#[derive(Debug, Default)]
pub struct FlagSignal {
    raised: AtomicBool,
}

impl FlagSignal {
    pub fn raise(&self) {
        self.raised.store(true, Ordering::Release);
    }
}

impl StalenessSignal for FlagSignal {
    fn is_stale(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    fn observe(&self) {
        self.raised.store(false, Ordering::Release);
    }
}

/// For documents with no backing file.
#[derive(Debug, Default)]
pub struct NeverStale;

impl StalenessSignal for NeverStale {
    fn is_stale(&self) -> bool {
        false
    }

    fn observe(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modified_time_poll() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        let signal = ModifiedTimePoll::new(path.clone());

        // Nothing seen, nothing there.
        assert!(!signal.is_stale());

        fs::write(&path, b"one").unwrap();
        assert!(signal.is_stale());
        signal.observe();
        assert!(!signal.is_stale());

        fs::remove_file(&path).unwrap();
        assert!(signal.is_stale());
    }

    #[test]
    fn test_flag_signal() {
        let signal = FlagSignal::default();
        assert!(!signal.is_stale());
        signal.raise();
        assert!(signal.is_stale());
        signal.observe();
        assert!(!signal.is_stale());
    }
}
