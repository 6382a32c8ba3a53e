//! Sequencing of cleanup and reuse of cache directories.
//!
//! One tracker is created before each backend and stays alive, through its
//! reference count, until the backend and all of its outstanding work are
//! gone. A process-wide registry keyed by path guarantees a single live
//! owner per directory; a second caller parks a retry closure that fires
//! once the first owner has fully wound down.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use lazy_static::lazy_static;

type CleanupCallback = Box<dyn FnOnce() + Send + 'static>;

lazy_static! {
    static ref TRACKERS: Mutex<HashMap<PathBuf, Weak<CleanupTracker>>> =
        Mutex::new(HashMap::new());
}

pub struct CleanupTracker {
    path: PathBuf,
    post_cleanup: Mutex<Vec<(Option<tokio::runtime::Handle>, CleanupCallback)>>,
}

impl CleanupTracker {
    /// Returns a fresh tracker for `path` if none is live, or parks
    /// `retry_closure` on the existing owner and returns `None`; the closure
    /// runs once that owner's cleanup completes, never synchronously from
    /// here. This is the only method safe to call from arbitrary threads.
    pub fn try_create(
        path: &Path,
        retry_closure: impl FnOnce() + Send + 'static,
    ) -> Option<Arc<CleanupTracker>> {
        let key = canonical_key(path);
        let mut trackers = TRACKERS.lock().unwrap();
        if let Some(existing) = trackers.get(&key).and_then(Weak::upgrade) {
            existing.queue_callback(Box::new(retry_closure));
            return None;
        }
        let tracker = Arc::new(CleanupTracker {
            path: key.clone(),
            post_cleanup: Mutex::new(Vec::new()),
        });
        trackers.insert(key, Arc::downgrade(&tracker));
        Some(tracker)
    }

    /// Register a callback to run after all work associated with this
    /// tracker's backend has completed. Owner only.
    pub fn add_post_cleanup_callback(&self, callback: impl FnOnce() + Send + 'static) {
        self.queue_callback(Box::new(callback));
    }

    fn queue_callback(&self, callback: CleanupCallback) {
        // The callback fires on the registering runtime where there is one.
        let handle = tokio::runtime::Handle::try_current().ok();
        self.post_cleanup.lock().unwrap().push((handle, callback));
    }
}

impl Drop for CleanupTracker {
    fn drop(&mut self) {
        {
            let mut trackers = TRACKERS.lock().unwrap();
            // A replacement owner may already have registered for this path;
            // deregister only a dead slot.
            let dead = trackers
                .get(&self.path)
                .map_or(false, |weak| weak.upgrade().is_none());
            if dead {
                trackers.remove(&self.path);
            }
        }

        let callbacks = std::mem::take(self.post_cleanup.get_mut().unwrap());
        for (handle, callback) in callbacks {
            match handle {
                Some(handle) => {
                    handle.spawn(async move { callback() });
                }
                None => callback(),
            }
        }
    }
}

fn canonical_key(path: &Path) -> PathBuf {
    // The directory may not exist yet for a brand new cache; fall back to
    // the spelling the caller used.
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
