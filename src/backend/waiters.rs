//! Tables of operations parked behind an in-flight doom or open-by-hash.
//!
//! While an entry hash is being doomed, or being opened by hash alone (so
//! its key is not known yet), incoming operations on that hash are deferred
//! as operation descriptors and replayed in insertion order once the
//! blocking operation completes. The tables are reference counted so an
//! entry can still signal completion while the backend is mid-teardown.

use std::collections::HashMap;
use std::sync::Mutex;

use futures::channel::oneshot;

use crate::backend::entry::EntryHandle;
use crate::backend::RequestPriority;
use crate::error::CacheResult;

pub(crate) type EntryResultSender = oneshot::Sender<CacheResult<EntryHandle>>;
pub(crate) type UnitResultSender = oneshot::Sender<CacheResult<()>>;

/// A deferred backend operation, stored as data rather than a closure so
/// the coordinator replays it from a known state.
pub(crate) enum PendingOperation {
    Open {
        key: String,
        priority: RequestPriority,
        reply: EntryResultSender,
    },
    Create {
        key: String,
        priority: RequestPriority,
        reply: EntryResultSender,
    },
    OpenOrCreate {
        key: String,
        priority: RequestPriority,
        reply: EntryResultSender,
    },
    Doom {
        key: String,
        reply: UnitResultSender,
    },
    OpenByHash {
        hash: u64,
        reply: EntryResultSender,
    },
    DoomByHash {
        hash: u64,
        reply: UnitResultSender,
    },
}

impl std::fmt::Debug for PendingOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PendingOperation::Open { key, priority, .. } => {
                f.debug_struct("Open").field("key", key).field("priority", priority).finish()
            }
            PendingOperation::Create { key, priority, .. } => {
                f.debug_struct("Create").field("key", key).field("priority", priority).finish()
            }
            PendingOperation::OpenOrCreate { key, priority, .. } => f
                .debug_struct("OpenOrCreate")
                .field("key", key)
                .field("priority", priority)
                .finish(),
            PendingOperation::Doom { key, .. } => {
                f.debug_struct("Doom").field("key", key).finish()
            }
            PendingOperation::OpenByHash { hash, .. } => {
                f.debug_struct("OpenByHash").field("hash", hash).finish()
            }
            PendingOperation::DoomByHash { hash, .. } => {
                f.debug_struct("DoomByHash").field("hash", hash).finish()
            }
        }
    }
}

pub(crate) struct WaiterTable {
    waiting: Mutex<HashMap<u64, Vec<PendingOperation>>>,
}

impl WaiterTable {
    pub(crate) fn new() -> std::sync::Arc<WaiterTable> {
        std::sync::Arc::new(WaiterTable {
            waiting: Mutex::new(HashMap::new()),
        })
    }

    /// Mark `hash` as having an operation in flight. Idempotent; an existing
    /// queue is preserved.
    pub(crate) fn start(&self, hash: u64) {
        self.waiting.lock().unwrap().entry(hash).or_default();
    }

    pub(crate) fn has(&self, hash: u64) -> bool {
        self.waiting.lock().unwrap().contains_key(&hash)
    }

    /// Queue `operation` behind the in-flight operation on `hash`. Hands the
    /// operation back if the hash completed in the meantime; the caller then
    /// re-dispatches it.
    pub(crate) fn defer(
        &self,
        hash: u64,
        operation: PendingOperation,
    ) -> Result<(), PendingOperation> {
        let mut waiting = self.waiting.lock().unwrap();
        match waiting.get_mut(&hash) {
            Some(queue) => {
                queue.push(operation);
                Ok(())
            }
            None => Err(operation),
        }
    }

    /// The operation on `hash` completed; returns the deferred operations in
    /// insertion order for the caller to replay.
    pub(crate) fn finish(&self, hash: u64) -> Vec<PendingOperation> {
        self.waiting
            .lock()
            .unwrap()
            .remove(&hash)
            .unwrap_or_default()
    }
}
