//! An on-disk object cache addressed by arbitrary byte-string keys and
//! organized as one file per entry under a cache directory.
//!
//! # Layout
//!
//! Entries are stored directly in the cache directory, named by the
//! hex-encoded 64-bit hash of their key plus a stream file index
//! (`<16 hex>_<0|1|2>`). Alongside them live:
//!
//! * `index`: a small sentinel carrying the magic and format version,
//!   enough to recognize the directory and decide upgrades.
//! * `index-dir/the-real-index`: the pickled in-memory index, holding per
//!   entry a last-used time (or prefetch hint), the rounded on-disk size
//!   and one opaque byte. CRC-checked, written through a scratch file plus
//!   atomic
//!   rename, and stamped with the directory mtime it observed so a stale
//!   copy is detected and rebuilt by scanning the directory.
//!
//! # Runtime model
//!
//! The backend never blocks its callers on disk. Index I/O runs on a
//! dedicated sequenced thread whose queue is drained before exit, so the
//! final index write of a shutdown is durable; per-entry file I/O runs on
//! the tokio blocking pool and is allowed to outlive the backend. Per-entry
//! operations are FIFO; operations arriving while the entry's hash is being
//! doomed, or opened by hash alone, are parked and replayed in order.
//!
//! Entries live under a fixed byte budget: when the accounted size passes
//! the high watermark, the index picks victims by age weighted with size
//! and dooms them down to the low watermark.

pub mod backend;
pub mod cache_type;
pub mod cleanup_tracker;
pub mod error;
pub mod index;
pub mod runner;
pub mod tools;
pub mod version_upgrade;

pub use crate::backend::entry::EntryHandle;
pub use crate::backend::{BackendIterator, CacheBackend, RequestPriority};
pub use crate::cache_type::CacheType;
pub use crate::cleanup_tracker::CleanupTracker;
pub use crate::error::{CacheError, CacheResult};
pub use crate::index::metadata::{EntryMetadata, MemoryDataHints};
pub use crate::index::{
    CacheIndex, IndexDelegate, IndexInitMethod, IndexWriteReason, PrioritizedCaching,
};
