//! In-memory index of the cache: a compact map from key hash to entry
//! metadata, persisted asynchronously and rebuilt from a directory scan when
//! the on-disk copy is missing, corrupt or stale.
//!
//! The index also drives eviction: when the accounted size crosses the high
//! watermark it selects victims by age (weighted by size for most cache
//! types) and hands them to the doom sink injected at construction.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime};

use futures::channel::oneshot;
use log::debug;

use crate::cache_type::CacheType;
use crate::cleanup_tracker::CleanupTracker;
use crate::error::{CacheError, CacheResult};
use crate::tools;

pub mod file;
pub mod metadata;
pub mod pickle;

use self::file::{IndexFile, IndexLoadResult, IndexMetadata};
use self::metadata::{EntryMetadata, MemoryDataHints};

pub type EntrySet = HashMap<u64, EntryMetadata>;

/// Delay between the last state change and the deferred index write.
const WRITE_TO_DISK_DELAY: Duration = Duration::from_millis(20_000);
/// Much shorter while the app is backgrounded, to keep the on-disk index
/// fresh in case the process is killed.
const WRITE_TO_DISK_ON_BACKGROUND_DELAY: Duration = Duration::from_millis(100);

/// The cache is divided into this many parts; eviction starts when one part
/// is left and frees a second one.
const EVICTION_MARGIN_DIVISOR: u64 = 20;

/// Added to each entry size before weighting eviction by size. Approximates
/// filesystem overhead and flattens the curve so 1-byte and 2-byte entries
/// sort together.
const ESTIMATED_ENTRY_OVERHEAD: u64 = 512;

const LOWER_EPSILON_FOR_TIME_COMPARISONS: i64 = 1;
const UPPER_EPSILON_FOR_TIME_COMPARISONS: i64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexInitMethod {
    /// Rebuilt by scanning the cache directory.
    Recovered,
    /// Loaded from a fresh index file.
    Loaded,
    /// No previous index existed.
    NewCache,
}

/// Why an index write was issued; recorded in the file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexWriteReason {
    Shutdown,
    StartupMerge,
    Idle,
    AppBackgrounded,
}

impl IndexWriteReason {
    /// One past the largest valid wire value.
    pub const WIRE_LIMIT: u32 = 4;

    pub fn wire_value(self) -> u32 {
        match self {
            IndexWriteReason::Shutdown => 0,
            IndexWriteReason::StartupMerge => 1,
            IndexWriteReason::Idle => 2,
            IndexWriteReason::AppBackgrounded => 3,
        }
    }

    pub fn from_wire_value(value: u32) -> Option<IndexWriteReason> {
        match value {
            0 => Some(IndexWriteReason::Shutdown),
            1 => Some(IndexWriteReason::StartupMerge),
            2 => Some(IndexWriteReason::Idle),
            3 => Some(IndexWriteReason::AppBackgrounded),
            _ => None,
        }
    }
}

pub type DoomDoneCallback = Box<dyn FnOnce(CacheResult<()>) + Send>;

/// The sink eviction hands its victims to; implemented by the backend
/// coordinator. Called with the index lock held, so implementations must
/// defer and never call back into the index synchronously.
pub trait IndexDelegate: Send + Sync {
    fn doom_entries(&self, hashes: Vec<u64>, done: DoomDoneCallback);
}

/// Knobs for boosting survival of `HIGH_PRIORITY` entries during eviction.
#[derive(Debug, Clone, Copy)]
pub struct PrioritizedCaching {
    pub enabled: bool,
    pub factor: u64,
    pub period: Duration,
}

impl Default for PrioritizedCaching {
    fn default() -> Self {
        PrioritizedCaching {
            enabled: false,
            factor: 4,
            period: Duration::from_secs(3600),
        }
    }
}

pub struct CacheIndex {
    cleanup_tracker: Option<Arc<CleanupTracker>>,
    delegate: Arc<dyn IndexDelegate>,
    cache_type: CacheType,
    entries: EntrySet,
    /// Total cache storage size in bytes, using rounded entry sizes.
    cache_size: u64,
    max_size: u64,
    high_watermark: u64,
    low_watermark: u64,
    eviction_in_progress: bool,
    /// Hashes removed before initialization completed; subtracted from the
    /// loaded set on merge.
    removed_entries: HashSet<u64>,
    initialized: bool,
    init_method: Option<IndexInitMethod>,
    index_file: Arc<IndexFile>,
    self_weak: Weak<Mutex<CacheIndex>>,
    write_timer_generation: u64,
    write_timer_armed: bool,
    app_on_background: bool,
    to_run_when_initialized: Vec<oneshot::Sender<CacheResult<()>>>,
    prioritized_caching: PrioritizedCaching,
}

impl CacheIndex {
    pub fn new(
        cleanup_tracker: Option<Arc<CleanupTracker>>,
        delegate: Arc<dyn IndexDelegate>,
        cache_type: CacheType,
        index_file: Arc<IndexFile>,
    ) -> Arc<Mutex<CacheIndex>> {
        Arc::new_cyclic(|self_weak| {
            Mutex::new(CacheIndex {
                cleanup_tracker,
                delegate,
                cache_type,
                entries: HashMap::new(),
                cache_size: 0,
                max_size: 0,
                high_watermark: 0,
                low_watermark: 0,
                eviction_in_progress: false,
                removed_entries: HashSet::new(),
                initialized: false,
                init_method: None,
                index_file,
                self_weak: self_weak.clone(),
                write_timer_generation: 0,
                write_timer_armed: false,
                app_on_background: false,
                to_run_when_initialized: Vec::new(),
                prioritized_caching: PrioritizedCaching::default(),
            })
        })
    }

    pub fn set_prioritized_caching(&mut self, config: PrioritizedCaching) {
        self.prioritized_caching = config;
    }

    /// Kick off the asynchronous load (or rebuild) of the entry set. The
    /// pending `execute_when_ready` callbacks fire once the merge is done.
    /// Never completes synchronously.
    pub fn initialize(&mut self, cache_dir_mtime: Option<SystemTime>) {
        let index_file = self.index_file.clone();
        let self_weak = self.self_weak.clone();
        tokio::spawn(async move {
            let load_result = index_file.load_index_entries(cache_dir_mtime).await;
            if let Some(index) = self_weak.upgrade() {
                index.lock().unwrap().merge_initializing_set(load_result);
            }
        });
    }

    /// Zero keeps the current (default) size.
    pub fn set_max_size(&mut self, max_bytes: u64) {
        if max_bytes > 0 {
            self.max_size = max_bytes;
            self.high_watermark = self.max_size - self.max_size / EVICTION_MARGIN_DIVISOR;
            self.low_watermark = self.max_size - 2 * (self.max_size / EVICTION_MARGIN_DIVISOR);
        }
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn initialized(&self) -> bool {
        self.initialized
    }

    pub fn init_method(&self) -> Option<IndexInitMethod> {
        self.init_method
    }

    /// Completes once the index is ready; immediately (but still
    /// asynchronously) when it already is. Aborts with `Cancelled` if the
    /// index is destroyed first.
    pub fn execute_when_ready(&mut self) -> oneshot::Receiver<CacheResult<()>> {
        let (tx, rx) = oneshot::channel();
        if self.initialized {
            let _ = tx.send(Ok(()));
        } else {
            self.to_run_when_initialized.push(tx);
        }
        rx
    }

    pub fn insert(&mut self, entry_hash: u64) {
        // The size is not known yet; it arrives via update_entry_size once
        // the entry finishes opening or creating.
        let metadata = if self.cache_type.is_app_cache() {
            EntryMetadata::new_for_app_cache(-1, 0)
        } else {
            EntryMetadata::new(Some(SystemTime::now()), 0)
        };
        let inserted = insert_in_entry_set(entry_hash, metadata, &mut self.entries);
        if !self.initialized {
            self.removed_entries.remove(&entry_hash);
        }
        if inserted {
            self.postpone_writing_to_disk();
        }
    }

    pub fn remove(&mut self, entry_hash: u64) {
        let mut need_write = false;
        if self.entries.contains_key(&entry_hash) {
            self.update_entry_size_internal(entry_hash, 0);
            self.entries.remove(&entry_hash);
            need_write = true;
        }

        if !self.initialized {
            self.removed_entries.insert(entry_hash);
        }

        if need_write {
            self.postpone_writing_to_disk();
        }
    }

    /// Whether the entry is present. Before initialization this is always
    /// true, forcing callers to consult the disk.
    pub fn has(&self, entry_hash: u64) -> bool {
        !self.initialized || self.entries.contains_key(&entry_hash)
    }

    /// Bump the last used time of an entry if it exists. App caches do not
    /// track access times, so membership alone is reported there.
    pub fn use_if_exists(&mut self, entry_hash: u64) -> bool {
        if !self.entries.contains_key(&entry_hash) {
            return !self.initialized;
        }
        if self.cache_type.is_app_cache() {
            return true;
        }
        if let Some(metadata) = self.entries.get_mut(&entry_hash) {
            metadata.set_last_used_time(Some(SystemTime::now()));
        }
        self.postpone_writing_to_disk();
        true
    }

    pub fn entry_in_memory_data(&self, entry_hash: u64) -> u8 {
        self.entries
            .get(&entry_hash)
            .map(|m| m.in_memory_data())
            .unwrap_or(0)
    }

    pub fn set_entry_in_memory_data(&mut self, entry_hash: u64, value: u8) {
        if let Some(metadata) = self.entries.get_mut(&entry_hash) {
            metadata.set_in_memory_data(value);
        }
    }

    pub fn trailer_prefetch_size(&self, entry_hash: u64) -> i32 {
        debug_assert!(self.cache_type.is_app_cache());
        self.entries
            .get(&entry_hash)
            .map(|m| m.trailer_prefetch_size())
            .unwrap_or(-1)
    }

    pub fn set_trailer_prefetch_size(&mut self, entry_hash: u64, size: i32) {
        debug_assert!(self.cache_type.is_app_cache());
        let changed = match self.entries.get_mut(&entry_hash) {
            Some(metadata) => {
                let original = metadata.trailer_prefetch_size();
                metadata.set_trailer_prefetch_size(size);
                metadata.trailer_prefetch_size() != original
            }
            None => false,
        };
        if changed {
            self.postpone_writing_to_disk();
        }
    }

    /// Record the total on-disk size of an entry (all of its stream files).
    /// Returns false when the entry is unknown. May trigger eviction.
    pub fn update_entry_size(&mut self, entry_hash: u64, entry_size: u32) -> bool {
        if !self.entries.contains_key(&entry_hash) {
            return false;
        }
        if !self.update_entry_size_internal(entry_hash, entry_size) {
            return true;
        }
        self.postpone_writing_to_disk();
        self.start_eviction_if_needed();
        true
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Total accounted cache size. Only meaningful once initialized.
    pub fn cache_size(&self) -> u64 {
        debug_assert!(self.initialized);
        self.cache_size
    }

    /// Hashes of entries last used within `[initial_time, end_time)`, with a
    /// one second epsilon below the lower bound. `None` bounds are open. App
    /// caches do not track access times; both bounds must be `None` there.
    pub fn entries_between(
        &self,
        initial_time: Option<SystemTime>,
        end_time: Option<SystemTime>,
    ) -> Vec<u64> {
        debug_assert!(
            !self.cache_type.is_app_cache() || (initial_time.is_none() && end_time.is_none())
        );
        let (lower, upper) = time_range_bounds(initial_time, end_time);
        self.entries
            .iter()
            .filter(|(_, m)| {
                let t = i64::from(m.raw_time_for_sorting());
                lower <= t && t < upper
            })
            .map(|(hash, _)| *hash)
            .collect()
    }

    pub fn all_hashes(&self) -> Vec<u64> {
        self.entries_between(None, None)
    }

    pub fn cache_size_between(
        &self,
        initial_time: Option<SystemTime>,
        end_time: Option<SystemTime>,
    ) -> u64 {
        debug_assert!(self.initialized);
        let (lower, upper) = time_range_bounds(initial_time, end_time);
        self.entries
            .values()
            .filter(|m| {
                let t = i64::from(m.raw_time_for_sorting());
                lower <= t && t < upper
            })
            .map(|m| u64::from(m.entry_size()))
            .sum()
    }

    /// `None` if the hash is unknown or the entry has no recorded use.
    pub fn last_used_time(&self, entry_hash: u64) -> Option<SystemTime> {
        debug_assert!(!self.cache_type.is_app_cache());
        self.entries.get(&entry_hash)?.last_used_time()
    }

    pub fn has_pending_write(&self) -> bool {
        self.write_timer_armed
    }

    /// Driven externally on app lifecycle transitions. Entering the
    /// background flushes immediately and shortens subsequent write delays.
    pub fn set_app_on_background(&mut self, on_background: bool) {
        self.app_on_background = on_background;
        if on_background {
            self.write_to_disk(IndexWriteReason::AppBackgrounded);
        }
    }

    pub fn estimate_memory_usage(&self) -> usize {
        self.entries.len() * std::mem::size_of::<(u64, EntryMetadata)>()
    }

    /// Serialize the entry set and hand it to the writer. Cancels the
    /// deferred write timer. The cleanup tracker, if any, stays alive until
    /// the write has completed.
    pub fn write_to_disk(&mut self, reason: IndexWriteReason) {
        if !self.initialized {
            return;
        }
        self.write_timer_armed = false;
        self.write_timer_generation += 1;

        let metadata = IndexMetadata::new(reason, self.entries.len() as u64, self.cache_size);
        self.index_file
            .write_to_disk(metadata, &self.entries, self.cleanup_tracker.clone(), None);
    }

    pub(crate) fn eviction_done(&mut self, _result: CacheResult<()>) {
        // Eviction did its best; errors are not propagated.
        self.eviction_in_progress = false;
    }

    fn update_entry_size_internal(&mut self, entry_hash: u64, entry_size: u32) -> bool {
        let metadata = match self.entries.get_mut(&entry_hash) {
            Some(m) => m,
            None => return false,
        };
        let original_size = metadata.entry_size();
        debug_assert!(self.cache_size >= u64::from(original_size));
        metadata.set_entry_size(entry_size);
        // Go through entry_size() on both sides for consistent rounding.
        let new_size = metadata.entry_size();
        self.cache_size = self.cache_size - u64::from(original_size) + u64::from(new_size);
        original_size != new_size
    }

    fn start_eviction_if_needed(&mut self) {
        if self.eviction_in_progress || self.cache_size <= self.high_watermark {
            return;
        }
        self.eviction_in_progress = true;

        let use_size_heuristic = self.cache_type.uses_size_heuristic();
        let prioritization = self.prioritized_caching;
        let prioritization_period = prioritization.period.as_secs();
        let now = u64::from(tools::now_seconds());

        // Flatten for sorting. Subtracting the score from u64::MAX avoids a
        // custom comparator; the product of two 32-bit quantities cannot
        // overflow the u64.
        let mut scored: Vec<(u64, u64, u32)> = self
            .entries
            .iter()
            .map(|(hash, m)| {
                let age = now.saturating_sub(u64::from(m.raw_time_for_sorting()));
                let mut sort_value = age;
                if use_size_heuristic {
                    sort_value *= u64::from(m.entry_size()) + ESTIMATED_ENTRY_OVERHEAD;
                    // Prioritized entries within the boost window sort as if
                    // several times younger.
                    if prioritization.enabled
                        && age < prioritization_period
                        && m.in_memory_data() & MemoryDataHints::HIGH_PRIORITY.bits()
                            == MemoryDataHints::HIGH_PRIORITY.bits()
                    {
                        sort_value /= prioritization.factor;
                    }
                }
                (u64::MAX - sort_value, *hash, m.entry_size())
            })
            .collect();
        scored.sort_unstable();

        let amount_to_evict = self.cache_size - self.low_watermark;
        let mut evicted_so_far_size = 0u64;
        let mut entry_hashes = Vec::new();
        for (_, hash, entry_size) in scored {
            if evicted_so_far_size >= amount_to_evict {
                break;
            }
            evicted_so_far_size += u64::from(entry_size);
            entry_hashes.push(hash);
        }

        debug!(
            "evicting {} entries ({} bytes) to reach the low watermark",
            entry_hashes.len(),
            evicted_so_far_size
        );

        let self_weak = self.self_weak.clone();
        let done: DoomDoneCallback = Box::new(move |result| {
            if let Some(index) = self_weak.upgrade() {
                index.lock().unwrap().eviction_done(result);
            }
        });
        self.delegate.doom_entries(entry_hashes, done);
    }

    fn postpone_writing_to_disk(&mut self) {
        if !self.initialized {
            return;
        }
        let delay = if self.app_on_background {
            WRITE_TO_DISK_ON_BACKGROUND_DELAY
        } else {
            WRITE_TO_DISK_DELAY
        };
        // Arming again restarts the delay, coalescing bursts of mutations
        // into one write.
        self.write_timer_generation += 1;
        self.write_timer_armed = true;
        let generation = self.write_timer_generation;
        let self_weak = self.self_weak.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(index) = self_weak.upgrade() {
                    let mut index = index.lock().unwrap();
                    if index.write_timer_armed && index.write_timer_generation == generation {
                        index.write_to_disk(IndexWriteReason::Idle);
                    }
                }
            });
        }
    }

    fn merge_initializing_set(&mut self, mut load_result: IndexLoadResult) {
        let index_file_entries = &mut load_result.entries;

        for removed_entry in self.removed_entries.drain() {
            index_file_entries.remove(&removed_entry);
        }

        // Anything mutated before initialization finished reflects fresh
        // reality and overrides what the loader saw.
        for (entry_hash, metadata) in self.entries.drain() {
            index_file_entries.insert(entry_hash, metadata);
        }

        let merged_cache_size = index_file_entries
            .values()
            .map(|m| u64::from(m.entry_size()))
            .sum();

        std::mem::swap(&mut self.entries, index_file_entries);
        self.cache_size = merged_cache_size;
        self.initialized = true;
        self.init_method = Some(load_result.init_method);

        if load_result.flush_required {
            self.write_to_disk(IndexWriteReason::StartupMerge);
        }

        for callback in self.to_run_when_initialized.drain(..) {
            let _ = callback.send(Ok(()));
        }
    }

    #[cfg(test)]
    fn set_last_used_time_for_test(&mut self, entry_hash: u64, last_used: Option<SystemTime>) {
        let metadata = self.entries.get_mut(&entry_hash).unwrap();
        metadata.set_last_used_time(last_used);
    }

    #[cfg(test)]
    fn insert_entry_for_test(&mut self, entry_hash: u64, metadata: EntryMetadata) {
        assert!(!self.entries.contains_key(&entry_hash));
        if insert_in_entry_set(entry_hash, metadata, &mut self.entries) {
            self.cache_size += u64::from(metadata.entry_size());
        }
    }
}

impl Drop for CacheIndex {
    fn drop(&mut self) {
        // Fail everything still waiting for the index to come up.
        for callback in self.to_run_when_initialized.drain(..) {
            let _ = callback.send(Err(CacheError::Cancelled));
        }
        if self.initialized {
            self.write_to_disk(IndexWriteReason::Shutdown);
        }
    }
}

/// Insert only if no entry is present; returns whether the set was modified.
pub fn insert_in_entry_set(
    entry_hash: u64,
    entry_metadata: EntryMetadata,
    entry_set: &mut EntrySet,
) -> bool {
    match entry_set.entry(entry_hash) {
        std::collections::hash_map::Entry::Occupied(_) => false,
        std::collections::hash_map::Entry::Vacant(slot) => {
            slot.insert(entry_metadata);
            true
        }
    }
}

fn time_range_bounds(
    initial_time: Option<SystemTime>,
    end_time: Option<SystemTime>,
) -> (i64, i64) {
    let lower = match initial_time {
        Some(t) => tools::epoch_seconds_i64(t) - LOWER_EPSILON_FOR_TIME_COMPARISONS,
        None => i64::MIN,
    };
    let upper = match end_time {
        Some(t) => tools::epoch_seconds_i64(t) + UPPER_EPSILON_FOR_TIME_COMPARISONS,
        None => i64::MAX,
    };
    debug_assert!(upper >= lower);
    (lower, upper)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::SequencedRunner;
    use std::time::UNIX_EPOCH;

    struct RecordingDoomSink {
        doomed: Mutex<Vec<Vec<u64>>>,
    }

    impl RecordingDoomSink {
        fn new() -> Arc<RecordingDoomSink> {
            Arc::new(RecordingDoomSink {
                doomed: Mutex::new(Vec::new()),
            })
        }

        fn last(&self) -> Option<Vec<u64>> {
            self.doomed.lock().unwrap().last().cloned()
        }

        fn call_count(&self) -> usize {
            self.doomed.lock().unwrap().len()
        }
    }

    impl IndexDelegate for RecordingDoomSink {
        fn doom_entries(&self, hashes: Vec<u64>, _done: DoomDoneCallback) {
            // Deferred by contract: the completion is dropped here and the
            // test drives eviction_done itself.
            self.doomed.lock().unwrap().push(hashes);
        }
    }

    fn new_index(
        cache_type: CacheType,
    ) -> (
        Arc<Mutex<CacheIndex>>,
        Arc<RecordingDoomSink>,
        tempfile::TempDir,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let runner = SequencedRunner::new("index-test");
        let index_file = Arc::new(IndexFile::new(runner, cache_type, dir.path().to_owned()));
        let sink = RecordingDoomSink::new();
        let index = CacheIndex::new(None, sink.clone(), cache_type, index_file);
        (index, sink, dir)
    }

    fn mark_initialized(index: &mut CacheIndex) {
        index.merge_initializing_set(IndexLoadResult::default());
    }

    fn seconds_ago(secs: u64) -> SystemTime {
        SystemTime::now() - Duration::from_secs(secs)
    }

    #[test]
    fn has_is_true_before_initialization() {
        let (index, _, _dir) = new_index(CacheType::Disk);
        let mut index = index.lock().unwrap();
        assert!(index.has(42));
        assert!(index.use_if_exists(42));
        mark_initialized(&mut index);
        assert!(!index.has(42));
        assert!(!index.use_if_exists(42));
    }

    #[test]
    fn insert_and_remove_account_size() {
        let (index, _, _dir) = new_index(CacheType::Disk);
        let mut index = index.lock().unwrap();
        mark_initialized(&mut index);

        index.insert(1);
        index.insert(2);
        assert!(index.update_entry_size(1, 100));
        assert!(index.update_entry_size(2, 1000));
        assert_eq!(index.cache_size(), 256 + 1024);

        index.remove(1);
        assert_eq!(index.cache_size(), 1024);
        assert_eq!(index.entry_count(), 1);

        assert!(!index.update_entry_size(1, 50));
    }

    #[test]
    fn size_accounting_matches_under_random_operations() {
        let (index, _, _dir) = new_index(CacheType::Disk);
        let mut index = index.lock().unwrap();
        mark_initialized(&mut index);
        index.set_max_size(u64::MAX);

        // Small deterministic LCG driving a mixed operation sequence.
        let mut state = 0x2545f491_4f6c_dd1du64;
        let mut step = || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            state >> 33
        };
        for _ in 0..2000 {
            let hash = step() % 64;
            match step() % 3 {
                0 => index.insert(hash),
                1 => index.remove(hash),
                _ => {
                    let _ = index.update_entry_size(hash, (step() % 100_000) as u32);
                }
            }
        }

        let expected: u64 = index
            .entries
            .values()
            .map(|m| u64::from(m.entry_size()))
            .sum();
        assert_eq!(index.cache_size(), expected);
    }

    #[test]
    fn size_rounding_is_stable_across_updates() {
        let (index, _, _dir) = new_index(CacheType::Disk);
        let mut index = index.lock().unwrap();
        mark_initialized(&mut index);

        index.insert(7);
        assert!(index.update_entry_size(7, 475));
        let size = index.cache_size();
        let rounded = index.entries[&7].entry_size();
        assert!(index.update_entry_size(7, rounded));
        assert_eq!(index.cache_size(), size);
    }

    #[test]
    fn eviction_is_size_weighted_by_default() {
        let (index, sink, _dir) = new_index(CacheType::Disk);
        let mut index = index.lock().unwrap();
        mark_initialized(&mut index);
        index.set_max_size(50_000);

        index.insert(11);
        index.set_last_used_time_for_test(11, Some(seconds_ago(3)));
        assert!(index.update_entry_size(11, 475));
        index.insert(22);
        index.set_last_used_time_for_test(22, Some(seconds_ago(2)));
        assert!(index.update_entry_size(22, 40_000));
        index.insert(3);
        index.set_last_used_time_for_test(3, Some(seconds_ago(1)));
        assert!(index.update_entry_size(3, 40_000));

        // The big, slightly older entry loses despite 11 being the oldest.
        assert_eq!(sink.call_count(), 1);
        let doomed = sink.last().unwrap();
        assert_eq!(doomed, vec![22]);

        for hash in &doomed {
            index.remove(*hash);
        }
        index.eviction_done(Ok(()));

        assert_eq!(index.entry_count(), 2);
        assert!(index.has(11));
        assert!(index.has(3));
        assert!(!index.has(22));
    }

    #[test]
    fn byte_code_cache_evicts_by_pure_age() {
        let (index, sink, _dir) = new_index(CacheType::GeneratedByteCode);
        let mut index = index.lock().unwrap();
        mark_initialized(&mut index);
        index.set_max_size(50_000);

        index.insert(11);
        index.set_last_used_time_for_test(11, Some(seconds_ago(3)));
        assert!(index.update_entry_size(11, 475));
        index.insert(22);
        index.set_last_used_time_for_test(22, Some(seconds_ago(2)));
        assert!(index.update_entry_size(22, 40_000));
        index.insert(3);
        index.set_last_used_time_for_test(3, Some(seconds_ago(1)));
        assert!(index.update_entry_size(3, 40_000));

        let doomed = sink.last().unwrap();
        assert_eq!(doomed, vec![11, 22]);

        for hash in &doomed {
            index.remove(*hash);
        }
        index.eviction_done(Ok(()));
        assert_eq!(index.entry_count(), 1);
        assert!(index.has(3));
    }

    #[test]
    fn no_second_eviction_while_one_is_running() {
        let (index, sink, _dir) = new_index(CacheType::Disk);
        let mut index = index.lock().unwrap();
        mark_initialized(&mut index);
        index.set_max_size(10_000);

        index.insert(1);
        assert!(index.update_entry_size(1, 20_000));
        assert_eq!(sink.call_count(), 1);

        // Still over the watermark, but the first eviction has not reported
        // back yet.
        index.insert(2);
        assert!(index.update_entry_size(2, 20_000));
        assert_eq!(sink.call_count(), 1);

        index.eviction_done(Ok(()));
        index.insert(4);
        assert!(index.update_entry_size(4, 20_000));
        assert_eq!(sink.call_count(), 2);
    }

    #[test]
    fn prioritized_entries_outlive_their_size() {
        let (index, sink, _dir) = new_index(CacheType::Disk);
        let mut index = index.lock().unwrap();
        mark_initialized(&mut index);
        index.set_prioritized_caching(PrioritizedCaching {
            enabled: true,
            factor: 1000,
            period: Duration::from_secs(3600),
        });
        index.set_max_size(50_000);

        index.insert(11);
        index.set_last_used_time_for_test(11, Some(seconds_ago(3)));
        assert!(index.update_entry_size(11, 475));
        index.insert(22);
        index.set_last_used_time_for_test(22, Some(seconds_ago(2)));
        index.set_entry_in_memory_data(22, MemoryDataHints::HIGH_PRIORITY.bits());
        assert!(index.update_entry_size(22, 40_000));
        index.insert(3);
        index.set_last_used_time_for_test(3, Some(seconds_ago(1)));
        assert!(index.update_entry_size(3, 40_000));

        // With the boost the big old entry survives and the young plain one
        // goes instead.
        let doomed = sink.last().unwrap();
        assert!(!doomed.contains(&22));
    }

    #[test]
    fn merge_subtracts_pre_init_removals() {
        let (index, _, _dir) = new_index(CacheType::Disk);
        let mut index = index.lock().unwrap();

        index.remove(10);
        index.insert(20);

        let mut load_result = IndexLoadResult::default();
        load_result.did_load = true;
        load_result.init_method = IndexInitMethod::Loaded;
        load_result
            .entries
            .insert(10, EntryMetadata::new(Some(seconds_ago(60)), 500));
        load_result
            .entries
            .insert(20, EntryMetadata::new(Some(seconds_ago(60)), 1000));
        load_result
            .entries
            .insert(30, EntryMetadata::new(Some(seconds_ago(60)), 256));
        index.merge_initializing_set(load_result);

        assert!(index.initialized());
        assert_eq!(index.init_method(), Some(IndexInitMethod::Loaded));
        // 10 was removed pre-init; 20 was re-inserted pre-init with size 0,
        // overriding the loaded metadata; 30 came from the loader.
        assert!(!index.has(10));
        assert!(index.has(20));
        assert!(index.has(30));
        assert_eq!(index.entry_count(), 2);
        assert_eq!(index.cache_size(), 256);
    }

    #[test]
    fn merge_recomputes_cache_size() {
        let (index, _, _dir) = new_index(CacheType::Disk);
        let mut index = index.lock().unwrap();

        let mut load_result = IndexLoadResult::default();
        load_result.did_load = true;
        load_result.init_method = IndexInitMethod::Loaded;
        for hash in 0..10u64 {
            load_result
                .entries
                .insert(hash, EntryMetadata::new(Some(seconds_ago(60)), 1000));
        }
        index.merge_initializing_set(load_result);
        assert_eq!(index.cache_size(), 10 * 1024);
    }

    #[test]
    fn execute_when_ready_fires_after_merge() {
        let (index, _, _dir) = new_index(CacheType::Disk);
        let mut guard = index.lock().unwrap();
        let rx = guard.execute_when_ready();
        mark_initialized(&mut guard);
        drop(guard);
        assert!(matches!(futures::executor::block_on(rx), Ok(Ok(()))));
    }

    #[test]
    fn pending_callbacks_cancelled_on_drop() {
        let (index, _, _dir) = new_index(CacheType::Disk);
        let rx = index.lock().unwrap().execute_when_ready();
        drop(index);
        assert!(matches!(
            futures::executor::block_on(rx),
            Ok(Err(CacheError::Cancelled))
        ));
    }

    #[test]
    fn no_deferred_write_before_initialization() {
        let (index, _, _dir) = new_index(CacheType::Disk);
        let mut index = index.lock().unwrap();
        index.insert(1);
        assert!(!index.has_pending_write());
        mark_initialized(&mut index);
        index.insert(2);
        assert!(index.has_pending_write());
    }

    #[test]
    fn app_cache_does_not_track_access_times() {
        let (index, _, _dir) = new_index(CacheType::App);
        let mut index = index.lock().unwrap();
        mark_initialized(&mut index);

        index.insert(5);
        assert!(index.use_if_exists(5));
        assert_eq!(index.entries[&5].raw_time_for_sorting(), 0);

        assert_eq!(index.trailer_prefetch_size(5), 0);
        index.set_trailer_prefetch_size(5, 8192);
        assert_eq!(index.trailer_prefetch_size(5), 8192);
        assert_eq!(index.trailer_prefetch_size(99), -1);
    }

    #[test]
    fn entries_between_honors_the_epsilons() {
        let (index, _, _dir) = new_index(CacheType::Disk);
        let mut index = index.lock().unwrap();
        mark_initialized(&mut index);

        index.insert_entry_for_test(1, EntryMetadata::new(Some(seconds_ago(100)), 256));
        index.insert_entry_for_test(2, EntryMetadata::new(Some(seconds_ago(50)), 256));
        index.insert_entry_for_test(3, EntryMetadata::new(Some(seconds_ago(5)), 256));

        let mut all = index.entries_between(None, None);
        all.sort_unstable();
        assert_eq!(all, vec![1, 2, 3]);

        let mut recent = index.entries_between(Some(seconds_ago(60)), None);
        recent.sort_unstable();
        assert_eq!(recent, vec![2, 3]);

        let mut mid = index.entries_between(Some(seconds_ago(60)), Some(seconds_ago(10)));
        mid.sort_unstable();
        assert_eq!(mid, vec![2]);

        assert_eq!(index.cache_size_between(Some(seconds_ago(60)), None), 512);
    }

    #[test]
    fn entries_with_no_usage_time_match_only_open_ranges() {
        let (index, _, _dir) = new_index(CacheType::Disk);
        let mut index = index.lock().unwrap();
        mark_initialized(&mut index);

        index.insert_entry_for_test(1, EntryMetadata::new(None, 256));
        assert_eq!(index.entries_between(None, None), vec![1]);
        assert!(index
            .entries_between(Some(UNIX_EPOCH + Duration::from_secs(1000)), None)
            .is_empty());
    }

    #[test]
    fn last_used_time_reports_null_for_unknown_hashes() {
        let (index, _, _dir) = new_index(CacheType::Disk);
        let mut index = index.lock().unwrap();
        mark_initialized(&mut index);
        assert_eq!(index.last_used_time(1), None);
        index.insert(1);
        assert!(index.last_used_time(1).is_some());
    }
}
