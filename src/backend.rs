//! The backend coordinator: one file per entry under a cache directory,
//! entries addressed by key and serialized per 64-bit key hash.
//!
//! The coordinator owns the map of active entries, defers operations behind
//! in-flight dooms and opens-by-hash, resolves hash collisions by dooming
//! the incumbent, and bridges callers to the blocking worker pool. Iteration
//! is safe against concurrent mutation; whether entries created or destroyed
//! during an iteration are observed is undefined.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::SystemTime;

use futures::channel::oneshot;
use log::error;

use crate::cache_type::CacheType;
use crate::cleanup_tracker::CleanupTracker;
use crate::error::{CacheError, CacheResult};
use crate::index::file::IndexFile;
use crate::index::{CacheIndex, DoomDoneCallback, IndexDelegate, IndexInitMethod};
use crate::runner::{self, SequencedRunner};
use crate::tools;
use crate::version_upgrade;

pub mod entry;
pub(crate) mod waiters;

use self::entry::{ActiveEntry, ActiveEntryProxy, EntryHandle};
use self::waiters::{EntryResultSender, PendingOperation, UnitResultSender, WaiterTable};

/// Maximum fraction of the cache one entry may consume.
const MAX_FILE_RATIO: u64 = 8;

const DEFAULT_MAX_CACHE_SIZE: u64 = 80 << 20;
const MIN_DEFAULT_CACHE_SIZE: u64 = 20 << 20;
const MAX_DEFAULT_CACHE_SIZE: u64 = 250 << 20;

/// Scheduling priority a caller attaches to entry operations. Higher
/// priorities sort ahead in the coordinator's per-entry priority values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum RequestPriority {
    Lowest = 0,
    Low = 1,
    Medium = 2,
    High = 3,
    Highest = 4,
}

impl Default for RequestPriority {
    fn default() -> Self {
        RequestPriority::Medium
    }
}

pub(crate) struct ActiveSlot {
    pub(crate) generation: u64,
    pub(crate) entry: Weak<ActiveEntry>,
}

pub(crate) struct BackendState {
    pub(crate) active_entries: HashMap<u64, ActiveSlot>,
    next_generation: u64,
    entry_priority_sequence: u32,
    orig_max_size: u64,
}

impl BackendState {
    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn new_entry_priority(&mut self, priority: RequestPriority) -> u32 {
        // Lower values run first; later entries at the same request
        // priority sort behind earlier ones.
        self.entry_priority_sequence += 1;
        (RequestPriority::Highest as u32 - priority as u32) * 100_000
            + self.entry_priority_sequence
    }
}

pub(crate) struct BackendInner {
    pub(crate) self_weak: Weak<BackendInner>,
    pub(crate) path: PathBuf,
    pub(crate) cache_type: CacheType,
    pub(crate) cleanup_tracker: Option<Arc<CleanupTracker>>,
    pub(crate) cache_runner: Arc<SequencedRunner>,
    pub(crate) index: Arc<Mutex<CacheIndex>>,
    pub(crate) state: Mutex<BackendState>,
    pub(crate) post_doom_waiting: Arc<WaiterTable>,
    pub(crate) post_open_by_hash_waiting: Arc<WaiterTable>,
}

/// The index's doom sink. Invoked with the index lock held, so the actual
/// dooming is deferred onto the runtime.
struct BackendIndexDelegate {
    backend: Weak<BackendInner>,
}

impl IndexDelegate for BackendIndexDelegate {
    fn doom_entries(&self, hashes: Vec<u64>, done: DoomDoneCallback) {
        let backend = self.backend.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match backend.upgrade() {
                        Some(inner) => {
                            let result = inner.doom_entries(hashes).await;
                            done(result);
                        }
                        None => done(Err(CacheError::Cancelled)),
                    }
                });
            }
            Err(_) => {
                error!("eviction requested outside a runtime; dropping");
            }
        }
    }
}

struct DiskStatResult {
    cache_dir_mtime: Option<SystemTime>,
    max_size: u64,
}

enum FindOutcome {
    Found(Arc<ActiveEntry>),
    Deferred(Arc<WaiterTable>),
    /// An active entry with a different key occupies the hash; doom it and
    /// retry, which parks the retried operation behind the doom.
    CollisionDoom(Arc<ActiveEntry>),
}

#[derive(Clone, Copy)]
enum ByKeyOpKind {
    Open,
    Create,
    OpenOrCreate,
}

enum DoomRoute {
    Defer(Arc<WaiterTable>),
    Active(Arc<ActiveEntry>),
    CollisionDoom(Arc<ActiveEntry>),
    Mass,
}

impl BackendInner {
    fn dispatch(&self, operation: PendingOperation) {
        match operation {
            PendingOperation::Open {
                key,
                priority,
                reply,
            } => self.dispatch_by_key(ByKeyOpKind::Open, key, priority, reply),
            PendingOperation::Create {
                key,
                priority,
                reply,
            } => self.dispatch_by_key(ByKeyOpKind::Create, key, priority, reply),
            PendingOperation::OpenOrCreate {
                key,
                priority,
                reply,
            } => self.dispatch_by_key(ByKeyOpKind::OpenOrCreate, key, priority, reply),
            PendingOperation::Doom { key, reply } => self.dispatch_doom(key, reply),
            PendingOperation::OpenByHash { hash, reply } => {
                self.dispatch_open_by_hash(hash, reply)
            }
            PendingOperation::DoomByHash { hash, reply } => {
                self.dispatch_doom_by_hash(hash, reply)
            }
        }
    }

    fn dispatch_by_key(
        &self,
        kind: ByKeyOpKind,
        mut key: String,
        mut priority: RequestPriority,
        mut reply: EntryResultSender,
    ) {
        let hash = tools::entry_hash_key(key.as_bytes());
        loop {
            match self.create_or_find_active_entry(hash, &key, priority) {
                FindOutcome::Found(entry) => {
                    spawn_by_key_operation(kind, entry, reply);
                    return;
                }
                FindOutcome::CollisionDoom(existing) => {
                    // Fire and forget; the retry below queues behind it.
                    let _ = existing.doom();
                    continue;
                }
                FindOutcome::Deferred(table) => {
                    let operation = match kind {
                        ByKeyOpKind::Open => PendingOperation::Open {
                            key,
                            priority,
                            reply,
                        },
                        ByKeyOpKind::Create => PendingOperation::Create {
                            key,
                            priority,
                            reply,
                        },
                        ByKeyOpKind::OpenOrCreate => PendingOperation::OpenOrCreate {
                            key,
                            priority,
                            reply,
                        },
                    };
                    match table.defer(hash, operation) {
                        Ok(()) => return,
                        // The blocking operation completed in the meantime;
                        // take the operation back and re-evaluate.
                        Err(PendingOperation::Open {
                            key: k,
                            priority: p,
                            reply: r,
                        })
                        | Err(PendingOperation::Create {
                            key: k,
                            priority: p,
                            reply: r,
                        })
                        | Err(PendingOperation::OpenOrCreate {
                            key: k,
                            priority: p,
                            reply: r,
                        }) => {
                            key = k;
                            priority = p;
                            reply = r;
                            continue;
                        }
                        Err(_) => unreachable!("by-key operation came back reshaped"),
                    }
                }
            }
        }
    }

    /// Look at the waiter tables and the active map for `hash` and either
    /// return a usable entry, ask the caller to park its operation, or ask
    /// it to doom a colliding incumbent first.
    fn create_or_find_active_entry(
        &self,
        hash: u64,
        key: &str,
        priority: RequestPriority,
    ) -> FindOutcome {
        let mut state = self.state.lock().unwrap();
        if self.post_doom_waiting.has(hash) {
            return FindOutcome::Deferred(self.post_doom_waiting.clone());
        }
        if self.post_open_by_hash_waiting.has(hash) {
            return FindOutcome::Deferred(self.post_open_by_hash_waiting.clone());
        }
        if let Some(slot) = state.active_entries.get(&hash) {
            if let Some(existing) = slot.entry.upgrade() {
                if existing.key_matches(key) {
                    return FindOutcome::Found(existing);
                }
                // A hash collision with a live entry; only one entry per
                // hash may exist at a time.
                return FindOutcome::CollisionDoom(existing);
            }
            // The entry died but its proxy has not run yet.
            state.active_entries.remove(&hash);
        }

        let generation = state.next_generation();
        let priority_value = state.new_entry_priority(priority);
        let entry = ActiveEntry::new(self, hash, Some(key.to_string()), priority_value);
        entry.set_active_entry_proxy(ActiveEntryProxy {
            hash,
            generation,
            backend: self.self_weak.clone(),
        });
        state.active_entries.insert(
            hash,
            ActiveSlot {
                generation,
                entry: Arc::downgrade(&entry),
            },
        );
        FindOutcome::Found(entry)
    }

    fn doom_route(&self, hash: u64, key: Option<&str>, check_open_by_hash: bool) -> DoomRoute {
        let state = self.state.lock().unwrap();
        if self.post_doom_waiting.has(hash) {
            return DoomRoute::Defer(self.post_doom_waiting.clone());
        }
        if check_open_by_hash && self.post_open_by_hash_waiting.has(hash) {
            return DoomRoute::Defer(self.post_open_by_hash_waiting.clone());
        }
        match state
            .active_entries
            .get(&hash)
            .and_then(|slot| slot.entry.upgrade())
        {
            Some(entry) => match key {
                Some(key) if !entry.key_matches(key) => DoomRoute::CollisionDoom(entry),
                _ => DoomRoute::Active(entry),
            },
            None => DoomRoute::Mass,
        }
    }

    fn spawn_mass_doom(&self, hash: u64, reply: UnitResultSender) {
        let inner = match self.self_weak.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = reply.send(inner.doom_entries(vec![hash]).await);
            });
        }
    }

    fn dispatch_doom(&self, mut key: String, mut reply: UnitResultSender) {
        let hash = tools::entry_hash_key(key.as_bytes());
        loop {
            match self.doom_route(hash, Some(&key), true) {
                DoomRoute::Active(entry) => {
                    if let Ok(handle) = tokio::runtime::Handle::try_current() {
                        handle.spawn(async move {
                            let _ = reply.send(entry.doom_and_wait().await);
                        });
                    }
                    return;
                }
                DoomRoute::CollisionDoom(existing) => {
                    let _ = existing.doom();
                    continue;
                }
                DoomRoute::Mass => {
                    // No active entry: delete at the file level, which also
                    // removes the hash from the index.
                    self.spawn_mass_doom(hash, reply);
                    return;
                }
                DoomRoute::Defer(table) => {
                    match table.defer(hash, PendingOperation::Doom { key, reply }) {
                        Ok(()) => return,
                        Err(PendingOperation::Doom { key: k, reply: r }) => {
                            key = k;
                            reply = r;
                            continue;
                        }
                        Err(_) => unreachable!("doom operation came back reshaped"),
                    }
                }
            }
        }
    }

    fn dispatch_doom_by_hash(&self, hash: u64, mut reply: UnitResultSender) {
        loop {
            match self.doom_route(hash, None, false) {
                DoomRoute::Active(entry) => {
                    if let Ok(handle) = tokio::runtime::Handle::try_current() {
                        handle.spawn(async move {
                            let _ = reply.send(entry.doom_and_wait().await);
                        });
                    }
                    return;
                }
                DoomRoute::CollisionDoom(_) => unreachable!("doom by hash carries no key"),
                DoomRoute::Mass => {
                    self.spawn_mass_doom(hash, reply);
                    return;
                }
                DoomRoute::Defer(table) => {
                    match table.defer(hash, PendingOperation::DoomByHash { hash, reply }) {
                        Ok(()) => return,
                        Err(PendingOperation::DoomByHash { reply: r, .. }) => {
                            reply = r;
                            continue;
                        }
                        Err(_) => unreachable!("doom operation came back reshaped"),
                    }
                }
            }
        }
    }

    fn dispatch_open_by_hash(&self, hash: u64, mut reply: EntryResultSender) {
        loop {
            // Moved out of the lock scope so a last reference never drops
            // while the state lock is held.
            let active: Option<Arc<ActiveEntry>> = {
                let mut state = self.state.lock().unwrap();
                if self.post_doom_waiting.has(hash) {
                    drop(state);
                    match self
                        .post_doom_waiting
                        .defer(hash, PendingOperation::OpenByHash { hash, reply })
                    {
                        Ok(()) => return,
                        Err(PendingOperation::OpenByHash { reply: r, .. }) => {
                            reply = r;
                            continue;
                        }
                        Err(_) => unreachable!("open-by-hash operation came back reshaped"),
                    }
                }
                match state
                    .active_entries
                    .get(&hash)
                    .and_then(|slot| slot.entry.upgrade())
                {
                    Some(entry) => Some(entry),
                    None => {
                        // Nothing active: read the key from disk with a
                        // detached entry. Until it finishes, by-key
                        // operations on this hash cannot check for
                        // collisions and are parked.
                        self.post_open_by_hash_waiting.start(hash);
                        let priority_value =
                            state.new_entry_priority(RequestPriority::default());
                        drop(state);
                        let entry = ActiveEntry::new(self, hash, None, priority_value);
                        let inner = match self.self_weak.upgrade() {
                            Some(inner) => inner,
                            None => {
                                self.finish_open_by_hash(hash);
                                return;
                            }
                        };
                        if let Ok(handle) = tokio::runtime::Handle::try_current() {
                            handle.spawn(async move {
                                let result = entry.open().await;
                                inner.on_entry_opened_from_hash(hash, entry, result, reply);
                            });
                        } else {
                            self.finish_open_by_hash(hash);
                        }
                        return;
                    }
                }
            };
            match active.and_then(|entry| entry.key()) {
                Some(key) => {
                    // Re-enter as a by-key open through the active entry.
                    self.dispatch_by_key(
                        ByKeyOpKind::Open,
                        key,
                        RequestPriority::default(),
                        reply,
                    );
                    return;
                }
                None => {
                    // The active entry is itself a half-open by-hash entry;
                    // queue behind the open-by-hash in flight.
                    match self
                        .post_open_by_hash_waiting
                        .defer(hash, PendingOperation::OpenByHash { hash, reply })
                    {
                        Ok(()) => return,
                        Err(PendingOperation::OpenByHash { reply: r, .. }) => {
                            reply = r;
                            continue;
                        }
                        Err(_) => unreachable!("open-by-hash operation came back reshaped"),
                    }
                }
            }
        }
    }

    fn on_entry_opened_from_hash(
        &self,
        hash: u64,
        entry: Arc<ActiveEntry>,
        result: CacheResult<()>,
        reply: EntryResultSender,
    ) {
        match result {
            Err(e) => {
                self.finish_open_by_hash(hash);
                let _ = reply.send(Err(e));
            }
            Ok(()) => {
                let winner = {
                    let mut state = self.state.lock().unwrap();
                    match state
                        .active_entries
                        .get(&hash)
                        .and_then(|slot| slot.entry.upgrade())
                    {
                        Some(installed) => Some(installed),
                        None => {
                            let generation = state.next_generation();
                            entry.set_active_entry_proxy(ActiveEntryProxy {
                                hash,
                                generation,
                                backend: self.self_weak.clone(),
                            });
                            state.active_entries.insert(
                                hash,
                                ActiveSlot {
                                    generation,
                                    entry: Arc::downgrade(&entry),
                                },
                            );
                            None
                        }
                    }
                };
                self.finish_open_by_hash(hash);
                match winner {
                    None => {
                        let _ = reply.send(Ok(EntryHandle::new(entry)));
                    }
                    Some(installed) => {
                        // Another opener installed an entry for this hash
                        // while the key was being read; close ours and hand
                        // back a handle to the winner for one coherent view.
                        drop(entry);
                        match installed.key() {
                            Some(key) => self.dispatch_by_key(
                                ByKeyOpKind::Open,
                                key,
                                RequestPriority::default(),
                                reply,
                            ),
                            None => {
                                let _ = reply.send(Err(CacheError::NotFound));
                            }
                        }
                    }
                }
            }
        }
    }

    fn finish_open_by_hash(&self, hash: u64) {
        let operations = self.post_open_by_hash_waiting.finish(hash);
        for operation in operations {
            self.dispatch(operation);
        }
    }

    pub(crate) fn on_doom_complete(&self, hash: u64) {
        let operations = self.post_doom_waiting.finish(hash);
        for operation in operations {
            self.dispatch(operation);
        }
    }

    /// Mass-doom protocol: entries that are open or already dooming are
    /// doomed through their handles to avoid racing their file I/O; the
    /// remainder has its files deleted wholesale on the worker pool. The
    /// caller's future completes when everything has; the first error wins
    /// and later ones are dropped.
    pub(crate) async fn doom_entries(&self, hashes: Vec<u64>) -> CacheResult<()> {
        let mut individual = Vec::new();
        let mut mass = Vec::new();
        {
            // The upgraded handles outlive the state lock: dropping a last
            // reference under it would re-enter the lock via the proxy.
            let mut alive = Vec::new();
            let state = self.state.lock().unwrap();
            for hash in hashes {
                let active = state
                    .active_entries
                    .get(&hash)
                    .and_then(|slot| slot.entry.upgrade());
                let is_active = active.is_some();
                alive.extend(active);
                if is_active || self.post_doom_waiting.has(hash) {
                    individual.push(hash);
                } else {
                    mass.push(hash);
                    self.post_doom_waiting.start(hash);
                }
            }
            drop(state);
            drop(alive);
        }
        {
            let mut index = self.index.lock().unwrap();
            for hash in individual.iter().chain(mass.iter()) {
                index.remove(*hash);
            }
        }

        let (barrier, completion) = Barrier::new(individual.len() + 1);

        for hash in individual {
            let (tx, rx) = oneshot::channel();
            self.dispatch(PendingOperation::DoomByHash { hash, reply: tx });
            let signal = barrier.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        let result = rx.await.unwrap_or(Err(CacheError::Cancelled));
                        signal.signal(result);
                    });
                }
                Err(_) => signal.signal(Err(CacheError::Cancelled)),
            }
        }

        {
            let signal = barrier.clone();
            let inner = self.self_weak.upgrade();
            let cache_directory = self.path.clone();
            match (inner, tokio::runtime::Handle::try_current()) {
                (Some(inner), Ok(handle)) => {
                    handle.spawn(async move {
                        let files = mass.clone();
                        let deleted = runner::run_blocking(move || {
                            entry::sync_doom_entry_set(&cache_directory, &files)
                        })
                        .await
                        .and_then(|r| r);
                        for hash in &mass {
                            inner.on_doom_complete(*hash);
                        }
                        signal.signal(deleted);
                    });
                }
                _ => {
                    for hash in &mass {
                        self.on_doom_complete(*hash);
                    }
                    signal.signal(Err(CacheError::Cancelled));
                }
            }
        }

        completion.await.map_err(|_| CacheError::Cancelled)?
    }

    async fn index_ready(&self) -> CacheResult<()> {
        let ready = self.index.lock().unwrap().execute_when_ready();
        ready.await.map_err(|_| CacheError::Cancelled)?
    }

    fn init_cache_structure_on_disk(
        path: &Path,
        suggested_max_size: u64,
    ) -> CacheResult<DiskStatResult> {
        if !path.is_dir() {
            fs::create_dir_all(path).map_err(|e| CacheError::path(path, &e))?;
        }
        version_upgrade::upgrade_cache_on_disk(path)?;

        let cache_dir_mtime = tools::get_mtime(path).ok();
        let max_size = if suggested_max_size > 0 {
            suggested_max_size
        } else {
            preferred_cache_size(path)
        };
        Ok(DiskStatResult {
            cache_dir_mtime,
            max_size,
        })
    }
}

fn spawn_by_key_operation(kind: ByKeyOpKind, entry: Arc<ActiveEntry>, reply: EntryResultSender) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            let result = match kind {
                ByKeyOpKind::Open => entry.open().await,
                ByKeyOpKind::Create => entry.create().await,
                ByKeyOpKind::OpenOrCreate => entry.open_or_create().await,
            };
            let _ = reply.send(result.map(|()| EntryHandle::new(entry)));
        });
    }
}

fn preferred_cache_size(path: &Path) -> u64 {
    match nix::sys::statvfs::statvfs(path) {
        Ok(vfs) => {
            let available = vfs.blocks_available() as u64 * vfs.fragment_size() as u64;
            (available / 10).clamp(MIN_DEFAULT_CACHE_SIZE, MAX_DEFAULT_CACHE_SIZE)
        }
        Err(_) => DEFAULT_MAX_CACHE_SIZE,
    }
}

/// Fan-in completion: waits for `expected` successes, or reports the first
/// error immediately while the remaining operations continue internally.
#[derive(Clone)]
struct Barrier {
    state: Arc<Mutex<BarrierState>>,
}

struct BarrierState {
    expected: usize,
    count: usize,
    had_error: bool,
    completion: Option<oneshot::Sender<CacheResult<()>>>,
}

impl Barrier {
    fn new(expected: usize) -> (Barrier, oneshot::Receiver<CacheResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Barrier {
                state: Arc::new(Mutex::new(BarrierState {
                    expected,
                    count: 0,
                    had_error: false,
                    completion: Some(tx),
                })),
            },
            rx,
        )
    }

    fn signal(&self, result: CacheResult<()>) {
        let mut state = self.state.lock().unwrap();
        if state.had_error {
            return;
        }
        match result {
            Err(e) => {
                state.had_error = true;
                if let Some(completion) = state.completion.take() {
                    let _ = completion.send(Err(e));
                }
            }
            Ok(()) => {
                state.count += 1;
                if state.count == state.expected {
                    if let Some(completion) = state.completion.take() {
                        let _ = completion.send(Ok(()));
                    }
                }
            }
        }
    }
}

/// The public face of the cache.
pub struct CacheBackend {
    inner: Arc<BackendInner>,
}

impl CacheBackend {
    /// Build a backend over `path`. `max_bytes` of zero selects a default
    /// from the free space of the underlying filesystem. `init` must be
    /// called once before any other operation.
    pub fn new(
        path: impl Into<PathBuf>,
        cleanup_tracker: Option<Arc<CleanupTracker>>,
        max_bytes: u64,
        cache_type: CacheType,
    ) -> CacheBackend {
        let path = path.into();
        let inner = Arc::new_cyclic(|weak: &Weak<BackendInner>| {
            let cache_runner = SequencedRunner::new("objcache-index");
            let index_file = Arc::new(IndexFile::new(
                cache_runner.clone(),
                cache_type,
                path.clone(),
            ));
            let delegate = Arc::new(BackendIndexDelegate {
                backend: weak.clone(),
            });
            let index = CacheIndex::new(
                cleanup_tracker.clone(),
                delegate,
                cache_type,
                index_file,
            );
            BackendInner {
                self_weak: weak.clone(),
                path,
                cache_type,
                cleanup_tracker,
                cache_runner,
                index,
                state: Mutex::new(BackendState {
                    active_entries: HashMap::new(),
                    next_generation: 0,
                    entry_priority_sequence: 0,
                    orig_max_size: max_bytes,
                }),
                post_doom_waiting: WaiterTable::new(),
                post_open_by_hash_waiting: WaiterTable::new(),
            }
        });
        CacheBackend { inner }
    }

    /// Finish initialization: create the directory if needed, verify or
    /// upgrade the on-disk version, then start loading the index. Returns
    /// once the disk structure has been validated; the index keeps loading
    /// in the background and operations that need it wait on their own.
    pub async fn init(&self) -> CacheResult<()> {
        let path = self.inner.path.clone();
        let suggested_max_size = self.inner.state.lock().unwrap().orig_max_size;
        let stat = self
            .inner
            .cache_runner
            .run(move || BackendInner::init_cache_structure_on_disk(&path, suggested_max_size))
            .await??;

        let mut index = self.inner.index.lock().unwrap();
        index.set_max_size(stat.max_size);
        index.initialize(stat.cache_dir_mtime);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn cache_type(&self) -> CacheType {
        self.inner.cache_type
    }

    /// Number of indexed entries.
    pub fn entry_count(&self) -> usize {
        self.inner.index.lock().unwrap().entry_count()
    }

    /// Total accounted size in bytes; meaningful once the index is ready.
    pub fn cache_size(&self) -> u64 {
        self.inner.index.lock().unwrap().cache_size()
    }

    /// Largest file a single entry may occupy.
    pub fn max_file_size(&self) -> u64 {
        self.inner.index.lock().unwrap().max_size() / MAX_FILE_RATIO
    }

    pub fn set_max_size(&self, max_bytes: u64) -> bool {
        self.inner.state.lock().unwrap().orig_max_size = max_bytes;
        self.inner.index.lock().unwrap().set_max_size(max_bytes);
        true
    }

    /// How the index came up, once it has.
    pub fn init_method(&self) -> Option<IndexInitMethod> {
        self.inner.index.lock().unwrap().init_method()
    }

    /// Completes when the index has finished loading or rebuilding.
    pub async fn index_ready(&self) -> CacheResult<()> {
        self.inner.index_ready().await
    }

    pub async fn open_entry(
        &self,
        key: &str,
        priority: RequestPriority,
    ) -> CacheResult<EntryHandle> {
        let (tx, rx) = oneshot::channel();
        self.inner.dispatch(PendingOperation::Open {
            key: key.to_string(),
            priority,
            reply: tx,
        });
        rx.await.map_err(|_| CacheError::Cancelled)?
    }

    pub async fn create_entry(
        &self,
        key: &str,
        priority: RequestPriority,
    ) -> CacheResult<EntryHandle> {
        let (tx, rx) = oneshot::channel();
        self.inner.dispatch(PendingOperation::Create {
            key: key.to_string(),
            priority,
            reply: tx,
        });
        rx.await.map_err(|_| CacheError::Cancelled)?
    }

    pub async fn open_or_create_entry(
        &self,
        key: &str,
        priority: RequestPriority,
    ) -> CacheResult<EntryHandle> {
        let (tx, rx) = oneshot::channel();
        self.inner.dispatch(PendingOperation::OpenOrCreate {
            key: key.to_string(),
            priority,
            reply: tx,
        });
        rx.await.map_err(|_| CacheError::Cancelled)?
    }

    /// Doom the entry for `key`, whether or not it is open.
    pub async fn doom_entry(&self, key: &str) -> CacheResult<()> {
        let (tx, rx) = oneshot::channel();
        self.inner.dispatch(PendingOperation::Doom {
            key: key.to_string(),
            reply: tx,
        });
        rx.await.map_err(|_| CacheError::Cancelled)?
    }

    /// Open an entry knowing only its hash; the key is read back from disk.
    pub async fn open_entry_from_hash(&self, hash: u64) -> CacheResult<EntryHandle> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .dispatch(PendingOperation::OpenByHash { hash, reply: tx });
        rx.await.map_err(|_| CacheError::Cancelled)?
    }

    pub async fn doom_all_entries(&self) -> CacheResult<()> {
        self.doom_entries_between(None, None).await
    }

    /// Doom all entries last used within `[initial_time, end_time)`.
    pub async fn doom_entries_between(
        &self,
        initial_time: Option<SystemTime>,
        end_time: Option<SystemTime>,
    ) -> CacheResult<()> {
        self.inner.index_ready().await?;
        let hashes = self
            .inner
            .index
            .lock()
            .unwrap()
            .entries_between(initial_time, end_time);
        self.inner.doom_entries(hashes).await
    }

    pub async fn doom_entries_since(&self, initial_time: SystemTime) -> CacheResult<()> {
        self.doom_entries_between(Some(initial_time), None).await
    }

    pub async fn size_of_all_entries(&self) -> CacheResult<u64> {
        self.inner.index_ready().await?;
        Ok(self.inner.index.lock().unwrap().cache_size())
    }

    pub async fn size_of_entries_between(
        &self,
        initial_time: Option<SystemTime>,
        end_time: Option<SystemTime>,
    ) -> CacheResult<u64> {
        self.inner.index_ready().await?;
        Ok(self
            .inner
            .index
            .lock()
            .unwrap()
            .cache_size_between(initial_time, end_time))
    }

    /// Snapshot-based entry iterator.
    pub fn iterator(&self) -> BackendIterator {
        BackendIterator {
            backend: Arc::downgrade(&self.inner),
            hashes: None,
        }
    }

    /// Note a hit served by a higher-level cache so the entry's last used
    /// time stays fresh.
    pub fn external_cache_hit(&self, key: &str) {
        let hash = tools::entry_hash_key(key.as_bytes());
        self.inner.index.lock().unwrap().use_if_exists(hash);
    }

    pub fn entry_in_memory_data(&self, key: &str) -> u8 {
        let hash = tools::entry_hash_key(key.as_bytes());
        self.inner.index.lock().unwrap().entry_in_memory_data(hash)
    }

    pub fn set_entry_in_memory_data(&self, key: &str, data: u8) {
        let hash = tools::entry_hash_key(key.as_bytes());
        self.inner
            .index
            .lock()
            .unwrap()
            .set_entry_in_memory_data(hash, data)
    }

    /// `None` for unknown hashes or entries without a recorded use.
    pub fn last_used_time(&self, hash: u64) -> Option<SystemTime> {
        self.inner.index.lock().unwrap().last_used_time(hash)
    }

    /// Drive the index write cadence from app lifecycle transitions.
    pub fn set_app_on_background(&self, on_background: bool) {
        self.inner
            .index
            .lock()
            .unwrap()
            .set_app_on_background(on_background)
    }
}

/// Iterates the hashes the index knew at the first call, opening each in
/// turn. Hashes that vanish mid-walk are skipped; a finished walk yields
/// `Ok(None)`. Results are crash-safe but not transactional.
pub struct BackendIterator {
    backend: Weak<BackendInner>,
    hashes: Option<Vec<u64>>,
}

impl BackendIterator {
    pub async fn next_entry(&mut self) -> CacheResult<Option<EntryHandle>> {
        let inner = self.backend.upgrade().ok_or(CacheError::Cancelled)?;
        inner.index_ready().await?;

        if self.hashes.is_none() {
            self.hashes = Some(inner.index.lock().unwrap().all_hashes());
        }
        while let Some(hash) = self.hashes.as_mut().and_then(Vec::pop) {
            if !inner.index.lock().unwrap().has(hash) {
                continue;
            }
            let (tx, rx) = oneshot::channel();
            inner.dispatch(PendingOperation::OpenByHash { hash, reply: tx });
            match rx.await.map_err(|_| CacheError::Cancelled)? {
                Ok(handle) => return Ok(Some(handle)),
                // The entry disappeared between the snapshot and the open.
                Err(CacheError::NotFound) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}
