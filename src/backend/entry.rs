//! Active entries: the per-entry objects the coordinator hands out.
//!
//! One `ActiveEntry` exists per hash at a time; every concurrent opener of
//! the same key shares it. The entry performs header-level file I/O on the
//! worker pool: enough to create an entry on disk, verify and read back its
//! key, and delete its stream files on doom. Its operations serialize in
//! call order through a fair async mutex.

use std::convert::TryInto;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use futures::channel::oneshot;
use log::warn;

use crate::backend::waiters::WaiterTable;
use crate::backend::BackendInner;
use crate::error::{CacheError, CacheResult};
use crate::index::pickle::crc32;
use crate::runner;
use crate::tools;

const ENTRY_MAGIC_NUMBER: u64 = 0xfcfb6d1ba7725c30;
const ENTRY_VERSION: u32 = 5;
const ENTRY_HEADER_SIZE: usize = 20;
const MAX_KEY_LENGTH: u32 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DoomState {
    None,
    Pending,
    Done,
}

struct EntryState {
    key: Option<String>,
    doom: DoomState,
    proxy: Option<ActiveEntryProxy>,
    doom_waiters: Vec<oneshot::Sender<CacheResult<()>>>,
}

/// Removes the owning entry from the coordinator's active map when dropped,
/// but only while its registration generation still matches; a successor
/// entry for the same hash must not be evicted from the map by a stale
/// proxy.
pub(crate) struct ActiveEntryProxy {
    pub(crate) hash: u64,
    pub(crate) generation: u64,
    pub(crate) backend: Weak<BackendInner>,
}

impl Drop for ActiveEntryProxy {
    fn drop(&mut self) {
        if let Some(backend) = self.backend.upgrade() {
            let mut state = backend.state.lock().unwrap();
            let stale = state
                .active_entries
                .get(&self.hash)
                .map_or(false, |slot| slot.generation == self.generation);
            if stale {
                state.active_entries.remove(&self.hash);
            }
        }
    }
}

pub(crate) struct ActiveEntry {
    self_weak: Weak<ActiveEntry>,
    hash: u64,
    cache_directory: PathBuf,
    priority: u32,
    backend: Weak<BackendInner>,
    post_doom_waiting: Arc<WaiterTable>,
    state: Mutex<EntryState>,
    // Fair, so per-entry operations run in call order.
    operation_lock: tokio::sync::Mutex<()>,
}

impl ActiveEntry {
    pub(crate) fn new(
        backend: &BackendInner,
        hash: u64,
        key: Option<String>,
        priority: u32,
    ) -> Arc<ActiveEntry> {
        Arc::new_cyclic(|self_weak| ActiveEntry {
            self_weak: self_weak.clone(),
            hash,
            cache_directory: backend.path.clone(),
            priority,
            backend: backend.self_weak.clone(),
            post_doom_waiting: backend.post_doom_waiting.clone(),
            state: Mutex::new(EntryState {
                key,
                doom: DoomState::None,
                proxy: None,
                doom_waiters: Vec::new(),
            }),
            operation_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub(crate) fn hash(&self) -> u64 {
        self.hash
    }

    pub(crate) fn priority(&self) -> u32 {
        self.priority
    }

    pub(crate) fn key(&self) -> Option<String> {
        self.state.lock().unwrap().key.clone()
    }

    pub(crate) fn key_matches(&self, key: &str) -> bool {
        self.state.lock().unwrap().key.as_deref() == Some(key)
    }

    /// Must be called exactly once per installed entry.
    pub(crate) fn set_active_entry_proxy(&self, proxy: ActiveEntryProxy) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.proxy.is_none());
        state.proxy = Some(proxy);
    }

    pub(crate) fn estimate_memory_usage(&self) -> usize {
        std::mem::size_of::<ActiveEntry>()
            + self
                .state
                .lock()
                .unwrap()
                .key
                .as_ref()
                .map_or(0, |k| k.len())
    }

    fn is_doomed(&self) -> bool {
        self.state.lock().unwrap().doom != DoomState::None
    }

    /// Open the entry from its files, verifying the stored key. For entries
    /// opened by hash alone the key learned from disk is retained.
    pub(crate) async fn open(&self) -> CacheResult<()> {
        let _guard = self.operation_lock.lock().await;
        self.open_locked().await
    }

    pub(crate) async fn create(&self) -> CacheResult<()> {
        let _guard = self.operation_lock.lock().await;
        self.create_locked().await
    }

    pub(crate) async fn open_or_create(&self) -> CacheResult<()> {
        let _guard = self.operation_lock.lock().await;
        match self.open_locked().await {
            Err(CacheError::NotFound) => self.create_locked().await,
            result => result,
        }
    }

    async fn open_locked(&self) -> CacheResult<()> {
        if self.is_doomed() {
            return Err(CacheError::NotFound);
        }
        let backend = self.backend.upgrade().ok_or(CacheError::Cancelled)?;

        // A miss recorded by an initialized index saves the disk round trip.
        if !backend.index.lock().unwrap().has(self.hash) {
            return Err(CacheError::NotFound);
        }

        let cache_directory = self.cache_directory.clone();
        let hash = self.hash;
        let expected_key = self.key();
        let (key, total_size) = runner::run_blocking(move || {
            sync_open_entry(&cache_directory, hash, expected_key.as_deref())
        })
        .await??;

        {
            let mut state = self.state.lock().unwrap();
            if state.key.is_none() {
                state.key = Some(key);
            }
        }
        {
            let mut index = backend.index.lock().unwrap();
            index.use_if_exists(self.hash);
            // Self-correct the accounted size from what is actually on disk.
            index.update_entry_size(self.hash, clamp_u32(total_size));
        }
        Ok(())
    }

    async fn create_locked(&self) -> CacheResult<()> {
        if self.is_doomed() {
            return Err(CacheError::NotFound);
        }
        let backend = self.backend.upgrade().ok_or(CacheError::Cancelled)?;
        let key = self
            .key()
            .expect("create requires an entry constructed with its key");

        backend.index.lock().unwrap().insert(self.hash);

        let cache_directory = self.cache_directory.clone();
        let hash = self.hash;
        let result =
            runner::run_blocking(move || sync_create_entry(&cache_directory, hash, &key)).await?;
        match result {
            Ok(total_size) => {
                backend
                    .index
                    .lock()
                    .unwrap()
                    .update_entry_size(self.hash, clamp_u32(total_size));
                Ok(())
            }
            Err(e) => {
                // A create that lost to an existing on-disk entry must not
                // de-index that entry; only real failures roll back.
                if !matches!(e, CacheError::AlreadyExists) {
                    backend.index.lock().unwrap().remove(self.hash);
                }
                Err(e)
            }
        }
    }

    /// Mark the entry as dooming and delete its backing files. Idempotent:
    /// later calls await the same completion. Incoming operations on this
    /// hash are deferred from the moment this returns.
    pub(crate) fn doom(&self) -> oneshot::Receiver<CacheResult<()>> {
        let (tx, rx) = oneshot::channel();
        let proxy = {
            let mut state = self.state.lock().unwrap();
            match state.doom {
                DoomState::Done => {
                    let _ = tx.send(Ok(()));
                    return rx;
                }
                DoomState::Pending => {
                    state.doom_waiters.push(tx);
                    return rx;
                }
                DoomState::None => {}
            }
            state.doom = DoomState::Pending;
            state.doom_waiters.push(tx);
            state.proxy.take()
        };

        // Operations arriving from here on queue behind the doom.
        self.post_doom_waiting.start(self.hash);
        // Detaching the proxy removes this entry from the active map, so a
        // subsequent open builds a fresh entry once the doom completes.
        drop(proxy);
        if let Some(backend) = self.backend.upgrade() {
            backend.index.lock().unwrap().remove(self.hash);
        }

        let entry = self.self_weak.upgrade();
        let cache_directory = self.cache_directory.clone();
        let hash = self.hash;
        match (entry, tokio::runtime::Handle::try_current()) {
            (Some(entry), Ok(handle)) => {
                handle.spawn(async move {
                    let result = runner::run_blocking(move || {
                        sync_doom_entry_set(&cache_directory, &[hash])
                    })
                    .await
                    .and_then(|r| r);
                    entry.finish_doom(result);
                });
            }
            _ => {
                // No runtime to carry the file deletion; fail the doom but
                // keep the bookkeeping consistent.
                self.finish_doom(Err(CacheError::Cancelled));
            }
        }
        rx
    }

    pub(crate) async fn doom_and_wait(&self) -> CacheResult<()> {
        self.doom().await.map_err(|_| CacheError::Cancelled)?
    }

    fn finish_doom(&self, result: CacheResult<()>) {
        let waiters = {
            let mut state = self.state.lock().unwrap();
            state.doom = DoomState::Done;
            std::mem::take(&mut state.doom_waiters)
        };
        // Replay deferred operations before reporting completion, preserving
        // their queue order.
        if let Some(backend) = self.backend.upgrade() {
            backend.on_doom_complete(self.hash);
        } else {
            let _ = self.post_doom_waiting.finish(self.hash);
        }
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }
}

/// A caller's reference to an open entry. Dropping the handle closes it;
/// the entry object itself is destroyed when the last handle and the last
/// in-flight operation are gone, removing it from the coordinator's map.
pub struct EntryHandle {
    entry: Arc<ActiveEntry>,
}

impl EntryHandle {
    pub(crate) fn new(entry: Arc<ActiveEntry>) -> EntryHandle {
        EntryHandle { entry }
    }

    /// The entry's key. Known for every installed entry, including ones
    /// opened by hash (the key is read back from disk).
    pub fn key(&self) -> Option<String> {
        self.entry.key()
    }

    pub fn hash(&self) -> u64 {
        self.entry.hash()
    }

    pub fn priority(&self) -> u32 {
        self.entry.priority()
    }

    pub fn is_doomed(&self) -> bool {
        self.entry.is_doomed()
    }

    /// Mark the entry for destruction. Subsequent operations observe the
    /// doomed state; the backing files are deleted asynchronously.
    pub async fn doom(&self) -> CacheResult<()> {
        self.entry.doom_and_wait().await
    }

    /// Explicit close; equivalent to dropping the handle.
    pub fn close(self) {}

    pub fn estimate_memory_usage(&self) -> usize {
        self.entry.estimate_memory_usage()
    }
}

fn clamp_u32(value: u64) -> u32 {
    value.min(u64::from(u32::MAX)) as u32
}

fn corrupt_entry(message: &str) -> CacheError {
    CacheError::EntryIo {
        kind: std::io::ErrorKind::InvalidData,
        message: message.to_string(),
    }
}

fn entry_header_bytes(key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(ENTRY_HEADER_SIZE + key.len());
    out.extend_from_slice(&ENTRY_MAGIC_NUMBER.to_le_bytes());
    out.extend_from_slice(&ENTRY_VERSION.to_le_bytes());
    out.extend_from_slice(&(key.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc32(key.as_bytes()).to_le_bytes());
    out.extend_from_slice(key.as_bytes());
    out
}

/// Total on-disk footprint of an entry: the sizes of all its stream files.
fn sum_entry_file_sizes(cache_directory: &Path, hash: u64) -> u64 {
    let mut total = 0u64;
    for file_index in 0..tools::ENTRY_FILE_COUNT {
        let path = cache_directory.join(tools::entry_file_name(hash, file_index));
        if let Ok(metadata) = fs::metadata(&path) {
            total = total.saturating_add(metadata.len());
        }
    }
    total
}

/// Create the first stream file of a fresh entry. Fails with
/// `AlreadyExists` when the entry is already on disk.
pub(crate) fn sync_create_entry(
    cache_directory: &Path,
    hash: u64,
    key: &str,
) -> CacheResult<u64> {
    let path = cache_directory.join(tools::entry_file_name(hash, 0));
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)?;
    let bytes = entry_header_bytes(key);
    if let Err(e) = file.write_all(&bytes) {
        drop(file);
        tools::delete_cache_file(&path);
        return Err(e.into());
    }
    Ok(bytes.len() as u64)
}

/// Read and verify the header of an entry's first stream file, returning
/// the stored key and the entry's total on-disk size. With `expected_key`
/// set, a key mismatch (a hash collision on disk) reads as absence.
pub(crate) fn sync_open_entry(
    cache_directory: &Path,
    hash: u64,
    expected_key: Option<&str>,
) -> CacheResult<(String, u64)> {
    let path = cache_directory.join(tools::entry_file_name(hash, 0));
    let mut file = fs::File::open(&path)?;

    let mut header = [0u8; ENTRY_HEADER_SIZE];
    file.read_exact(&mut header)
        .map_err(|_| corrupt_entry("short entry header"))?;
    let magic = u64::from_le_bytes(header[0..8].try_into().unwrap());
    let version = u32::from_le_bytes(header[8..12].try_into().unwrap());
    let key_length = u32::from_le_bytes(header[12..16].try_into().unwrap());
    let key_hash = u32::from_le_bytes(header[16..20].try_into().unwrap());

    if magic != ENTRY_MAGIC_NUMBER {
        return Err(corrupt_entry("bad entry magic"));
    }
    if version != ENTRY_VERSION {
        return Err(corrupt_entry("unsupported entry version"));
    }
    if key_length > MAX_KEY_LENGTH {
        return Err(corrupt_entry("entry key too long"));
    }

    let mut key_bytes = vec![0u8; key_length as usize];
    file.read_exact(&mut key_bytes)
        .map_err(|_| corrupt_entry("short entry key"))?;
    if crc32(&key_bytes) != key_hash {
        return Err(corrupt_entry("entry key checksum mismatch"));
    }
    let key = String::from_utf8(key_bytes).map_err(|_| corrupt_entry("entry key not utf-8"))?;
    if tools::entry_hash_key(key.as_bytes()) != hash {
        return Err(corrupt_entry("entry key does not match its file name"));
    }
    if let Some(expected) = expected_key {
        if expected != key {
            // The file belongs to a colliding key; for this caller the
            // entry does not exist.
            return Err(CacheError::NotFound);
        }
    }

    let total_size = sum_entry_file_sizes(cache_directory, hash);
    Ok((key, total_size))
}

/// Delete the stream files of every hash in the set. Used by mass doom,
/// where none of the hashes has an open handle.
pub(crate) fn sync_doom_entry_set(cache_directory: &Path, hashes: &[u64]) -> CacheResult<()> {
    let mut first_error: Option<CacheError> = None;
    for hash in hashes {
        for file_index in 0..tools::ENTRY_FILE_COUNT {
            let path = cache_directory.join(tools::entry_file_name(*hash, file_index));
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("failed to delete {:?}: {}", path, e);
                    if first_error.is_none() {
                        first_error = Some(e.into());
                    }
                }
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_open_round_trips_the_key() {
        let dir = tempfile::tempdir().unwrap();
        let key = "http://www.example.com/index.html";
        let hash = tools::entry_hash_key(key.as_bytes());

        let written = sync_create_entry(dir.path(), hash, key).unwrap();
        assert_eq!(written as usize, ENTRY_HEADER_SIZE + key.len());

        let (read_key, total) = sync_open_entry(dir.path(), hash, Some(key)).unwrap();
        assert_eq!(read_key, key);
        assert_eq!(total, written);

        // Open by hash alone learns the key from disk.
        let (read_key, _) = sync_open_entry(dir.path(), hash, None).unwrap();
        assert_eq!(read_key, key);
    }

    #[test]
    fn create_refuses_to_clobber() {
        let dir = tempfile::tempdir().unwrap();
        let key = "k";
        let hash = tools::entry_hash_key(key.as_bytes());
        sync_create_entry(dir.path(), hash, key).unwrap();
        assert!(matches!(
            sync_create_entry(dir.path(), hash, key),
            Err(CacheError::AlreadyExists)
        ));
    }

    #[test]
    fn open_missing_entry_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            sync_open_entry(dir.path(), 0x42, None),
            Err(CacheError::NotFound)
        ));
    }

    #[test]
    fn open_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let key = "some key";
        let hash = tools::entry_hash_key(key.as_bytes());
        sync_create_entry(dir.path(), hash, key).unwrap();

        let path = dir.path().join(tools::entry_file_name(hash, 0));
        let mut bytes = fs::read(&path).unwrap();
        bytes[3] ^= 0x01;
        fs::write(&path, bytes).unwrap();

        assert!(matches!(
            sync_open_entry(dir.path(), hash, Some(key)),
            Err(CacheError::EntryIo { .. })
        ));
    }

    #[test]
    fn doom_set_removes_every_stream_file() {
        let dir = tempfile::tempdir().unwrap();
        let key = "victim";
        let hash = tools::entry_hash_key(key.as_bytes());
        sync_create_entry(dir.path(), hash, key).unwrap();
        // Extra stream files of the same entry are removed too.
        fs::write(dir.path().join(tools::entry_file_name(hash, 1)), b"body").unwrap();

        sync_doom_entry_set(dir.path(), &[hash]).unwrap();
        for file_index in 0..tools::ENTRY_FILE_COUNT {
            assert!(!dir
                .path()
                .join(tools::entry_file_name(hash, file_index))
                .exists());
        }
    }

    #[test]
    fn sizes_sum_across_stream_files() {
        let dir = tempfile::tempdir().unwrap();
        let key = "sized";
        let hash = tools::entry_hash_key(key.as_bytes());
        let base = sync_create_entry(dir.path(), hash, key).unwrap();
        fs::write(dir.path().join(tools::entry_file_name(hash, 1)), vec![0u8; 100]).unwrap();
        fs::write(dir.path().join(tools::entry_file_name(hash, 2)), vec![0u8; 50]).unwrap();

        let (_, total) = sync_open_entry(dir.path(), hash, Some(key)).unwrap();
        assert_eq!(total, base + 150);
    }
}
