//! On-disk index codec and the directory salvage path.
//!
//! The pickled index lives at `<cache_dir>/index-dir/the-real-index` and is
//! rewritten through a scratch file plus atomic rename. When it is missing,
//! corrupt or older than the cache directory, the entry set is reconstructed
//! by scanning the directory for entry files.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use futures::channel::oneshot;
use log::{debug, error, warn};
use walkdir::WalkDir;

use crate::cache_type::CacheType;
use crate::cleanup_tracker::CleanupTracker;
use crate::index::metadata::{EntryMetadata, ENTRY_METADATA_ON_DISK_BYTES};
use crate::index::pickle::{crc32, Pickle, PickleReader};
use crate::index::{EntrySet, IndexInitMethod, IndexWriteReason};
use crate::runner::{self, SequencedRunner};
use crate::tools;

pub const INDEX_MAGIC_NUMBER: u64 = 0x656e74657220796f;

/// Current serialization version. Versions 6 through 9 are readable:
/// 7 added the write-reason header field, 8 packed the in-memory data byte
/// with the size, 9 reinterprets the app-cache time slot as a prefetch hint.
pub const INDEX_VERSION: u32 = 9;
const INDEX_MIN_READABLE_VERSION: u32 = 6;

/// Cap on how large an index we are willing to parse, to avoid feeding a
/// corrupt multi-gigabyte file to the decoder. 8 bytes of hash key framing
/// per record on top of the metadata payload.
pub const MAX_ENTRIES_IN_INDEX: u64 = 1_000_000;
const MAX_INDEX_FILE_SIZE_BYTES: u64 =
    MAX_ENTRIES_IN_INDEX * (8 + ENTRY_METADATA_ON_DISK_BYTES as u64);

/// Stand-in size for salvaged entries whose file sizes sum past `u32::MAX`.
/// Such an entry stays in the index so it can still be opened and then
/// corrected by a size update, instead of becoming an orphan file.
pub const PLACEHOLDER_SIZE_WHEN_INVALID: u32 = 32_768;

pub const INDEX_DIRECTORY: &str = "index-dir";
pub const INDEX_FILE_NAME: &str = "the-real-index";
pub const TEMP_INDEX_FILE_NAME: &str = "temp-index";

/// Header of the serialized index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMetadata {
    magic: u64,
    version: u32,
    reason_raw: Option<u32>,
    entry_count: u64,
    cache_size: u64,
}

impl IndexMetadata {
    pub fn new(reason: IndexWriteReason, entry_count: u64, cache_size: u64) -> IndexMetadata {
        IndexMetadata {
            magic: INDEX_MAGIC_NUMBER,
            version: INDEX_VERSION,
            reason_raw: Some(reason.wire_value()),
            entry_count,
            cache_size,
        }
    }

    pub fn reason(&self) -> Option<IndexWriteReason> {
        self.reason_raw.and_then(IndexWriteReason::from_wire_value)
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn cache_size(&self) -> u64 {
        self.cache_size
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    fn has_entry_in_memory_data(&self) -> bool {
        self.version >= 8
    }

    fn app_cache_has_trailer_prefetch_size(&self) -> bool {
        self.version >= 9
    }

    pub fn serialize(&self, pickle: &mut Pickle) {
        pickle.write_u64(self.magic);
        pickle.write_u32(self.version);
        pickle.write_u64(self.entry_count);
        pickle.write_u64(self.cache_size);
        pickle.write_u32(self.reason_raw.unwrap_or(IndexWriteReason::WIRE_LIMIT));
    }

    pub fn deserialize(reader: &mut PickleReader<'_>) -> Option<IndexMetadata> {
        let magic = reader.read_u64()?;
        let version = reader.read_u32()?;
        let entry_count = reader.read_u64()?;
        let cache_size = reader.read_u64()?;
        // Version 6 predates the write-reason field.
        let reason_raw = if version >= 7 {
            Some(reader.read_u32()?)
        } else {
            None
        };
        Some(IndexMetadata {
            magic,
            version,
            reason_raw,
            entry_count,
            cache_size,
        })
    }

    pub fn check(&self) -> bool {
        if self.magic != INDEX_MAGIC_NUMBER || self.entry_count > MAX_ENTRIES_IN_INDEX {
            return false;
        }
        if self.version < INDEX_MIN_READABLE_VERSION || self.version > INDEX_VERSION {
            return false;
        }
        if self.version == 6 {
            return self.reason_raw.is_none();
        }
        match self.reason_raw {
            Some(raw) => raw < IndexWriteReason::WIRE_LIMIT,
            None => false,
        }
    }
}

/// What a load produced. On failure `did_load` is false and the entry set is
/// whatever partial-but-consistent data the fallback path produced.
#[derive(Debug)]
pub struct IndexLoadResult {
    pub did_load: bool,
    pub entries: EntrySet,
    pub write_reason: Option<IndexWriteReason>,
    pub init_method: IndexInitMethod,
    pub flush_required: bool,
}

impl Default for IndexLoadResult {
    fn default() -> Self {
        IndexLoadResult {
            did_load: false,
            entries: HashMap::new(),
            write_reason: None,
            init_method: IndexInitMethod::NewCache,
            flush_required: false,
        }
    }
}

impl IndexLoadResult {
    fn reset(&mut self) {
        self.did_load = false;
        self.write_reason = None;
        self.flush_required = false;
        self.entries.clear();
    }
}

/// Owner of the index file paths. Loading runs on the worker pool; writing
/// runs on the single-threaded cache runner so writes stay ordered and the
/// final one survives shutdown.
pub struct IndexFile {
    cache_runner: Arc<SequencedRunner>,
    cache_type: CacheType,
    cache_directory: PathBuf,
    index_file: PathBuf,
    temp_index_file: PathBuf,
}

impl IndexFile {
    pub fn new(
        cache_runner: Arc<SequencedRunner>,
        cache_type: CacheType,
        cache_directory: PathBuf,
    ) -> IndexFile {
        let index_dir = cache_directory.join(INDEX_DIRECTORY);
        IndexFile {
            cache_runner,
            cache_type,
            index_file: index_dir.join(INDEX_FILE_NAME),
            temp_index_file: index_dir.join(TEMP_INDEX_FILE_NAME),
            cache_directory,
        }
    }

    /// Load the entry set, rebuilding from the cache directory when needed.
    pub async fn load_index_entries(
        &self,
        cache_last_modified: Option<SystemTime>,
    ) -> IndexLoadResult {
        let cache_type = self.cache_type;
        let cache_directory = self.cache_directory.clone();
        let index_file = self.index_file.clone();
        runner::run_blocking(move || {
            Self::sync_load_index_entries(
                cache_type,
                cache_last_modified,
                &cache_directory,
                &index_file,
            )
        })
        .await
        .unwrap_or_default()
    }

    /// Serialize on the calling sequence, then hand the bytes to the cache
    /// runner which stats the directory, appends the trailer, computes the
    /// CRC and writes atomically. `keep_alive` pins the cleanup tracker
    /// until the write has completed; `reply` (if any) fires afterwards.
    pub fn write_to_disk(
        &self,
        metadata: IndexMetadata,
        entries: &EntrySet,
        keep_alive: Option<Arc<CleanupTracker>>,
        reply: Option<oneshot::Sender<()>>,
    ) {
        let pickle = Self::serialize(self.cache_type, &metadata, entries);
        let cache_directory = self.cache_directory.clone();
        let index_file = self.index_file.clone();
        let temp_index_file = self.temp_index_file.clone();
        self.cache_runner.dispatch(move || {
            Self::sync_write_to_disk(&cache_directory, &index_file, &temp_index_file, pickle);
            drop(keep_alive);
            if let Some(reply) = reply {
                let _ = reply.send(());
            }
        });
    }

    /// Build the pickle body: header first, then one hash-plus-metadata
    /// record per entry. The result is not complete until
    /// `serialize_final_data` has appended the trailer, which happens on the
    /// thread that also performs the write to avoid an extra hop.
    pub fn serialize(
        cache_type: CacheType,
        metadata: &IndexMetadata,
        entries: &EntrySet,
    ) -> Pickle {
        let mut pickle = Pickle::new();
        metadata.serialize(&mut pickle);
        for (hash, entry_metadata) in entries {
            pickle.write_u64(*hash);
            entry_metadata.serialize(cache_type, &mut pickle);
        }
        pickle
    }

    /// Append the observed cache directory mtime and store the CRC.
    pub fn serialize_final_data(cache_dir_mtime: SystemTime, pickle: &mut Pickle) {
        pickle.write_i64(tools::time_to_micros(cache_dir_mtime));
        pickle.store_crc();
    }

    /// Decode an index file image. Any structural failure yields
    /// `did_load == false` and an empty entry set; the caller deletes the
    /// file and salvages. The returned time is the cache directory mtime the
    /// writer observed, used for the freshness decision.
    pub fn deserialize(cache_type: CacheType, data: &[u8]) -> (Option<SystemTime>, IndexLoadResult) {
        let mut result = IndexLoadResult::default();

        let (stored_crc, mut reader) = match PickleReader::new(data) {
            Some(parts) => parts,
            None => {
                warn!("corrupt index file: truncated pickle");
                return (None, result);
            }
        };
        if stored_crc != crc32(reader.payload()) {
            warn!("corrupt index file: bad CRC");
            return (None, result);
        }

        let metadata = match IndexMetadata::deserialize(&mut reader) {
            Some(m) => m,
            None => {
                warn!("corrupt index file: short header");
                return (None, result);
            }
        };
        if !metadata.check() {
            warn!("corrupt index file: invalid header");
            return (None, result);
        }

        for _ in 0..metadata.entry_count() {
            let hash = match reader.read_u64() {
                Some(h) => h,
                None => {
                    result.reset();
                    return (None, result);
                }
            };
            let entry_metadata = match EntryMetadata::deserialize(
                cache_type,
                &mut reader,
                metadata.has_entry_in_memory_data(),
                metadata.app_cache_has_trailer_prefetch_size(),
            ) {
                Some(m) => m,
                None => {
                    warn!("corrupt index file: invalid entry record");
                    result.reset();
                    return (None, result);
                }
            };
            result.entries.entry(hash).or_insert(entry_metadata);
        }

        let cache_last_modified = match reader.read_i64() {
            Some(micros) => tools::micros_to_time(micros),
            None => {
                result.reset();
                return (None, result);
            }
        };

        result.write_reason = metadata.reason();
        result.did_load = true;
        (cache_last_modified, result)
    }

    fn sync_load_index_entries(
        cache_type: CacheType,
        cache_last_modified: Option<SystemTime>,
        cache_directory: &Path,
        index_file: &Path,
    ) -> IndexLoadResult {
        let index_file_existed = index_file.exists();

        let mut result = IndexLoadResult::default();
        let last_cache_seen_by_index =
            Self::sync_load_from_disk(cache_type, index_file, &mut result);

        if result.did_load {
            let fresh = match (cache_last_modified, last_cache_seen_by_index) {
                (Some(observed), Some(seen)) => observed <= seen,
                // Without a directory mtime the index cannot be proven
                // fresh, so rebuild.
                _ => false,
            };
            if fresh {
                result.init_method = IndexInitMethod::Loaded;
                return result;
            }
            debug!("index file is stale, rebuilding from directory scan");
        }

        Self::sync_restore_from_disk(cache_type, cache_directory, index_file, &mut result);
        result.init_method = if index_file_existed {
            IndexInitMethod::Recovered
        } else {
            IndexInitMethod::NewCache
        };
        result
    }

    fn sync_load_from_disk(
        cache_type: CacheType,
        index_file: &Path,
        result: &mut IndexLoadResult,
    ) -> Option<SystemTime> {
        result.reset();

        let file_length = match fs::metadata(index_file) {
            Ok(m) => m.len(),
            Err(_) => return None,
        };
        // Sanity-check the length before reading; a corrupt multi-gigabyte
        // file must not be pulled into memory.
        if file_length > MAX_INDEX_FILE_SIZE_BYTES {
            tools::delete_cache_file(index_file);
            return None;
        }

        let data = match fs::read(index_file) {
            Ok(data) => data,
            Err(_) => {
                tools::delete_cache_file(index_file);
                return None;
            }
        };

        let (last_seen, loaded) = Self::deserialize(cache_type, &data);
        *result = loaded;
        if !result.did_load {
            tools::delete_cache_file(index_file);
        }
        last_seen
    }

    /// Reconstruct the entry set from the entry files in the cache
    /// directory. Always requests a flush so a fresh pickle replaces the
    /// missing or corrupt one.
    fn sync_restore_from_disk(
        cache_type: CacheType,
        cache_directory: &Path,
        index_file: &Path,
        result: &mut IndexLoadResult,
    ) {
        debug!("restoring cache index from {:?}", cache_directory);
        tools::delete_cache_file(index_file);
        result.reset();

        for dir_entry in WalkDir::new(cache_directory)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let file_name = match dir_entry.file_name().to_str() {
                Some(name) => name,
                None => continue,
            };
            let (hash, _file_index) = match tools::parse_entry_file_name(file_name) {
                Some(parsed) => parsed,
                None => continue,
            };
            let st = match nix::sys::stat::stat(dir_entry.path()) {
                Ok(st) => st,
                Err(e) => {
                    warn!("failed to stat {:?} during salvage: {}", dir_entry.path(), e);
                    continue;
                }
            };
            Self::process_entry_file(cache_type, result, hash, &st);
        }

        result.did_load = true;
        result.flush_required = true;
    }

    fn process_entry_file(
        cache_type: CacheType,
        result: &mut IndexLoadResult,
        hash: u64,
        st: &nix::sys::stat::FileStat,
    ) {
        // An access time is available and no worse than mtime where the
        // filesystem provides it.
        let last_used_time = if st.st_atime > 0 {
            Some(tools::filetime_to_system_time(st.st_atime, st.st_atime_nsec))
        } else if st.st_mtime > 0 {
            Some(tools::filetime_to_system_time(st.st_mtime, st.st_mtime_nsec))
        } else {
            None
        };

        let file_size = if st.st_size > 0 { st.st_size as u64 } else { 0 };

        match result.entries.get_mut(&hash) {
            None => {
                let (size, overflowed) = clamp_entry_size(file_size);
                if overflowed {
                    warn!(
                        "invalid file size {} while restoring index for hash {:016x}",
                        file_size, hash
                    );
                }
                let metadata = if cache_type.is_app_cache() {
                    EntryMetadata::new_for_app_cache(-1, size)
                } else {
                    EntryMetadata::new(last_used_time, size)
                };
                result.entries.insert(hash, metadata);
            }
            Some(existing) => {
                // One hash owns several stream files; their sizes add up.
                let total = u64::from(existing.entry_size()) + file_size;
                let (size, overflowed) = clamp_entry_size(total);
                if overflowed {
                    warn!(
                        "summed file size {} overflows while restoring hash {:016x}",
                        total, hash
                    );
                }
                existing.set_entry_size(size);
            }
        }
    }

    fn sync_write_to_disk(
        cache_directory: &Path,
        index_file: &Path,
        temp_index_file: &Path,
        mut pickle: Pickle,
    ) {
        let index_file_directory = match temp_index_file.parent() {
            Some(dir) => dir,
            None => return,
        };
        if !index_file_directory.is_dir() {
            if let Err(e) = fs::create_dir_all(index_file_directory) {
                error!("could not create the index file directory: {}", e);
                return;
            }
        }

        // The trailer records the directory mtime the writer observed; if
        // the stat fails the write is abandoned so the invariant
        // `trailer time <= real mtime` keeps holding for the old file.
        let cache_dir_mtime = match tools::get_mtime(cache_directory) {
            Ok(mtime) => mtime,
            Err(e) => {
                error!("could not obtain cache directory mtime: {}", e);
                return;
            }
        };
        Self::serialize_final_data(cache_dir_mtime, &mut pickle);

        if !write_pickle_file(&pickle, temp_index_file) {
            error!("failed to write the temporary index file");
            return;
        }

        // Renaming can legitimately fail while the cache is being torn down
        // and its directory erased underneath us.
        if let Err(e) = fs::rename(temp_index_file, index_file) {
            debug!("index rename failed (likely teardown): {}", e);
        }
    }
}

fn clamp_entry_size(size: u64) -> (u32, bool) {
    if size > u64::from(u32::MAX) {
        (PLACEHOLDER_SIZE_WHEN_INVALID, true)
    } else {
        (size as u32, false)
    }
}

fn write_pickle_file(pickle: &Pickle, path: &Path) -> bool {
    let mut file = match fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
    {
        Ok(file) => file,
        Err(_) => return false,
    };
    if file.write_all(pickle.as_bytes()).is_err() {
        tools::delete_cache_file(path);
        return false;
    }
    true
}
