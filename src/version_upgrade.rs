//! Cache directory version detection and stepwise upgrade.
//!
//! The file `<cache_dir>/index` only carries the magic and version of the
//! format; by convention that is enough to decide whether the directory
//! belongs to this backend at all. The real index is a separate pickled file
//! and not suited to carrying the magic up front.
//!
//! Upgrades run once before a backend opens a cache, must finish before any
//! operation is processed, and must be idempotent: the process can be killed
//! mid-upgrade, and a re-run has to leave the directory consistent. Any new
//! upgrade step therefore has to flush the fake index between steps.

use std::convert::TryInto;
use std::fs;
use std::io;
use std::path::Path;

use log::{error, warn};

use crate::error::{CacheError, CacheResult};
use crate::tools;

pub const FAKE_INDEX_FILE_NAME: &str = "index";
const UPGRADE_INDEX_FILE_NAME: &str = "upgrade-index";
/// Schema 5 kept the real index directly in the cache directory; newer
/// versions moved it under `index-dir/`.
const LEGACY_INDEX_FILE_NAME: &str = "the-real-index";

pub const INITIAL_MAGIC_NUMBER: u64 = 0xfcfb6d1ba7725c30;

/// Any on-disk format change, compatible or not, bumps this.
pub const CACHE_VERSION: u32 = 9;

/// Directories below this version are dropped rather than upgraded.
const MIN_VERSION_ABLE_TO_UPGRADE: u32 = 5;

const FAKE_INDEX_SIZE: usize = 20;

/// The fixed-size record in the fake index file: magic, version and two
/// reserved fields that must read zero. Trailing bytes are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FakeIndexData {
    pub magic: u64,
    pub version: u32,
    pub zero: u32,
    pub zero2: u32,
}

impl FakeIndexData {
    pub fn current() -> FakeIndexData {
        FakeIndexData {
            magic: INITIAL_MAGIC_NUMBER,
            version: CACHE_VERSION,
            zero: 0,
            zero2: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; FAKE_INDEX_SIZE] {
        let mut out = [0u8; FAKE_INDEX_SIZE];
        out[0..8].copy_from_slice(&self.magic.to_le_bytes());
        out[8..12].copy_from_slice(&self.version.to_le_bytes());
        out[12..16].copy_from_slice(&self.zero.to_le_bytes());
        out[16..20].copy_from_slice(&self.zero2.to_le_bytes());
        out
    }

    pub fn from_bytes(data: &[u8]) -> Option<FakeIndexData> {
        if data.len() < FAKE_INDEX_SIZE {
            return None;
        }
        Some(FakeIndexData {
            magic: u64::from_le_bytes(data[0..8].try_into().unwrap()),
            version: u32::from_le_bytes(data[8..12].try_into().unwrap()),
            zero: u32::from_le_bytes(data[12..16].try_into().unwrap()),
            zero2: u32::from_le_bytes(data[16..20].try_into().unwrap()),
        })
    }
}

fn write_fake_index_file(path: &Path) -> io::Result<()> {
    fs::write(path, FakeIndexData::current().to_bytes())
}

/// Check the version of the cache at `path` and upgrade the structures on
/// disk when necessary. On error the caller is expected to drop the whole
/// directory and recreate the cache.
pub fn upgrade_cache_on_disk(path: &Path) -> CacheResult<()> {
    let fake_index = path.join(FAKE_INDEX_FILE_NAME);

    let data = match fs::read(&fake_index) {
        Ok(data) => data,
        Err(ref e) if e.kind() == io::ErrorKind::NotFound => {
            // A brand new cache: occupy the directory with the current
            // sentinel.
            if let Err(e) = write_fake_index_file(&fake_index) {
                tools::delete_cache_file(&fake_index);
                error!("failed to write a new fake index: {}", e);
                return Err(CacheError::path(&fake_index, &e));
            }
            return Ok(());
        }
        Err(e) => return Err(CacheError::path(&fake_index, &e)),
    };

    let header = match FakeIndexData::from_bytes(&data) {
        Some(header) => header,
        None => {
            error!("cache fake index file has the wrong size");
            return Err(CacheError::BadMagic);
        }
    };
    if header.magic != INITIAL_MAGIC_NUMBER {
        error!("cache fake index file has the wrong magic number");
        return Err(CacheError::BadMagic);
    }

    let mut version = header.version;
    if version < MIN_VERSION_ABLE_TO_UPGRADE {
        error!("cache version {} is too old", version);
        return Err(CacheError::VersionTooOld);
    }
    if version > CACHE_VERSION {
        error!("cache version {} is from the future", version);
        return Err(CacheError::VersionFromTheFuture);
    }
    if header.zero != 0 || header.zero2 != 0 {
        warn!("rebuilding cache due to experiment change");
        return Err(CacheError::ExperimentChange);
    }

    let new_fake_index_needed = version != CACHE_VERSION;

    // One routine per incremental upgrade, starting at the minimum
    // upgradable version.
    if version == 5 {
        // v5 -> v6 moved the real index under index-dir/. The old one is
        // simply deleted; the new directory is created lazily by the first
        // index writer.
        let legacy_index = path.join(LEGACY_INDEX_FILE_NAME);
        if !tools::delete_cache_file(&legacy_index) {
            error!("failed to upgrade cache from version {}", header.version);
            return Err(CacheError::Path {
                path: legacy_index,
                message: "could not delete the legacy index".into(),
            });
        }
        version += 1;
    }
    if version == 6 {
        // The entry format did not change and the index reader handles v6.
        version += 1;
    }
    if version == 7 {
        // Likewise handled entirely by the index reader.
        version += 1;
    }
    if version == 8 {
        // Likewise handled by the index reader; only app caches reinterpret
        // the time field, and their stale values are dropped on load.
        version += 1;
    }
    debug_assert_eq!(version, CACHE_VERSION);

    if !new_fake_index_needed {
        return Ok(());
    }

    let temp_fake_index = path.join(UPGRADE_INDEX_FILE_NAME);
    if let Err(e) = write_fake_index_file(&temp_fake_index) {
        tools::delete_cache_file(&temp_fake_index);
        error!("failed to write the upgraded fake index: {}", e);
        return Err(CacheError::path(&temp_fake_index, &e));
    }
    if let Err(e) = fs::rename(&temp_fake_index, &fake_index) {
        error!("failed to replace the fake index: {}", e);
        return Err(CacheError::path(&fake_index, &e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_header(dir: &Path, version: u32, zero: u32, zero2: u32) {
        let data = FakeIndexData {
            magic: INITIAL_MAGIC_NUMBER,
            version,
            zero,
            zero2,
        };
        fs::write(dir.join(FAKE_INDEX_FILE_NAME), data.to_bytes()).unwrap();
    }

    fn read_header(dir: &Path) -> FakeIndexData {
        let data = fs::read(dir.join(FAKE_INDEX_FILE_NAME)).unwrap();
        FakeIndexData::from_bytes(&data).unwrap()
    }

    #[test]
    fn fresh_directory_gets_a_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        upgrade_cache_on_disk(dir.path()).unwrap();
        assert_eq!(read_header(dir.path()), FakeIndexData::current());
    }

    #[test]
    fn current_version_is_untouched() {
        let dir = tempfile::tempdir().unwrap();
        write_header(dir.path(), CACHE_VERSION, 0, 0);
        let before = fs::metadata(dir.path().join(FAKE_INDEX_FILE_NAME))
            .unwrap()
            .modified()
            .unwrap();
        upgrade_cache_on_disk(dir.path()).unwrap();
        let after = fs::metadata(dir.path().join(FAKE_INDEX_FILE_NAME))
            .unwrap()
            .modified()
            .unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = FakeIndexData::current();
        data.magic = 0x1234_5678_9abc_def0;
        fs::write(dir.path().join(FAKE_INDEX_FILE_NAME), data.to_bytes()).unwrap();
        assert!(matches!(
            upgrade_cache_on_disk(dir.path()),
            Err(CacheError::BadMagic)
        ));
    }

    #[test]
    fn short_header_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(FAKE_INDEX_FILE_NAME), b"short").unwrap();
        assert!(matches!(
            upgrade_cache_on_disk(dir.path()),
            Err(CacheError::BadMagic)
        ));
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut bytes = FakeIndexData::current().to_bytes().to_vec();
        bytes.extend_from_slice(&[0xff; 16]);
        fs::write(dir.path().join(FAKE_INDEX_FILE_NAME), bytes).unwrap();
        upgrade_cache_on_disk(dir.path()).unwrap();
    }

    #[test]
    fn ancient_versions_drop_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        write_header(dir.path(), 4, 0, 0);
        assert!(matches!(
            upgrade_cache_on_disk(dir.path()),
            Err(CacheError::VersionTooOld)
        ));
    }

    #[test]
    fn future_versions_refuse_to_open() {
        let dir = tempfile::tempdir().unwrap();
        write_header(dir.path(), CACHE_VERSION + 1, 0, 0);
        assert!(matches!(
            upgrade_cache_on_disk(dir.path()),
            Err(CacheError::VersionFromTheFuture)
        ));
    }

    #[test]
    fn experiment_fields_force_a_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        write_header(dir.path(), CACHE_VERSION, 1, 0);
        assert!(matches!(
            upgrade_cache_on_disk(dir.path()),
            Err(CacheError::ExperimentChange)
        ));
        write_header(dir.path(), CACHE_VERSION, 0, 7);
        assert!(matches!(
            upgrade_cache_on_disk(dir.path()),
            Err(CacheError::ExperimentChange)
        ));
    }

    #[test]
    fn v5_upgrade_deletes_the_legacy_index() {
        let dir = tempfile::tempdir().unwrap();
        write_header(dir.path(), 5, 0, 0);
        fs::write(dir.path().join(LEGACY_INDEX_FILE_NAME), b"old index bytes").unwrap();

        upgrade_cache_on_disk(dir.path()).unwrap();

        assert!(!dir.path().join(LEGACY_INDEX_FILE_NAME).exists());
        assert_eq!(read_header(dir.path()).version, CACHE_VERSION);
        // No stray scratch file remains.
        assert!(!dir.path().join(UPGRADE_INDEX_FILE_NAME).exists());
    }

    #[test]
    fn upgrade_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        write_header(dir.path(), 5, 0, 0);
        upgrade_cache_on_disk(dir.path()).unwrap();
        upgrade_cache_on_disk(dir.path()).unwrap();
        assert_eq!(read_header(dir.path()), FakeIndexData::current());
    }

    #[test]
    fn v8_upgrade_only_rewrites_the_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        write_header(dir.path(), 8, 0, 0);
        upgrade_cache_on_disk(dir.path()).unwrap();
        assert_eq!(read_header(dir.path()).version, CACHE_VERSION);
    }
}
