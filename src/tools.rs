//! Small helpers shared by the index and the backend: key hashing, the
//! entry file naming scheme and filesystem plumbing.

use std::fs;
use std::hash::Hasher;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use once_cell::sync::OnceCell;
use siphasher::sip::SipHasher24;

/// Hex hash prefix plus `_` plus one stream file digit.
pub const ENTRY_FILE_NAME_LENGTH: usize = 18;

/// Number of files an entry may occupy on disk (suffixes `_0` to `_2`).
pub const ENTRY_FILE_COUNT: u32 = 3;

static HASH_OVERRIDE: OnceCell<fn(&[u8]) -> Option<u64>> = OnceCell::new();

/// Derive the 64-bit hash of an entry key. The value is stable across runs
/// and versions; it keys the in-memory index and prefixes entry file names,
/// so the low-order bits must stay well distributed.
pub fn entry_hash_key(key: &[u8]) -> u64 {
    if let Some(f) = HASH_OVERRIDE.get() {
        if let Some(hash) = f(key) {
            return hash;
        }
    }
    let mut hasher = SipHasher24::new_with_keys(0, 0);
    hasher.write(key);
    hasher.finish()
}

/// Install a key-hash override so tests can construct colliding keys, which
/// are otherwise unfeasible to find. The override returns `None` for keys it
/// does not care about. Set-once per process.
#[doc(hidden)]
pub fn set_entry_hash_override_for_testing(f: fn(&[u8]) -> Option<u64>) {
    let _ = HASH_OVERRIDE.set(f);
}

/// Name of the stream file `file_index` of the entry with the given hash.
pub fn entry_file_name(hash: u64, file_index: u32) -> String {
    debug_assert!(file_index < ENTRY_FILE_COUNT);
    format!("{:016x}_{}", hash, file_index)
}

/// Parse an entry file name back into `(hash, file_index)`. Anything that
/// does not match the 18-character shape exactly is rejected; directory
/// scans skip such files.
pub fn parse_entry_file_name(name: &str) -> Option<(u64, u32)> {
    if name.len() != ENTRY_FILE_NAME_LENGTH || !name.is_ascii() {
        return None;
    }
    let (hex, suffix) = name.split_at(16);
    let mut suffix_chars = suffix.chars();
    if suffix_chars.next() != Some('_') {
        return None;
    }
    let file_index = suffix_chars.next()?.to_digit(10)?;
    if file_index >= ENTRY_FILE_COUNT {
        return None;
    }
    if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let hash = u64::from_str_radix(hex, 16).ok()?;
    Some((hash, file_index))
}

/// Last modification time of `path` with nanosecond precision.
pub fn get_mtime(path: &Path) -> io::Result<SystemTime> {
    let st = nix::sys::stat::stat(path)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    Ok(filetime_to_system_time(st.st_mtime, st.st_mtime_nsec))
}

pub(crate) fn filetime_to_system_time(secs: i64, nsecs: i64) -> SystemTime {
    if secs <= 0 {
        return UNIX_EPOCH;
    }
    UNIX_EPOCH + Duration::new(secs as u64, nsecs.max(0) as u32)
}

/// Best-effort removal of a cache file. Absence counts as success.
pub fn delete_cache_file(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(ref e) if e.kind() == io::ErrorKind::NotFound => true,
        Err(e) => {
            log::warn!("failed to delete cache file {:?}: {}", path, e);
            false
        }
    }
}

/// Seconds since the epoch, for index timestamps. Zero means "unset"; a real
/// time that would round to zero is stored as 1 to avoid accidental nullity.
pub(crate) fn time_to_index_seconds(time: Option<SystemTime>) -> u32 {
    let time = match time {
        Some(t) => t,
        None => return 0,
    };
    let secs = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let secs = secs.min(u64::from(u32::MAX)) as u32;
    if secs == 0 {
        1
    } else {
        secs
    }
}

pub(crate) fn index_seconds_to_time(secs: u32) -> Option<SystemTime> {
    if secs == 0 {
        None
    } else {
        Some(UNIX_EPOCH + Duration::from_secs(u64::from(secs)))
    }
}

pub(crate) fn now_seconds() -> u32 {
    time_to_index_seconds(Some(SystemTime::now()))
}

/// Signed epoch seconds for time-range comparisons; pre-epoch times go
/// negative.
pub(crate) fn epoch_seconds_i64(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs().min(i64::MAX as u64) as i64,
        Err(e) => -(e.duration().as_secs().min(i64::MAX as u64) as i64),
    }
}

/// Microseconds since the epoch, the unit of the index trailer mtime.
pub(crate) fn time_to_micros(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_micros().min(i64::MAX as u128) as i64,
        Err(e) => -(e.duration().as_micros().min(i64::MAX as u128) as i64),
    }
}

pub(crate) fn micros_to_time(micros: i64) -> Option<SystemTime> {
    if micros <= 0 {
        return None;
    }
    Some(UNIX_EPOCH + Duration::from_micros(micros as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let a = entry_hash_key(b"http://www.example.com/");
        let b = entry_hash_key(b"http://www.example.com/");
        assert_eq!(a, b);
        assert_ne!(a, entry_hash_key(b"http://www.example.org/"));
    }

    #[test]
    fn file_name_round_trip() {
        let name = entry_file_name(0xdead_beef_0000_0001, 2);
        assert_eq!(name.len(), ENTRY_FILE_NAME_LENGTH);
        assert_eq!(
            parse_entry_file_name(&name),
            Some((0xdead_beef_0000_0001, 2))
        );
    }

    #[test]
    fn file_name_rejects_malformed_names() {
        assert_eq!(parse_entry_file_name(""), None);
        assert_eq!(parse_entry_file_name("0123456789abcdef_3"), None);
        assert_eq!(parse_entry_file_name("0123456789abcdef-0"), None);
        assert_eq!(parse_entry_file_name("0123456789abcdeg_0"), None);
        assert_eq!(parse_entry_file_name("0123456789abcdef_01"), None);
        assert_eq!(parse_entry_file_name("the-real-index"), None);
        assert_eq!(parse_entry_file_name("+123456789abcdef_0"), None);
    }

    #[test]
    fn index_seconds_preserve_nullity() {
        assert_eq!(time_to_index_seconds(None), 0);
        assert_eq!(index_seconds_to_time(0), None);
        // A real timestamp that rounds to zero becomes 1, not null.
        assert_eq!(time_to_index_seconds(Some(UNIX_EPOCH)), 1);
        let t = UNIX_EPOCH + Duration::from_secs(1_600_000_000);
        assert_eq!(time_to_index_seconds(Some(t)), 1_600_000_000);
        assert_eq!(index_seconds_to_time(1_600_000_000), Some(t));
    }
}
