//! Per-entry metadata record kept by the in-memory index.

use std::time::SystemTime;

use bitflags::bitflags;

use crate::cache_type::CacheType;
use crate::index::pickle::{Pickle, PickleReader};
use crate::tools;

/// Serialized record size: an `i64` time-or-prefetch field plus a `u64`
/// packing the rounded size with the in-memory data byte. The hash key adds
/// another 8 bytes of framing, written by the index file codec.
pub const ENTRY_METADATA_ON_DISK_BYTES: usize = 16;

bitflags! {
    /// The two conventionally defined bits of the caller-opaque in-memory
    /// data byte. The remaining six bits carry whatever the caller stores.
    pub struct MemoryDataHints: u8 {
        /// Caching headers say the entry cannot be served or revalidated.
        const UNUSABLE_PER_CACHING_HEADERS = 1 << 0;
        /// Eviction should prefer keeping this entry.
        const HIGH_PRIORITY = 1 << 1;
    }
}

/// Packed metadata for one cache entry; there can be tens of thousands of
/// these in memory, so the whole record is 8 bytes.
///
/// The first word is the last used time in seconds since the epoch, except
/// in app-cache mode where it carries a trailer prefetch hint in bytes. The
/// second word packs the entry size in 256-byte chunks (24 bits, rounded up
/// on set) with the in-memory data byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryMetadata {
    time_or_prefetch: u32,
    packed: u32,
}

impl EntryMetadata {
    pub fn new(last_used_time: Option<SystemTime>, entry_size: u32) -> EntryMetadata {
        let mut metadata = EntryMetadata::default();
        metadata.set_entry_size(entry_size);
        metadata.set_last_used_time(last_used_time);
        metadata
    }

    pub fn new_for_app_cache(trailer_prefetch_size: i32, entry_size: u32) -> EntryMetadata {
        let mut metadata = EntryMetadata::default();
        metadata.set_entry_size(entry_size);
        metadata.set_trailer_prefetch_size(trailer_prefetch_size);
        metadata
    }

    pub fn last_used_time(&self) -> Option<SystemTime> {
        tools::index_seconds_to_time(self.time_or_prefetch)
    }

    pub fn set_last_used_time(&mut self, last_used_time: Option<SystemTime>) {
        self.time_or_prefetch = tools::time_to_index_seconds(last_used_time);
    }

    /// Raw seconds value for eviction sorting; 0 for entries with no
    /// recorded use.
    pub fn raw_time_for_sorting(&self) -> u32 {
        self.time_or_prefetch
    }

    pub fn trailer_prefetch_size(&self) -> i32 {
        self.time_or_prefetch as i32
    }

    /// Hints of zero or less are meaningless and ignored.
    pub fn set_trailer_prefetch_size(&mut self, size: i32) {
        if size <= 0 {
            return;
        }
        self.time_or_prefetch = size as u32;
    }

    /// Total on-disk size, rounded up to 256-byte chunks. Rounding happens
    /// on set so repeated set/get cycles are stable.
    pub fn entry_size(&self) -> u32 {
        self.packed & 0xffff_ff00
    }

    pub fn set_entry_size(&mut self, entry_size: u32) {
        // Round up to the next 256-byte chunk; the chunk count keeps its
        // position in the packed word, so no shift back down is needed.
        let chunks = (u64::from(entry_size) + 255) >> 8;
        self.packed = ((chunks << 8) as u32 & 0xffff_ff00) | (self.packed & 0xff);
    }

    pub fn in_memory_data(&self) -> u8 {
        (self.packed & 0xff) as u8
    }

    pub fn set_in_memory_data(&mut self, value: u8) {
        self.packed = (self.packed & 0xffff_ff00) | u32::from(value);
    }

    pub fn serialize(&self, cache_type: CacheType, pickle: &mut Pickle) {
        if cache_type.is_app_cache() {
            pickle.write_i64(i64::from(self.trailer_prefetch_size()));
        } else {
            pickle.write_i64(i64::from(self.time_or_prefetch));
        }
        pickle.write_u64(u64::from(self.packed));
    }

    /// Read one record. `has_in_memory_data` is true for version 8+ payloads
    /// (the size word also packs the hint byte); `app_cache_has_prefetch` is
    /// true for version 9+ payloads, where the time slot of an app cache is a
    /// prefetch hint. Older app-cache payloads stored a timestamp there,
    /// which is not a valid prefetch size, so it is dropped.
    pub fn deserialize(
        cache_type: CacheType,
        reader: &mut PickleReader<'_>,
        has_in_memory_data: bool,
        app_cache_has_prefetch: bool,
    ) -> Option<EntryMetadata> {
        let time_or_prefetch = reader.read_i64()?;
        let packed = reader.read_u64()?;
        if packed > u64::from(u32::MAX) {
            return None;
        }

        let mut metadata = EntryMetadata::default();
        if cache_type.is_app_cache() {
            if app_cache_has_prefetch {
                if time_or_prefetch >= i64::from(i32::MIN)
                    && time_or_prefetch <= i64::from(i32::MAX)
                {
                    metadata.set_trailer_prefetch_size(time_or_prefetch as i32);
                }
            }
        } else {
            let seconds = if time_or_prefetch <= 0 {
                0
            } else {
                time_or_prefetch.min(i64::from(u32::MAX)) as u32
            };
            metadata.time_or_prefetch = seconds;
        }

        if has_in_memory_data {
            metadata.set_entry_size(packed as u32 & 0xffff_ff00);
            metadata.set_in_memory_data((packed & 0xff) as u8);
        } else {
            metadata.set_entry_size(packed as u32);
            metadata.set_in_memory_data(0);
        }
        Some(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn size_rounds_up_on_set() {
        let mut m = EntryMetadata::default();
        m.set_entry_size(0);
        assert_eq!(m.entry_size(), 0);
        m.set_entry_size(1);
        assert_eq!(m.entry_size(), 256);
        m.set_entry_size(256);
        assert_eq!(m.entry_size(), 256);
        m.set_entry_size(257);
        assert_eq!(m.entry_size(), 512);
        m.set_entry_size(40_000);
        assert_eq!(m.entry_size(), 40_192);
    }

    #[test]
    fn size_rounding_is_idempotent() {
        let mut m = EntryMetadata::default();
        m.set_entry_size(475);
        let rounded = m.entry_size();
        m.set_entry_size(rounded);
        assert_eq!(m.entry_size(), rounded);
    }

    #[test]
    fn size_does_not_disturb_memory_data() {
        let mut m = EntryMetadata::default();
        m.set_in_memory_data(0xa5);
        m.set_entry_size(123_456);
        assert_eq!(m.in_memory_data(), 0xa5);
        m.set_in_memory_data(0);
        assert_eq!(m.entry_size(), 123_648);
    }

    #[test]
    fn null_time_survives_a_round_trip() {
        let mut m = EntryMetadata::default();
        m.set_last_used_time(None);
        assert_eq!(m.last_used_time(), None);
        // The epoch itself must not collapse into the null encoding.
        m.set_last_used_time(Some(UNIX_EPOCH));
        assert!(m.last_used_time().is_some());
    }

    #[test]
    fn prefetch_ignores_non_positive_sizes() {
        let mut m = EntryMetadata::new_for_app_cache(-1, 0);
        assert_eq!(m.trailer_prefetch_size(), 0);
        m.set_trailer_prefetch_size(0);
        assert_eq!(m.trailer_prefetch_size(), 0);
        m.set_trailer_prefetch_size(4096);
        assert_eq!(m.trailer_prefetch_size(), 4096);
        m.set_trailer_prefetch_size(-5);
        assert_eq!(m.trailer_prefetch_size(), 4096);
    }

    #[test]
    fn serialize_round_trip_disk_cache() {
        let t = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let mut m = EntryMetadata::new(Some(t), 10_000);
        m.set_in_memory_data(MemoryDataHints::HIGH_PRIORITY.bits());

        let mut pickle = Pickle::new();
        m.serialize(CacheType::Disk, &mut pickle);
        pickle.store_crc();

        let (_, mut reader) = PickleReader::new(pickle.as_bytes()).unwrap();
        let back = EntryMetadata::deserialize(CacheType::Disk, &mut reader, true, true).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn deserialize_v7_payload_has_no_memory_data() {
        // A v7-era payload stores the raw size without the packed hint byte.
        let mut pickle = Pickle::new();
        pickle.write_i64(1_600_000_000);
        pickle.write_u64(300);
        pickle.store_crc();

        let (_, mut reader) = PickleReader::new(pickle.as_bytes()).unwrap();
        let m = EntryMetadata::deserialize(CacheType::Disk, &mut reader, false, false).unwrap();
        assert_eq!(m.entry_size(), 512);
        assert_eq!(m.in_memory_data(), 0);
    }

    #[test]
    fn app_cache_prefetch_dropped_for_old_payloads() {
        let mut pickle = Pickle::new();
        // An old app-cache payload holds a timestamp in the prefetch slot.
        pickle.write_i64(1_600_000_000);
        pickle.write_u64(512); // 512 bytes packed, hint byte clear
        pickle.store_crc();

        let (_, mut reader) = PickleReader::new(pickle.as_bytes()).unwrap();
        let m = EntryMetadata::deserialize(CacheType::App, &mut reader, true, false).unwrap();
        assert_eq!(m.trailer_prefetch_size(), 0);
    }
}
