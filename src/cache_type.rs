/// The kinds of content a cache instance stores. The type selects the
/// eviction heuristics and whether per-entry access times are tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheType {
    /// General HTTP response cache. LRU with size weighting.
    Disk,
    /// Application cache. Eviction is driven externally, so access times are
    /// not tracked; the time slot of each entry carries a trailer prefetch
    /// hint instead.
    App,
    /// GL shader cache. Behaves like `Disk`.
    Shader,
    /// Portable executable translation cache. Behaves like `Disk`.
    Pnacl,
    /// Compiled script byte code. Plain LRU, no size weighting.
    GeneratedByteCode,
    /// Byte code for built-in UI pages. Plain LRU, no size weighting.
    GeneratedWebUiByteCode,
}

impl CacheType {
    /// App caches store a prefetch hint where other caches store the last
    /// used time.
    pub fn is_app_cache(self) -> bool {
        self == CacheType::App
    }

    /// Size-insensitive eviction is an opt-out reserved for the byte code
    /// caches, where recompilation cost does not scale with entry size.
    pub fn uses_size_heuristic(self) -> bool {
        !matches!(
            self,
            CacheType::GeneratedByteCode | CacheType::GeneratedWebUiByteCode
        )
    }
}

impl Default for CacheType {
    fn default() -> Self {
        CacheType::Disk
    }
}
