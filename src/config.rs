use serde::{Deserialize, Serialize};

/// Driver tunables. The defaults match the sizing the write path was
/// designed around; they are overridable mainly so tests can shrink the
/// bitmap cache and request pool to force eviction and back-pressure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Data request descriptors in the pool. Metadata I/O uses embedded
    /// descriptors and never draws from this pool.
    pub data_requests: usize,
    /// Bitmap cache capacity, in per-block entries.
    pub cache_entries: usize,
    /// io_uring submission queue depth.
    pub ring_depth: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            data_requests: 256,
            cache_entries: 32,
            ring_depth: 512,
        }
    }
}

/// Flags accepted by [`crate::VhdDriver::open`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct OpenFlags {
    pub read_only: bool,
}

impl OpenFlags {
    pub const RDONLY: OpenFlags = OpenFlags { read_only: true };
    pub const RDWR: OpenFlags = OpenFlags { read_only: false };
}
