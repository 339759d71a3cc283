//! Asynchronous VHD virtual-disk backend.
//!
//! Exposes a fixed-size logical block device stored in a sparse,
//! copy-on-write VHD container (fixed, dynamic, or differencing). Sector
//! requests are queued against a driver handle and completed via an
//! io_uring submit/poll loop; the write path runs a transactional state
//! machine that keeps the block allocation table and per-block bitmaps
//! crash-consistent with the data they describe.

pub mod buf;
pub mod config;
pub mod driver;
pub mod error;
pub mod format;

pub use buf::AlignedBuf;
pub use config::{DriverConfig, OpenFlags};
pub use driver::{Completion, IoStatus, Rejected, VhdDriver};
pub use error::{Result, VhdError};
pub use format::VhdType;

/// Fixed sector size of the virtual device and the container format.
pub const SECTOR_SIZE: usize = 512;
pub const SECTOR_SHIFT: u32 = 9;
