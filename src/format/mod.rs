//! VHD on-disk format: footer and dynamic-header codecs, parent locators,
//! image creation. Everything on disk is big-endian.

mod create;
mod footer;
mod header;

pub use create::{
    create, read_footer, read_header, read_parent_path, snapshot, validate_parent, CreateOpts,
};
pub use footer::{Footer, Geometry};
pub use header::{decode_locator, encode_locator, DynamicHeader, ParentLocator, HEADER_SIZE};

use crate::error::{Result, VhdError};
use crate::SECTOR_SIZE;

pub const FOOTER_COOKIE: &[u8; 8] = b"conectix";
pub const HEADER_COOKIE: &[u8; 8] = b"cxsparse";

pub const FILE_FORMAT_VERSION: u32 = 0x0001_0000;
pub const HEADER_VERSION: u32 = 0x0001_0000;

/// BAT sentinel for a block with no backing storage in this image.
pub const DD_BLK_UNUSED: u32 = 0xffff_ffff;

/// Default allocation unit: 2 MiB, 4096 sectors.
pub const DEFAULT_BLOCK_SIZE: u32 = 2 * 1024 * 1024;

/// Offset of the dynamic header in images this crate creates.
pub const DEFAULT_HEADER_OFFSET: u64 = SECTOR_SIZE as u64;
/// Offset of the BAT in images this crate creates (footer copy + header).
pub const DEFAULT_TABLE_OFFSET: u64 = 3 * SECTOR_SIZE as u64;

/// VHD timestamps count seconds from 2000-01-01 00:00:00 UTC.
pub const VHD_EPOCH_OFFSET: u64 = 946_684_800;

/// Parent locator platform codes honored by the open path.
pub const PLAT_CODE_NONE: u32 = 0;
pub const PLAT_CODE_MACX: u32 = u32::from_be_bytes(*b"MacX");
pub const PLAT_CODE_W2KU: u32 = u32::from_be_bytes(*b"W2ku");

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum VhdType {
    Fixed,
    Dynamic,
    Diff,
}

impl VhdType {
    pub fn from_wire(v: u32) -> Result<Self> {
        match v {
            2 => Ok(VhdType::Fixed),
            3 => Ok(VhdType::Dynamic),
            4 => Ok(VhdType::Diff),
            _ => Err(VhdError::Unsupported("vhd disk type")),
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            VhdType::Fixed => 2,
            VhdType::Dynamic => 3,
            VhdType::Diff => 4,
        }
    }

    pub fn is_sparse(self) -> bool {
        !matches!(self, VhdType::Fixed)
    }
}

/// Ones-complement of the byte sum with the checksum field itself
/// zeroed. Shared by the footer and the dynamic header.
pub fn checksum(raw: &[u8], checksum_field: std::ops::Range<usize>) -> u32 {
    let mut sum: u32 = 0;
    for (i, b) in raw.iter().enumerate() {
        if checksum_field.contains(&i) {
            continue;
        }
        sum = sum.wrapping_add(*b as u32);
    }
    !sum
}

/// Current time in VHD epoch seconds.
pub fn vhd_now() -> u32 {
    vhd_time(std::time::SystemTime::now())
}

pub fn vhd_time(t: std::time::SystemTime) -> u32 {
    let unix = t
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    unix.saturating_sub(VHD_EPOCH_OFFSET) as u32
}

pub(crate) fn round_up(v: u64, to: u64) -> u64 {
    v.div_ceil(to) * to
}

pub(crate) fn be_u16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

pub(crate) fn be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

pub(crate) fn be_u64(b: &[u8]) -> u64 {
    u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

pub(crate) fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_be_bytes());
}

pub(crate) fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_be_bytes());
}

pub(crate) fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_be_bytes());
}
