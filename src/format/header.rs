use uuid::Uuid;

use super::{
    be_u32, be_u64, checksum, put_u32, put_u64, VhdError, HEADER_COOKIE, HEADER_VERSION,
    PLAT_CODE_MACX, PLAT_CODE_NONE, PLAT_CODE_W2KU,
};
use crate::error::Result;
use crate::SECTOR_SIZE;

pub const HEADER_SIZE: usize = 1024;
const CHECKSUM_FIELD: std::ops::Range<usize> = 36..40;
const PARENT_NAME_OFF: usize = 64;
const PARENT_NAME_LEN: usize = 512;
const LOCATOR_TABLE_OFF: usize = 576;
const LOCATOR_ENTRY_SIZE: usize = 24;
pub const LOCATOR_ENTRIES: usize = 8;

/// One of the eight parent-locator slots in the dynamic header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParentLocator {
    pub code: u32,
    /// Space reserved for the locator data. Some writers record sectors
    /// here and some record bytes; [`ParentLocator::capacity_bytes`]
    /// accepts either.
    pub data_space: u32,
    /// Actual encoded length in bytes.
    pub data_length: u32,
    pub data_offset: u64,
}

impl ParentLocator {
    pub fn is_present(&self) -> bool {
        self.code != PLAT_CODE_NONE
    }

    /// Reserved capacity in bytes, whichever unit the writer used.
    pub fn capacity_bytes(&self) -> u64 {
        let space = self.data_space as u64;
        if space < SECTOR_SIZE as u64 {
            space * SECTOR_SIZE as u64
        } else {
            space
        }
    }
}

/// The 1024-byte dynamic-disk header of sparse (dynamic and differencing)
/// images.
#[derive(Debug, Clone)]
pub struct DynamicHeader {
    pub table_offset: u64,
    pub max_bat_size: u32,
    pub block_size: u32,
    pub prt_uuid: Uuid,
    pub prt_ts: u32,
    pub prt_name: String,
    pub locators: [ParentLocator; LOCATOR_ENTRIES],
}

impl DynamicHeader {
    pub fn new(table_offset: u64, max_bat_size: u32, block_size: u32) -> Self {
        DynamicHeader {
            table_offset,
            max_bat_size,
            block_size,
            prt_uuid: Uuid::nil(),
            prt_ts: 0,
            prt_name: String::new(),
            locators: [ParentLocator::default(); LOCATOR_ENTRIES],
        }
    }

    pub fn parse(raw: &[u8; HEADER_SIZE]) -> Result<Self> {
        if &raw[..8] != HEADER_COOKIE {
            return Err(VhdError::Corrupt("dynamic header cookie mismatch"));
        }
        if be_u32(&raw[36..40]) != checksum(raw, CHECKSUM_FIELD) {
            return Err(VhdError::Corrupt("dynamic header checksum mismatch"));
        }
        if be_u32(&raw[24..28]) != HEADER_VERSION {
            return Err(VhdError::Unsupported("dynamic header version"));
        }

        let table_offset = be_u64(&raw[16..24]);
        if table_offset % SECTOR_SIZE as u64 != 0 {
            return Err(VhdError::Corrupt("bat offset misaligned"));
        }
        let max_bat_size = be_u32(&raw[28..32]);
        if max_bat_size == 0 {
            return Err(VhdError::Corrupt("bat has no entries"));
        }
        let block_size = be_u32(&raw[32..36]);
        if !block_size.is_power_of_two() || block_size < SECTOR_SIZE as u32 {
            return Err(VhdError::Corrupt("block size not a power-of-two multiple of 512"));
        }

        let mut uuid_bytes = [0u8; 16];
        uuid_bytes.copy_from_slice(&raw[40..56]);

        let mut locators = [ParentLocator::default(); LOCATOR_ENTRIES];
        for (i, loc) in locators.iter_mut().enumerate() {
            let off = LOCATOR_TABLE_OFF + i * LOCATOR_ENTRY_SIZE;
            *loc = ParentLocator {
                code: be_u32(&raw[off..off + 4]),
                data_space: be_u32(&raw[off + 4..off + 8]),
                data_length: be_u32(&raw[off + 8..off + 12]),
                data_offset: be_u64(&raw[off + 16..off + 24]),
            };
        }

        Ok(DynamicHeader {
            table_offset,
            max_bat_size,
            block_size,
            prt_uuid: Uuid::from_bytes(uuid_bytes),
            prt_ts: be_u32(&raw[56..60]),
            prt_name: decode_utf16le_name(&raw[PARENT_NAME_OFF..PARENT_NAME_OFF + PARENT_NAME_LEN]),
            locators,
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut raw = [0u8; HEADER_SIZE];
        raw[..8].copy_from_slice(HEADER_COOKIE);
        put_u64(&mut raw, 8, u64::MAX); // data_offset, unused
        put_u64(&mut raw, 16, self.table_offset);
        put_u32(&mut raw, 24, HEADER_VERSION);
        put_u32(&mut raw, 28, self.max_bat_size);
        put_u32(&mut raw, 32, self.block_size);
        raw[40..56].copy_from_slice(self.prt_uuid.as_bytes());
        put_u32(&mut raw, 56, self.prt_ts);
        encode_utf16le_name(
            &self.prt_name,
            &mut raw[PARENT_NAME_OFF..PARENT_NAME_OFF + PARENT_NAME_LEN],
        );
        for (i, loc) in self.locators.iter().enumerate() {
            let off = LOCATOR_TABLE_OFF + i * LOCATOR_ENTRY_SIZE;
            put_u32(&mut raw, off, loc.code);
            put_u32(&mut raw, off + 4, loc.data_space);
            put_u32(&mut raw, off + 8, loc.data_length);
            put_u64(&mut raw, off + 16, loc.data_offset);
        }
        let sum = checksum(&raw, CHECKSUM_FIELD);
        put_u32(&mut raw, 36, sum);
        raw
    }

    /// Sectors occupied by the BAT, padded to a sector boundary.
    pub fn bat_sectors(&self) -> u64 {
        (self.max_bat_size as u64 * 4).div_ceil(SECTOR_SIZE as u64)
    }
}

fn decode_utf16le_name(raw: &[u8]) -> String {
    let mut units = Vec::with_capacity(raw.len() / 2);
    for pair in raw.chunks_exact(2) {
        let u = u16::from_le_bytes([pair[0], pair[1]]);
        if u == 0 {
            break;
        }
        units.push(u);
    }
    String::from_utf16_lossy(&units)
}

fn encode_utf16le_name(name: &str, out: &mut [u8]) {
    let mut i = 0;
    for unit in name.encode_utf16() {
        if i + 2 > out.len() {
            break;
        }
        out[i..i + 2].copy_from_slice(&unit.to_le_bytes());
        i += 2;
    }
}

/// Decode locator data for the two platform codes this backend honors.
/// Returns `None` for codes it ignores.
pub fn decode_locator(code: u32, data: &[u8]) -> Option<String> {
    match code {
        PLAT_CODE_MACX => {
            let s = std::str::from_utf8(data).ok()?;
            let s = s.trim_end_matches('\0');
            Some(s.strip_prefix("file://").unwrap_or(s).to_string())
        }
        PLAT_CODE_W2KU => {
            let mut units = Vec::with_capacity(data.len() / 2);
            for pair in data.chunks_exact(2) {
                let u = u16::from_le_bytes([pair[0], pair[1]]);
                if u == 0 {
                    break;
                }
                units.push(u);
            }
            let s = String::from_utf16_lossy(&units);
            // Windows path: strip the drive letter, map backslashes.
            let s = s.replace('\\', "/");
            let s = match s.as_bytes() {
                [d, b':', ..] if d.is_ascii_alphabetic() => s[2..].to_string(),
                _ => s,
            };
            Some(s)
        }
        _ => None,
    }
}

/// Encode locator data for a platform code. Returns the raw bytes to be
/// stored at the locator's data offset.
pub fn encode_locator(code: u32, path: &str) -> Option<Vec<u8>> {
    match code {
        PLAT_CODE_MACX => Some(format!("file://{path}").into_bytes()),
        PLAT_CODE_W2KU => {
            let mut out = Vec::new();
            for unit in path.encode_utf16() {
                out.extend_from_slice(&unit.to_le_bytes());
            }
            Some(out)
        }
        _ => None,
    }
}
