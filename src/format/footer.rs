use uuid::Uuid;

use super::{
    be_u16, be_u32, be_u64, checksum, put_u16, put_u32, put_u64, VhdType, FILE_FORMAT_VERSION,
    FOOTER_COOKIE,
};
use crate::error::{Result, VhdError};
use crate::SECTOR_SIZE;

const CHECKSUM_FIELD: std::ops::Range<usize> = 64..68;

/// CHS geometry advertised in the footer. Purely informational for this
/// backend but required by the format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors_per_track: u8,
}

impl Geometry {
    /// The appendix algorithm from the VHD specification.
    pub fn for_sectors(total: u64) -> Self {
        let mut cth = total.min(65535 * 16 * 255);
        let (heads, spt);
        if cth >= 65535 * 16 * 63 {
            spt = 255u64;
            heads = 16u64;
            cth /= spt;
        } else {
            let mut s = 17u64;
            cth /= s;
            let mut h = (cth + 1023) / 1024;
            if h < 4 {
                h = 4;
            }
            if cth >= h * 1024 || h > 16 {
                s = 31;
                h = 16;
                cth = total.min(65535 * 16 * 255) / s;
            }
            if cth >= h * 1024 {
                s = 63;
                h = 16;
                cth = total.min(65535 * 16 * 255) / s;
            }
            spt = s;
            heads = h;
        }
        Geometry {
            cylinders: (cth / heads) as u16,
            heads: heads as u8,
            sectors_per_track: spt as u8,
        }
    }
}

/// The 512-byte footer stored at end of file (and, for sparse types, as a
/// backup copy at byte 0).
#[derive(Debug, Clone)]
pub struct Footer {
    pub features: u32,
    pub data_offset: u64,
    pub timestamp: u32,
    pub creator_app: [u8; 4],
    pub creator_version: u32,
    pub creator_os: u32,
    pub original_size: u64,
    pub current_size: u64,
    pub geometry: Geometry,
    pub disk_type: VhdType,
    pub uuid: Uuid,
    pub saved_state: bool,
}

impl Footer {
    pub fn new(disk_type: VhdType, size: u64, data_offset: u64) -> Self {
        Footer {
            features: 2, // reserved bit, always set per the format
            data_offset,
            timestamp: super::vhd_now(),
            creator_app: *b"vhda",
            creator_version: 0x0001_0000,
            creator_os: 0,
            original_size: size,
            current_size: size,
            geometry: Geometry::for_sectors(size / SECTOR_SIZE as u64),
            disk_type,
            uuid: Uuid::new_v4(),
            saved_state: false,
        }
    }

    pub fn parse(raw: &[u8; SECTOR_SIZE]) -> Result<Self> {
        if &raw[..8] != FOOTER_COOKIE {
            return Err(VhdError::Corrupt("footer cookie mismatch"));
        }
        if be_u32(&raw[64..68]) != checksum(raw, CHECKSUM_FIELD) {
            return Err(VhdError::Corrupt("footer checksum mismatch"));
        }
        let version = be_u32(&raw[12..16]);
        if version != FILE_FORMAT_VERSION {
            return Err(VhdError::Unsupported("file format version"));
        }
        let disk_type = VhdType::from_wire(be_u32(&raw[60..64]))?;
        let current_size = be_u64(&raw[48..56]);
        if current_size == 0 || current_size % SECTOR_SIZE as u64 != 0 {
            return Err(VhdError::Corrupt("current_size not sector-aligned"));
        }

        let mut creator_app = [0u8; 4];
        creator_app.copy_from_slice(&raw[28..32]);
        let mut uuid_bytes = [0u8; 16];
        uuid_bytes.copy_from_slice(&raw[68..84]);

        Ok(Footer {
            features: be_u32(&raw[8..12]),
            data_offset: be_u64(&raw[16..24]),
            timestamp: be_u32(&raw[24..28]),
            creator_app,
            creator_version: be_u32(&raw[32..36]),
            creator_os: be_u32(&raw[36..40]),
            original_size: be_u64(&raw[40..48]),
            current_size,
            geometry: Geometry {
                cylinders: be_u16(&raw[56..58]),
                heads: raw[58],
                sectors_per_track: raw[59],
            },
            disk_type,
            uuid: Uuid::from_bytes(uuid_bytes),
            saved_state: raw[84] != 0,
        })
    }

    pub fn to_bytes(&self) -> [u8; SECTOR_SIZE] {
        let mut raw = [0u8; SECTOR_SIZE];
        raw[..8].copy_from_slice(FOOTER_COOKIE);
        put_u32(&mut raw, 8, self.features);
        put_u32(&mut raw, 12, FILE_FORMAT_VERSION);
        put_u64(&mut raw, 16, self.data_offset);
        put_u32(&mut raw, 24, self.timestamp);
        raw[28..32].copy_from_slice(&self.creator_app);
        put_u32(&mut raw, 32, self.creator_version);
        put_u32(&mut raw, 36, self.creator_os);
        put_u64(&mut raw, 40, self.original_size);
        put_u64(&mut raw, 48, self.current_size);
        put_u16(&mut raw, 56, self.geometry.cylinders);
        raw[58] = self.geometry.heads;
        raw[59] = self.geometry.sectors_per_track;
        put_u32(&mut raw, 60, self.disk_type.to_wire());
        raw[68..84].copy_from_slice(self.uuid.as_bytes());
        raw[84] = self.saved_state as u8;
        let sum = checksum(&raw, CHECKSUM_FIELD);
        put_u32(&mut raw, 64, sum);
        raw
    }
}
