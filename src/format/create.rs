use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use tracing::info;

use super::{
    header, round_up, DynamicHeader, Footer, ParentLocator, VhdType, DD_BLK_UNUSED,
    DEFAULT_BLOCK_SIZE, DEFAULT_HEADER_OFFSET, DEFAULT_TABLE_OFFSET, PLAT_CODE_MACX,
    PLAT_CODE_W2KU,
};
use crate::error::{Result, VhdError};
use crate::SECTOR_SIZE;

#[derive(Debug, Clone, Default)]
pub struct CreateOpts {
    /// Sparse (dynamic) image instead of a fully mapped fixed one.
    pub sparse: bool,
    /// Parent image path. Implies a sparse differencing image; the new
    /// image inherits the parent's virtual size.
    pub backing: Option<std::path::PathBuf>,
}

/// Create a new VHD image at `path`.
///
/// `size` is the virtual size in bytes and must be a sector multiple; it
/// is ignored (may be zero) when a backing file supplies the size.
pub fn create(path: &Path, size: u64, opts: &CreateOpts) -> Result<()> {
    let (size, parent) = match &opts.backing {
        Some(parent_path) => {
            let parent = ParentInfo::load(parent_path)?;
            (parent.footer.current_size, Some(parent))
        }
        None => {
            if size == 0 || size % SECTOR_SIZE as u64 != 0 {
                return Err(VhdError::InvalidArg);
            }
            (size, None)
        }
    };

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)?;

    let disk_type = match (&parent, opts.sparse) {
        (Some(_), _) => VhdType::Diff,
        (None, true) => VhdType::Dynamic,
        (None, false) => VhdType::Fixed,
    };

    if disk_type == VhdType::Fixed {
        let footer = Footer::new(VhdType::Fixed, size, u64::MAX);
        file.set_len(size)?;
        file.write_all_at(&footer.to_bytes(), size)?;
        file.sync_all()?;
        info!(path = %path.display(), size, "created fixed vhd");
        return Ok(());
    }

    let footer = Footer::new(disk_type, size, DEFAULT_HEADER_OFFSET);
    let max_bat_size = size.div_ceil(DEFAULT_BLOCK_SIZE as u64) as u32;
    let mut hdr = DynamicHeader::new(DEFAULT_TABLE_OFFSET, max_bat_size, DEFAULT_BLOCK_SIZE);

    let bat_bytes = round_up(max_bat_size as u64 * 4, SECTOR_SIZE as u64);
    let mut data_end = DEFAULT_TABLE_OFFSET + bat_bytes;

    let mut locator_blobs: Vec<(u64, Vec<u8>)> = Vec::new();
    if let Some(parent) = &parent {
        hdr.prt_uuid = parent.footer.uuid;
        hdr.prt_ts = parent.timestamp;
        hdr.prt_name = parent.path.clone();

        for (slot, code) in [PLAT_CODE_MACX, PLAT_CODE_W2KU].into_iter().enumerate() {
            let blob = header::encode_locator(code, &parent.path)
                .ok_or(VhdError::Unsupported("parent locator encoding"))?;
            let space = round_up(blob.len().max(1) as u64, SECTOR_SIZE as u64);
            hdr.locators[slot] = ParentLocator {
                code,
                data_space: (space / SECTOR_SIZE as u64) as u32,
                data_length: blob.len() as u32,
                data_offset: data_end,
            };
            locator_blobs.push((data_end, blob));
            data_end += space;
        }
    }

    // Backup footer, header, empty BAT, locator data, footer at EOF.
    let footer_bytes = footer.to_bytes();
    file.write_all_at(&footer_bytes, 0)?;
    file.write_all_at(&hdr.to_bytes(), DEFAULT_HEADER_OFFSET)?;

    let mut bat = vec![0u8; bat_bytes as usize];
    for entry in bat.chunks_exact_mut(4) {
        entry.copy_from_slice(&DD_BLK_UNUSED.to_be_bytes());
    }
    file.write_all_at(&bat, DEFAULT_TABLE_OFFSET)?;

    for (off, blob) in &locator_blobs {
        file.write_all_at(blob, *off)?;
    }

    file.write_all_at(&footer_bytes, data_end)?;
    file.sync_all()?;
    info!(path = %path.display(), size, ?disk_type, "created sparse vhd");
    Ok(())
}

/// Create a differencing child of `parent` at `child`.
pub fn snapshot(parent: &Path, child: &Path) -> Result<()> {
    create(
        child,
        0,
        &CreateOpts {
            sparse: true,
            backing: Some(parent.to_path_buf()),
        },
    )
}

/// Check that `parent` is the image `child` was snapshotted from: the
/// recorded parent UUID and modification timestamp must both match.
pub fn validate_parent(child: &Path, parent: &Path) -> Result<()> {
    let child_file = File::open(child)?;
    let child_footer = read_footer(&child_file)?;
    if !child_footer.disk_type.is_sparse() {
        return Err(VhdError::NoParent);
    }
    let child_hdr = read_header(&child_file, child_footer.data_offset)?;
    if child_footer.disk_type != VhdType::Diff {
        return Err(VhdError::NoParent);
    }

    let info = ParentInfo::load(parent)?;
    if info.footer.uuid != child_hdr.prt_uuid {
        return Err(VhdError::ParentMismatch("uuid"));
    }
    if info.timestamp != child_hdr.prt_ts {
        return Err(VhdError::ParentMismatch("timestamp"));
    }
    Ok(())
}

struct ParentInfo {
    footer: Footer,
    timestamp: u32,
    path: String,
}

impl ParentInfo {
    fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let footer = read_footer(&file)?;
        let mtime = file.metadata()?.modified()?;
        Ok(ParentInfo {
            footer,
            timestamp: super::vhd_time(mtime),
            path: path.to_string_lossy().into_owned(),
        })
    }
}

/// Read and parse the footer of an image, preferring the EOF copy and
/// falling back to the byte-0 backup kept by sparse images.
pub fn read_footer(file: &File) -> Result<Footer> {
    let len = file.metadata()?.len();
    if len < SECTOR_SIZE as u64 {
        return Err(VhdError::Corrupt("file too small for a footer"));
    }
    let mut raw = [0u8; SECTOR_SIZE];
    file.read_exact_at(&mut raw, len - SECTOR_SIZE as u64)?;
    match Footer::parse(&raw) {
        Ok(f) => Ok(f),
        Err(primary) => {
            file.read_exact_at(&mut raw, 0)?;
            Footer::parse(&raw).map_err(|_| primary)
        }
    }
}

/// Read and parse the dynamic header at `data_offset`.
pub fn read_header(file: &File, data_offset: u64) -> Result<DynamicHeader> {
    if data_offset == u64::MAX || data_offset % SECTOR_SIZE as u64 != 0 {
        return Err(VhdError::Corrupt("dynamic header offset invalid"));
    }
    let mut raw = [0u8; header::HEADER_SIZE];
    file.read_exact_at(&mut raw, data_offset)?;
    DynamicHeader::parse(&raw)
}

/// Decode the parent path recorded in `hdr`, consulting locator data in
/// `file`. MACX and W2KU locators are honored; other codes are skipped.
pub fn read_parent_path(file: &File, hdr: &DynamicHeader) -> Result<Option<String>> {
    for loc in hdr.locators.iter().filter(|l| l.is_present()) {
        if loc.data_length as u64 > loc.capacity_bytes() {
            return Err(VhdError::Corrupt("locator length exceeds its space"));
        }
        let mut data = vec![0u8; loc.data_length as usize];
        file.read_exact_at(&mut data, loc.data_offset)?;
        if let Some(path) = header::decode_locator(loc.code, &data) {
            return Ok(Some(path));
        }
    }
    Ok(None)
}
