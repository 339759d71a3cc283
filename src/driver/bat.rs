use crate::buf::AlignedBuf;
use crate::format::DD_BLK_UNUSED;
use crate::{SECTOR_SHIFT, SECTOR_SIZE};

/// Sectors per page; new blocks are placed so their data region starts
/// page-aligned.
const SECS_PER_PAGE: u64 = 8;

/// The in-memory BAT plus the single pending-block-write slot.
///
/// At most one BAT allocation is ever in flight image-wide: `reserve`
/// locks the slot and records where the new block will land, but the
/// in-memory table entry and the allocation cursor move only when the
/// on-disk BAT write commits.
pub(crate) struct BatManager {
    pub table: Vec<u32>,
    /// Byte offset of the BAT in the container file.
    pub table_offset: u64,
    /// Allocation cursor, in sectors: where the next block's bitmap goes.
    pub next_db: u64,
    pub locked: bool,
    pub write_started: bool,
    pub pbw_blk: u32,
    /// Reserved sector offset for the pending block's bitmap.
    pub pbw_offset: u64,
    /// Bitmap cache slot whose transaction is parked on the BAT write.
    pub parked_tx: Option<usize>,
    /// Staging buffer for the one BAT sector being rewritten.
    sector_buf: AlignedBuf,
}

impl BatManager {
    pub fn new(table: Vec<u32>, table_offset: u64, next_db: u64) -> Self {
        BatManager {
            table,
            table_offset,
            next_db,
            locked: false,
            write_started: false,
            pbw_blk: 0,
            pbw_offset: 0,
            parked_tx: None,
            sector_buf: AlignedBuf::new(SECTOR_SIZE),
        }
    }

    pub fn entry(&self, blk: u32) -> u32 {
        self.table[blk as usize]
    }

    /// Reserve the next block for `blk`. Precondition: slot unlocked.
    pub fn reserve(&mut self, blk: u32) {
        debug_assert!(!self.locked && !self.write_started);
        debug_assert_eq!(self.table[blk as usize], DD_BLK_UNUSED);
        self.pbw_blk = blk;
        self.pbw_offset = self.next_db;
        self.locked = true;
    }

    /// Build the 512-byte BAT sector containing `pbw_blk`, with that one
    /// entry patched to the reserved offset and every other entry kept as
    /// the in-memory table has it. Returns the file offset to write and
    /// the staging pointer.
    pub fn stage_sector(&mut self) -> (u64, *const u8) {
        let entries_per_sec = SECTOR_SIZE / 4;
        let first = (self.pbw_blk as usize / entries_per_sec) * entries_per_sec;
        for i in 0..entries_per_sec {
            let value = match self.table.get(first + i) {
                Some(_) if first + i == self.pbw_blk as usize => self.pbw_offset as u32,
                Some(v) => *v,
                None => DD_BLK_UNUSED,
            };
            self.sector_buf[i * 4..i * 4 + 4].copy_from_slice(&value.to_be_bytes());
        }
        self.write_started = true;
        let off = self.table_offset + (first as u64 * 4);
        (off, self.sector_buf.as_ptr())
    }

    /// Commit the pending allocation after a successful BAT write:
    /// publish the table entry and advance the cursor past the new
    /// block, re-aligning so the next data region starts on a page.
    pub fn commit(&mut self, spb: u32, bm_secs: u32) {
        debug_assert!(self.locked);
        self.table[self.pbw_blk as usize] = self.pbw_offset as u32;
        self.next_db = self.pbw_offset + spb as u64 + bm_secs as u64;
        self.next_db = align_next_db(self.next_db, bm_secs);
    }

    /// Unlock the pending slot, leaving the table untouched.
    pub fn release(&mut self) {
        self.locked = false;
        self.write_started = false;
        self.pbw_blk = 0;
        self.pbw_offset = 0;
    }

    /// Byte offset of an allocated block's bitmap.
    pub fn bitmap_offset(&self, blk: u32) -> u64 {
        (self.entry(blk) as u64) << SECTOR_SHIFT
    }
}

/// Advance `next_db` so that the data region following the bitmap lands
/// on a page boundary.
pub(crate) fn align_next_db(next_db: u64, bm_secs: u32) -> u64 {
    let rem = (next_db + bm_secs as u64) % SECS_PER_PAGE;
    if rem == 0 {
        next_db
    } else {
        next_db + (SECS_PER_PAGE - rem)
    }
}
