use std::collections::VecDeque;

use tracing::debug;

use super::tx::Transaction;
use crate::buf::AlignedBuf;

/// One cached per-block allocation bitmap.
///
/// `map` is the committed on-disk state; `shadow` accumulates bits from
/// in-flight writes and is promoted to `map` only when the bitmap write
/// commits. Each entry embeds its transaction and the descriptor state
/// for its own metadata I/O, so bitmap I/O never competes with data
/// requests for pool slots.
#[derive(Debug)]
pub(crate) struct BitmapEntry {
    pub blk: Option<u32>,
    pub seqno: u64,
    /// Logical lock: set while outstanding work references this entry.
    pub locked: bool,
    pub read_pending: bool,
    pub write_pending: bool,
    pub map: AlignedBuf,
    pub shadow: AlignedBuf,
    pub tx: Transaction,
    /// Writes deferred past the closed transaction, drained into a fresh
    /// one when it finalizes. Pool descriptor ids.
    pub queue: VecDeque<usize>,
    /// Requests blocked on the bitmap read. Pool descriptor ids.
    pub waiting: VecDeque<usize>,
}

impl BitmapEntry {
    fn new(bitmap_bytes: usize) -> Self {
        BitmapEntry {
            blk: None,
            seqno: 0,
            locked: false,
            read_pending: false,
            write_pending: false,
            map: AlignedBuf::new(bitmap_bytes),
            shadow: AlignedBuf::new(bitmap_bytes),
            tx: Transaction::default(),
            queue: VecDeque::new(),
            waiting: VecDeque::new(),
        }
    }

    /// Not evictable while any of these hold.
    pub fn in_use(&self) -> bool {
        self.read_pending
            || self.write_pending
            || self.tx.live()
            || !self.waiting.is_empty()
            || !self.queue.is_empty()
            || !self.tx.requests.is_empty()
    }

    /// Return the entry to the free state. Both bitmaps are zeroed so a
    /// later occupant of the slot can never observe stale bits.
    pub fn clear(&mut self) {
        self.blk = None;
        self.seqno = 0;
        self.locked = false;
        self.read_pending = false;
        self.write_pending = false;
        self.map.fill(0);
        self.shadow.fill(0);
        self.tx.reset();
        self.queue.clear();
        self.waiting.clear();
    }

    /// Test a committed bit. VHD bitmaps are MSB-first within each byte.
    pub fn test_bit(&self, sec_in_blk: u32) -> bool {
        let byte = (sec_in_blk / 8) as usize;
        self.map[byte] & (0x80 >> (sec_in_blk % 8)) != 0
    }

    pub fn shadow_set(&mut self, sec_in_blk: u32) {
        let byte = (sec_in_blk / 8) as usize;
        self.shadow[byte] |= 0x80 >> (sec_in_blk % 8);
    }

    /// Length of the run of sectors starting at `sec_in_blk` whose
    /// committed bit equals `set`, capped at `max`.
    pub fn run_len(&self, sec_in_blk: u32, max: u32, set: bool) -> u32 {
        let mut n = 1;
        while n < max && self.test_bit(sec_in_blk + n) == set {
            n += 1;
        }
        n
    }
}

/// Fixed-capacity associative cache of block bitmaps with LRU eviction.
/// Lookup is a linear scan; the capacity is small and constant-time
/// bounds matter more than asymptotics here.
pub(crate) struct BitmapCache {
    entries: Vec<BitmapEntry>,
    seq: u64,
}

impl BitmapCache {
    pub fn new(capacity: usize, bitmap_bytes: usize) -> Self {
        BitmapCache {
            entries: (0..capacity).map(|_| BitmapEntry::new(bitmap_bytes)).collect(),
            seq: 0,
        }
    }

    pub fn get(&self, slot: usize) -> &BitmapEntry {
        &self.entries[slot]
    }

    pub fn get_mut(&mut self, slot: usize) -> &mut BitmapEntry {
        &mut self.entries[slot]
    }

    pub fn find(&self, blk: u32) -> Option<usize> {
        self.entries.iter().position(|e| e.blk == Some(blk))
    }

    /// Bump the LRU sequence for a touched entry. When the counter nears
    /// the end of its span, halve everything to compact.
    pub fn touch(&mut self, slot: usize) {
        if self.seq >= u64::MAX - 1 {
            for e in &mut self.entries {
                e.seqno >>= 1;
            }
            self.seq >>= 1;
        }
        self.seq += 1;
        self.entries[slot].seqno = self.seq;
    }

    /// Install `blk` in a free slot, evicting the least recently used
    /// unlocked idle entry if necessary. `None` means every slot is
    /// pinned and the caller must surface BUSY.
    pub fn alloc(&mut self, blk: u32) -> Option<usize> {
        debug_assert!(self.find(blk).is_none());
        let slot = match self.entries.iter().position(|e| e.blk.is_none()) {
            Some(free) => free,
            None => {
                let victim = self
                    .entries
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| !e.locked && !e.in_use())
                    .min_by_key(|(_, e)| e.seqno)
                    .map(|(i, _)| i)?;
                debug!(blk = ?self.entries[victim].blk, "evicting bitmap");
                self.entries[victim].clear();
                victim
            }
        };
        self.entries[slot].blk = Some(blk);
        self.touch(slot);
        Some(slot)
    }
}
