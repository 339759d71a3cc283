//! Request classification and routing. Incoming reads and writes are
//! walked in maximal runs; each run head is classified against the BAT
//! and the bitmap cache and either scheduled, completed synchronously,
//! or parked behind pending metadata.

use tracing::debug;

use super::aio::Token;
use super::request::{ReqOp, ReqRef};
use super::{IoStatus, Rejected, VhdDriver};
use crate::buf::AlignedBuf;
use crate::error::VhdError;
use crate::format::{VhdType, DD_BLK_UNUSED};
use crate::{SECTOR_SHIFT, SECTOR_SIZE};

impl VhdDriver {
    /// Queue a read of `nr_secs` sectors starting at `sector`.
    ///
    /// Every run of the range produces exactly one completion through
    /// `sink`, now or from a later [`VhdDriver::do_callbacks`]. Returns
    /// the sum of the sink's return values for completions delivered
    /// synchronously.
    pub fn queue_read(
        &mut self,
        sector: u64,
        nr_secs: u32,
        buf: AlignedBuf,
        id: u64,
        sink: &mut dyn FnMut(super::Completion) -> i32,
    ) -> std::result::Result<i32, Rejected> {
        self.queue(ReqOp::DataRead, sector, nr_secs, buf, id, sink)
    }

    /// Queue a write. Completion of a run is only signaled once the data
    /// and any bitmap/BAT updates it depends on are durable.
    pub fn queue_write(
        &mut self,
        sector: u64,
        nr_secs: u32,
        buf: AlignedBuf,
        id: u64,
        sink: &mut dyn FnMut(super::Completion) -> i32,
    ) -> std::result::Result<i32, Rejected> {
        if self.read_only {
            return Err(Rejected { error: VhdError::ReadOnly, buf });
        }
        self.queue(ReqOp::DataWrite, sector, nr_secs, buf, id, sink)
    }

    fn queue(
        &mut self,
        op: ReqOp,
        sector: u64,
        nr_secs: u32,
        buf: AlignedBuf,
        id: u64,
        sink: &mut dyn FnMut(super::Completion) -> i32,
    ) -> std::result::Result<i32, Rejected> {
        let in_range = sector
            .checked_add(nr_secs as u64)
            .is_some_and(|end| end <= self.curr_secs);
        if !in_range || buf.len() < (nr_secs as usize) << SECTOR_SHIFT {
            return Err(Rejected { error: VhdError::InvalidArg, buf });
        }

        let host = self.hosts.insert(id, buf, sector);
        if nr_secs == 0 {
            self.hosts.get_mut(host).outstanding += 1;
            self.complete_run(host, sector, 0, IoStatus::Ok);
            return Ok(self.drain_done(sink));
        }

        let end = sector + nr_secs as u64;
        let mut sec = sector;
        while sec < end {
            let remaining = (end - sec) as u32;
            let consumed = match op {
                ReqOp::DataRead => self.route_read(host, sec, remaining),
                ReqOp::DataWrite => self.route_write(host, sec, remaining),
            };
            debug_assert!(consumed > 0 && consumed <= remaining);
            sec += consumed as u64;
        }
        Ok(self.drain_done(sink))
    }

    /// Route one read run starting at `sector`; returns sectors consumed.
    pub(super) fn route_read(&mut self, host: usize, sector: u64, remaining: u32) -> u32 {
        if self.kind == VhdType::Fixed {
            // Fixed images map 1:1; the whole remainder is one run.
            if !self.schedule_data(ReqOp::DataRead, host, sector, remaining, sector, false) {
                self.busy_run(host, sector, remaining);
            }
            return remaining;
        }

        let blk = (sector / self.spb as u64) as u32;
        let within = (sector % self.spb as u64) as u32;
        let max_run = remaining.min(self.spb - within);

        let entry = self.bat.entry(blk);
        if entry == DD_BLK_UNUSED {
            // Hole (including a block whose allocation has not committed
            // yet): the host dispatcher may consult a parent image.
            self.hosts.get_mut(host).outstanding += 1;
            self.complete_run(host, sector, max_run, IoStatus::NotAllocated);
            return max_run;
        }

        if self.kind == VhdType::Dynamic {
            // Allocated blocks of dynamic images are fully present.
            let off = entry as u64 + self.bm_secs as u64 + within as u64;
            if !self.schedule_data(ReqOp::DataRead, host, sector, max_run, off, false) {
                self.busy_run(host, sector, remaining);
                return remaining;
            }
            return max_run;
        }

        match self.cache.find(blk) {
            None => self.wait_on_bitmap(ReqOp::DataRead, host, sector, max_run, remaining, blk),
            Some(slot) if self.cache.get(slot).read_pending => {
                self.park_waiting(ReqOp::DataRead, host, sector, max_run, remaining, slot)
            }
            Some(slot) => {
                self.cache.touch(slot);
                let e = self.cache.get(slot);
                let set = e.test_bit(within);
                let run = e.run_len(within, max_run, set);
                if set {
                    let off = entry as u64 + self.bm_secs as u64 + within as u64;
                    if !self.schedule_data(ReqOp::DataRead, host, sector, run, off, false) {
                        self.busy_run(host, sector, remaining);
                        return remaining;
                    }
                } else {
                    self.hosts.get_mut(host).outstanding += 1;
                    self.complete_run(host, sector, run, IoStatus::NotAllocated);
                }
                run
            }
        }
    }

    /// Route one write run starting at `sector`; returns sectors consumed.
    pub(super) fn route_write(&mut self, host: usize, sector: u64, remaining: u32) -> u32 {
        if self.kind == VhdType::Fixed {
            if !self.schedule_data(ReqOp::DataWrite, host, sector, remaining, sector, false) {
                self.busy_run(host, sector, remaining);
            }
            return remaining;
        }

        let blk = (sector / self.spb as u64) as u32;
        let within = (sector % self.spb as u64) as u32;
        let max_run = remaining.min(self.spb - within);

        let entry = self.bat.entry(blk);
        if entry == DD_BLK_UNUSED {
            if self.bat.locked {
                if self.bat.pbw_blk == blk {
                    // This block's allocation is already in flight; the
                    // write joins its transaction (or the queue behind
                    // it) and lands at the reserved offset.
                    let off = self.bat.pbw_offset + self.bm_secs as u64 + within as u64;
                    if !self.schedule_data(ReqOp::DataWrite, host, sector, max_run, off, true) {
                        self.busy_run(host, sector, remaining);
                        return remaining;
                    }
                    return max_run;
                }
                // Another block's BAT allocation is in flight; at most
                // one may be. BUSY for the remaining range.
                debug!(blk, pbw_blk = self.bat.pbw_blk, "bat locked, deferring write");
                self.busy_run(host, sector, remaining);
                return remaining;
            }
            return self.start_allocation(host, sector, max_run, remaining);
        }

        if self.kind == VhdType::Dynamic {
            let off = entry as u64 + self.bm_secs as u64 + within as u64;
            if !self.schedule_data(ReqOp::DataWrite, host, sector, max_run, off, false) {
                self.busy_run(host, sector, remaining);
                return remaining;
            }
            return max_run;
        }

        match self.cache.find(blk) {
            None => self.wait_on_bitmap(ReqOp::DataWrite, host, sector, max_run, remaining, blk),
            Some(slot) if self.cache.get(slot).read_pending => {
                self.park_waiting(ReqOp::DataWrite, host, sector, max_run, remaining, slot)
            }
            Some(slot) => {
                self.cache.touch(slot);
                let e = self.cache.get(slot);
                let set = e.test_bit(within);
                let run = e.run_len(within, max_run, set);
                let off = entry as u64 + self.bm_secs as u64 + within as u64;
                // Writes over set bits need no bitmap update; clear bits
                // enroll the request in the block's transaction.
                if !self.schedule_data(ReqOp::DataWrite, host, sector, run, off, !set) {
                    self.busy_run(host, sector, remaining);
                    return remaining;
                }
                run
            }
        }
    }

    /// Open a BAT-and-bitmap transaction for an unallocated block: reserve
    /// the block, write a zeroed bitmap at the reserved offset, and issue
    /// the data write against it.
    fn start_allocation(&mut self, host: usize, sector: u64, max_run: u32, remaining: u32) -> u32 {
        let blk = (sector / self.spb as u64) as u32;
        let within = (sector % self.spb as u64) as u32;

        let Some(slot) = self.cache.alloc(blk) else {
            self.busy_run(host, sector, remaining);
            return remaining;
        };
        if self.pool.exhausted() {
            self.cache.get_mut(slot).clear();
            self.busy_run(host, sector, remaining);
            return remaining;
        }

        // Extend the file over the whole block up front so reads of its
        // not-yet-written sectors return zeros instead of short-reading
        // at EOF.
        let block_end =
            (self.bat.next_db + self.bm_secs as u64 + self.spb as u64) << SECTOR_SHIFT;
        let file_len = self.file.metadata().map(|m| m.len()).unwrap_or(0);
        if file_len < block_end {
            if let Err(e) = self.file.set_len(block_end) {
                tracing::warn!(error = %e, "failed to extend image for new block");
                self.cache.get_mut(slot).clear();
                self.busy_run(host, sector, remaining);
                return remaining;
            }
        }

        self.bat.reserve(blk);
        debug!(blk, offset = self.bat.pbw_offset, "reserved new block");

        let zero_len = (self.bm_secs as usize * SECTOR_SIZE) as u32;
        let bm_off = self.bat.pbw_offset << SECTOR_SHIFT;
        let e = self.cache.get_mut(slot);
        e.locked = true;
        e.tx.update_bat = true;
        e.tx.add(ReqRef::ZeroBm);
        let shadow_ptr = e.shadow.io_ptr();
        self.aio.write(Token::ZeroBm, shadow_ptr, zero_len, bm_off);

        let data_off = self.bat.pbw_offset + self.bm_secs as u64 + within as u64;
        let scheduled =
            self.schedule_data(ReqOp::DataWrite, host, sector, max_run, data_off, true);
        debug_assert!(scheduled, "pool availability checked above");
        max_run
    }

    /// Draw a descriptor and issue the data transfer. `file_secs` is the
    /// container sector the run starts at. Returns false when the pool is
    /// exhausted.
    fn schedule_data(
        &mut self,
        op: ReqOp,
        host: usize,
        sector: u64,
        nr_secs: u32,
        file_secs: u64,
        update_bitmap: bool,
    ) -> bool {
        let Some(id) = self.pool.alloc() else {
            return false;
        };

        let h = self.hosts.get_mut(host);
        h.outstanding += 1;
        let ptr = unsafe {
            h.buf
                .io_ptr()
                .add(((sector - h.base) as usize) << SECTOR_SHIFT)
        };

        let req = self.pool.get_mut(id);
        req.op = op;
        req.sector = sector;
        req.nr_secs = nr_secs;
        req.buf = ptr;
        req.host = host;

        if update_bitmap {
            self.enroll(id);
        }

        let len = nr_secs << SECTOR_SHIFT;
        let off = file_secs << SECTOR_SHIFT;
        match op {
            ReqOp::DataRead => self.aio.read(Token::Data(id), ptr, len, off),
            ReqOp::DataWrite => self.aio.write(Token::Data(id), ptr, len, off),
        }
        true
    }

    /// Lock the block's bitmap and attach an UPDATE_BITMAP write to the
    /// current transaction, or queue it behind a closed one.
    fn enroll(&mut self, id: usize) {
        let sector = self.pool.get(id).sector;
        let blk = (sector / self.spb as u64) as u32;
        let slot = self.cache.find(blk).expect("bitmap present for enrolment");
        self.cache.touch(slot);
        let e = self.cache.get_mut(slot);
        e.locked = true;
        if e.tx.closed {
            e.queue.push_back(id);
            self.pool.get_mut(id).queued = true;
        } else {
            e.tx.add(ReqRef::Pool(id));
            self.pool.get_mut(id).in_tx = true;
        }
    }

    /// The block's bitmap is not cached: install an entry, issue the
    /// bitmap read, and park the request on the waiting list.
    fn wait_on_bitmap(
        &mut self,
        op: ReqOp,
        host: usize,
        sector: u64,
        max_run: u32,
        remaining: u32,
        blk: u32,
    ) -> u32 {
        let Some(id) = self.pool.alloc() else {
            self.busy_run(host, sector, remaining);
            return remaining;
        };
        let Some(slot) = self.cache.alloc(blk) else {
            self.pool.release(id);
            self.busy_run(host, sector, remaining);
            return remaining;
        };

        let bm_len = (self.bm_secs as usize * SECTOR_SIZE) as u32;
        let bm_off = self.bat.bitmap_offset(blk);
        let e = self.cache.get_mut(slot);
        e.read_pending = true;
        let map_ptr = e.map.io_ptr();
        self.aio.read(Token::BitmapRead(slot), map_ptr, bm_len, bm_off);

        self.park(op, host, sector, max_run, id, slot);
        max_run
    }

    /// Park a request on a bitmap whose read is already pending.
    fn park_waiting(
        &mut self,
        op: ReqOp,
        host: usize,
        sector: u64,
        max_run: u32,
        remaining: u32,
        slot: usize,
    ) -> u32 {
        let Some(id) = self.pool.alloc() else {
            self.busy_run(host, sector, remaining);
            return remaining;
        };
        self.park(op, host, sector, max_run, id, slot);
        max_run
    }

    fn park(&mut self, op: ReqOp, host: usize, sector: u64, max_run: u32, id: usize, slot: usize) {
        self.hosts.get_mut(host).outstanding += 1;
        let req = self.pool.get_mut(id);
        req.op = op;
        req.sector = sector;
        req.nr_secs = max_run;
        req.host = host;
        self.cache.get_mut(slot).waiting.push_back(id);
    }

    /// Synchronous BUSY completion for the remaining range.
    fn busy_run(&mut self, host: usize, sector: u64, remaining: u32) {
        self.hosts.get_mut(host).outstanding += 1;
        self.complete_run(host, sector, remaining, IoStatus::Busy);
    }
}
