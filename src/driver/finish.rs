//! Completion finishers: one per operation kind. Each state transition
//! of the write path is driven by exactly one completion event, which
//! keeps the machine replayable.

use tracing::{debug, warn};

use super::aio::Token;
use super::request::{ReqOp, ReqRef};
use super::{IoStatus, VhdDriver};
use crate::format::VhdType;
use crate::{SECTOR_SHIFT, SECTOR_SIZE};

/// Map a raw io_uring result to an optional negative errno. Short
/// transfers count as I/O errors.
fn io_err(res: i32, expected: u32) -> Option<i32> {
    if res < 0 {
        Some(res)
    } else if res as u32 != expected {
        Some(-libc::EIO)
    } else {
        None
    }
}

fn status_of(err: Option<i32>) -> IoStatus {
    match err {
        None => IoStatus::Ok,
        Some(e) => IoStatus::Error(e),
    }
}

impl VhdDriver {
    pub(super) fn dispatch(&mut self, token: Token, res: i32) {
        let bm_len = (self.bm_secs as u32) * SECTOR_SIZE as u32;
        match token {
            Token::Data(id) => {
                let (op, nr_secs) = {
                    let req = self.pool.get(id);
                    (req.op, req.nr_secs)
                };
                let err = io_err(res, nr_secs << SECTOR_SHIFT);
                match op {
                    ReqOp::DataRead => self.finish_data_read(id, err),
                    ReqOp::DataWrite => self.finish_data_write(id, err),
                }
            }
            Token::BitmapRead(slot) => self.finish_bitmap_read(slot, io_err(res, bm_len)),
            Token::BitmapWrite(slot) => self.finish_bitmap_write(slot, io_err(res, bm_len)),
            Token::ZeroBm => self.finish_zero_bm_write(io_err(res, bm_len)),
            Token::BatWrite => self.finish_bat_write(io_err(res, SECTOR_SIZE as u32)),
        }
    }

    fn finish_data_read(&mut self, id: usize, err: Option<i32>) {
        let req = self.pool.get(id);
        let (host, sector, nr_secs) = (req.host, req.sector, req.nr_secs);
        self.complete_run(host, sector, nr_secs, status_of(err));
        self.pool.release(id);
    }

    fn finish_data_write(&mut self, id: usize, err: Option<i32>) {
        let (host, sector, nr_secs, in_tx, queued) = {
            let req = self.pool.get_mut(id);
            req.finished = true;
            req.error = err;
            (req.host, req.sector, req.nr_secs, req.in_tx, req.queued)
        };

        if in_tx {
            let blk = (sector / self.spb as u64) as u32;
            let within = (sector % self.spb as u64) as u32;
            let slot = self.cache.find(blk).expect("transaction bitmap cached");
            let e = self.cache.get_mut(slot);
            if self.kind == VhdType::Diff && err.is_none() {
                for i in 0..nr_secs {
                    e.shadow_set(within + i);
                }
            }
            if let Some(errno) = err {
                e.tx.fail(errno);
            }
            e.tx.finished += 1;
            debug!(
                blk,
                started = e.tx.started,
                finished = e.tx.finished,
                "data write finished in tx"
            );
            if e.tx.completed() {
                self.finish_data_transaction(slot);
            }
        } else if !queued {
            self.complete_run(host, sector, nr_secs, status_of(err));
            self.pool.release(id);
        }
        // Queued writes stay parked until the current transaction
        // finalizes and drains them into a fresh one.
    }

    /// Runs exactly once per transaction, when its last data write and
    /// (for allocating transactions) the zero-bitmap write complete.
    fn finish_data_transaction(&mut self, slot: usize) {
        let e = self.cache.get_mut(slot);
        debug_assert!(!e.tx.closed);
        e.tx.closed = true;
        let has_err = e.tx.error.is_some();

        if e.tx.update_bat {
            if has_err {
                // Allocation abandoned before the BAT write went out;
                // the table entry stays unused and the slot reopens.
                e.tx.update_bat = false;
                self.bat.release();
            } else {
                // Zero-bitmap and data writes have drained: the BAT
                // write (and, below, the bitmap write) go out in
                // parallel.
                self.schedule_bat_write();
            }
        }

        if !has_err && self.kind == VhdType::Diff {
            self.schedule_bitmap_write(slot);
            return;
        }
        self.finish_bitmap_transaction(slot);
    }

    fn schedule_bat_write(&mut self) {
        let (off, ptr) = self.bat.stage_sector();
        debug!(blk = self.bat.pbw_blk, offset = self.bat.pbw_offset, "bat write scheduled");
        self.aio.write(Token::BatWrite, ptr, SECTOR_SIZE as u32, off);
    }

    fn schedule_bitmap_write(&mut self, slot: usize) {
        self.cache.touch(slot);
        let pbw_offset = self.bat.pbw_offset;
        let e = self.cache.get_mut(slot);
        let blk = e.blk.expect("occupied cache entry");
        e.write_pending = true;
        let ptr = e.shadow.io_ptr();
        let len = (self.bm_secs as u32) * SECTOR_SIZE as u32;
        // For a block whose allocation is still committing, the bitmap
        // lives at the reserved offset.
        let off = if self.bat.entry(blk) == crate::format::DD_BLK_UNUSED {
            debug_assert!(self.bat.locked && self.bat.pbw_blk == blk);
            pbw_offset << SECTOR_SHIFT
        } else {
            self.bat.bitmap_offset(blk)
        };
        self.aio.write(Token::BitmapWrite(slot), ptr, len, off);
    }

    fn finish_zero_bm_write(&mut self, err: Option<i32>) {
        let blk = self.bat.pbw_blk;
        let slot = self.cache.find(blk).expect("allocation bitmap cached");
        let e = self.cache.get_mut(slot);
        e.tx.finished += 1;
        e.tx.requests.retain(|r| *r != ReqRef::ZeroBm);

        if let Some(errno) = err {
            warn!(blk, errno, "zero bitmap write failed, abandoning allocation");
            e.tx.fail(errno);
            e.tx.update_bat = false;
            self.bat.release();
        }

        if self.cache.get(slot).tx.completed() {
            self.finish_data_transaction(slot);
        }
    }

    fn finish_bat_write(&mut self, err: Option<i32>) {
        let blk = self.bat.pbw_blk;
        if err.is_none() {
            self.bat.commit(self.spb, self.bm_secs);
            debug!(blk, next_db = self.bat.next_db, "bat entry committed");
        } else {
            warn!(blk, ?err, "bat write failed, entry stays unused");
        }
        let parked = self.bat.parked_tx.take();
        self.bat.release();

        if let Some(slot) = self.cache.find(blk) {
            let e = self.cache.get_mut(slot);
            if let Some(errno) = err {
                e.tx.fail(errno);
            }
            e.tx.update_bat = false;
            // The finalizer may have deferred waiting for this event.
            if parked == Some(slot) {
                self.finish_bitmap_transaction(slot);
            }
        }
    }

    fn finish_bitmap_read(&mut self, slot: usize, err: Option<i32>) {
        let e = self.cache.get_mut(slot);
        e.read_pending = false;
        let waiters: Vec<usize> = e.waiting.drain(..).collect();

        match err {
            None => {
                e.shadow.copy_from_slice(&e.map);
                self.cache.touch(slot);
                // Re-dispatch every waiter; classification succeeds now
                // that the bitmap is cached (it may split their runs).
                for id in waiters {
                    let (op, sector, nr_secs, host) = {
                        let req = self.pool.get(id);
                        (req.op, req.sector, req.nr_secs, req.host)
                    };
                    self.pool.release(id);
                    self.hosts.get_mut(host).outstanding -= 1;

                    let end = sector + nr_secs as u64;
                    let mut sec = sector;
                    while sec < end {
                        let remaining = (end - sec) as u32;
                        let consumed = match op {
                            ReqOp::DataRead => self.route_read(host, sec, remaining),
                            ReqOp::DataWrite => self.route_write(host, sec, remaining),
                        };
                        sec += consumed as u64;
                    }
                }
            }
            Some(errno) => {
                warn!(slot, errno, "bitmap read failed, failing waiters");
                for id in waiters {
                    let (host, sector, nr_secs) = {
                        let req = self.pool.get(id);
                        (req.host, req.sector, req.nr_secs)
                    };
                    self.complete_run(host, sector, nr_secs, IoStatus::Error(errno));
                    self.pool.release(id);
                }
                self.cache.get_mut(slot).clear();
            }
        }
    }

    fn finish_bitmap_write(&mut self, slot: usize, err: Option<i32>) {
        let e = self.cache.get_mut(slot);
        e.write_pending = false;
        match err {
            // Atomic visibility: the new bits only become readable here.
            None => e.map.copy_from_slice(&e.shadow),
            Some(errno) => {
                e.shadow.copy_from_slice(&e.map);
                e.tx.fail(errno);
            }
        }
        self.finish_bitmap_transaction(slot);
    }

    /// Terminal state of a transaction: signal its members, then reopen
    /// the bitmap for the writes queued behind it.
    fn finish_bitmap_transaction(&mut self, slot: usize) {
        {
            let e = self.cache.get(slot);
            if e.tx.update_bat {
                // Still waiting on the BAT write; park and let its
                // finisher re-invoke us.
                self.bat.parked_tx = Some(slot);
                return;
            }
        }

        let e = self.cache.get_mut(slot);
        let err = e.tx.error;
        let blk = e.blk.expect("occupied cache entry");
        let members = std::mem::take(&mut e.tx.requests);
        e.tx.reset();

        for m in members {
            if let ReqRef::Pool(id) = m {
                let (host, sector, nr_secs) = {
                    let req = self.pool.get(id);
                    (req.host, req.sector, req.nr_secs)
                };
                self.complete_run(host, sector, nr_secs, status_of(err));
                self.pool.release(id);
            }
        }

        if err.is_some() && self.kind.is_sparse() && self.bat.entry(blk) == crate::format::DD_BLK_UNUSED
        {
            // The allocation never committed: everything queued behind
            // it lands on an unreachable block. Fail it and drop the
            // entry so a retry re-attempts the allocation cleanly.
            let queued: Vec<usize> = self.cache.get_mut(slot).queue.drain(..).collect();
            for id in queued {
                let (host, sector, nr_secs) = {
                    let req = self.pool.get(id);
                    (req.host, req.sector, req.nr_secs)
                };
                self.complete_run(host, sector, nr_secs, status_of(err));
                self.pool.release(id);
            }
            self.cache.get_mut(slot).clear();
            return;
        }

        if err.is_some() && self.kind == VhdType::Diff {
            // Revert tentative bits so retries observe the pre-tx world;
            // the queued writes re-apply theirs below.
            let e = self.cache.get_mut(slot);
            e.shadow.copy_from_slice(&e.map);
        }

        // Drain the queue into a fresh transaction, preserving completion
        // state and shadow bits for writes that already finished.
        let queued: Vec<usize> = self.cache.get_mut(slot).queue.drain(..).collect();
        for id in queued {
            let (finished, req_err, sector, nr_secs) = {
                let req = self.pool.get_mut(id);
                req.queued = false;
                req.in_tx = true;
                (req.finished, req.error, req.sector, req.nr_secs)
            };
            let e = self.cache.get_mut(slot);
            e.tx.add(ReqRef::Pool(id));
            if finished {
                e.tx.finished += 1;
                match req_err {
                    None if self.kind == VhdType::Diff => {
                        let within = (sector % self.spb as u64) as u32;
                        for i in 0..nr_secs {
                            e.shadow_set(within + i);
                        }
                    }
                    Some(errno) => e.tx.fail(errno),
                    None => {}
                }
            }
        }

        let e = self.cache.get_mut(slot);
        if e.tx.completed() {
            // Every queued write had already finished.
            self.finish_data_transaction(slot);
            return;
        }
        if !e.in_use() {
            e.locked = false;
        }
    }
}
