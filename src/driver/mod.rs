//! The asynchronous VHD driver: request scheduling, the transactional
//! write path, and the io_uring submit/poll loop.

mod aio;
mod bat;
mod bitmap;
mod finish;
mod request;
mod scheduler;
mod tx;

use std::collections::{HashSet, VecDeque};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::buf::AlignedBuf;
use crate::config::{DriverConfig, OpenFlags};
use crate::error::{Result, VhdError};
use crate::format::{
    self, read_parent_path, DynamicHeader, Footer, VhdType, DD_BLK_UNUSED, HEADER_SIZE,
};
use crate::{SECTOR_SHIFT, SECTOR_SIZE};

use aio::AioContext;
use bat::BatManager;
use bitmap::BitmapCache;
use request::{HostTable, RequestPool};

/// Terminal outcome of one scheduled run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// The run completed successfully.
    Ok,
    /// Read of a sparse hole; the host may redirect to a parent image.
    NotAllocated,
    /// Transient resource exhaustion; retry the range later.
    Busy,
    /// I/O failure, with the negative errno.
    Error(i32),
}

/// Delivered once per run through the completion sink. `buf` carries the
/// caller's buffer back on the final completion of its request.
#[derive(Debug)]
pub struct Completion {
    pub id: u64,
    pub sector: u64,
    pub nr_secs: u32,
    pub status: IoStatus,
    pub buf: Option<AlignedBuf>,
}

/// A request the driver refused outright, handing the buffer back.
#[derive(Debug)]
pub struct Rejected {
    pub error: VhdError,
    pub buf: AlignedBuf,
}

/// Undelivered completion record, resolved against the host table when
/// the sink is drained.
struct Done {
    host: usize,
    sector: u64,
    nr_secs: u32,
    status: IoStatus,
}

/// Driver handle for one open VHD image.
pub struct VhdDriver {
    file: File,
    path: PathBuf,
    footer: Footer,
    header: Option<DynamicHeader>,
    kind: VhdType,
    read_only: bool,
    /// Virtual device size in sectors.
    curr_secs: u64,
    /// Sectors per block (sparse types only).
    spb: u32,
    /// Sectors per block bitmap (sparse types only).
    bm_secs: u32,
    pool: RequestPool,
    hosts: HostTable,
    cache: BitmapCache,
    bat: BatManager,
    aio: AioContext,
    done: VecDeque<Done>,
}

impl VhdDriver {
    pub fn open(path: impl AsRef<Path>, flags: OpenFlags) -> Result<Self> {
        Self::open_with(path, flags, DriverConfig::default())
    }

    pub fn open_with(
        path: impl AsRef<Path>,
        flags: OpenFlags,
        config: DriverConfig,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = open_direct(&path, flags.read_only)?;

        let len = file.metadata()?.len();
        if len < SECTOR_SIZE as u64 || len % SECTOR_SIZE as u64 != 0 {
            return Err(VhdError::Corrupt("file length not sector-aligned"));
        }

        let footer = read_footer_direct(&file, len)?;
        let kind = footer.disk_type;
        let curr_secs = footer.current_size >> SECTOR_SHIFT;

        let (header, spb, bm_secs, bat, cache) = if kind.is_sparse() {
            let header = read_header_direct(&file, footer.data_offset)?;
            let spb = header.block_size / SECTOR_SIZE as u32;
            let bm_secs = spb.div_ceil(8 * SECTOR_SIZE as u32).max(1);
            if (header.max_bat_size as u64) < curr_secs.div_ceil(spb as u64) {
                return Err(VhdError::Corrupt("bat too small for virtual size"));
            }

            let table = read_bat_direct(&file, &header, len)?;
            let next_db = bat::align_next_db((len >> SECTOR_SHIFT) - 1, bm_secs);
            let bat = BatManager::new(table, header.table_offset, next_db);
            let cache =
                BitmapCache::new(config.cache_entries, bm_secs as usize * SECTOR_SIZE);
            (Some(header), spb, bm_secs, bat, cache)
        } else {
            if len < footer.current_size + SECTOR_SIZE as u64 {
                return Err(VhdError::Corrupt("fixed image truncated"));
            }
            (None, 0, 0, BatManager::new(Vec::new(), 0, 0), BitmapCache::new(0, 0))
        };

        let aio = AioContext::new(file.as_raw_fd(), config.ring_depth)?;

        info!(
            path = %path.display(),
            ?kind,
            sectors = curr_secs,
            read_only = flags.read_only,
            "opened vhd image"
        );

        Ok(VhdDriver {
            file,
            path,
            footer,
            header,
            kind,
            read_only: flags.read_only,
            curr_secs,
            spb,
            bm_secs,
            pool: RequestPool::new(config.data_requests),
            hosts: HostTable::new(),
            cache,
            bat,
            aio,
            done: VecDeque::new(),
        })
    }

    /// Virtual device size in sectors.
    pub fn sectors(&self) -> u64 {
        self.curr_secs
    }

    pub fn size_bytes(&self) -> u64 {
        self.footer.current_size
    }

    pub fn sector_size(&self) -> usize {
        SECTOR_SIZE
    }

    pub fn disk_type(&self) -> VhdType {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File descriptor that becomes readable when completions are ready;
    /// call [`VhdDriver::do_callbacks`] when it fires.
    pub fn poll_fd(&self) -> RawFd {
        self.aio.poll_fd()
    }

    /// Decode the parent image path recorded in the locators, or `None`
    /// when the image is not a differencing one.
    pub fn parent_path(&self) -> Result<Option<String>> {
        match (&self.header, self.kind) {
            (Some(hdr), VhdType::Diff) => {
                // Locator data has arbitrary length; use a buffered
                // handle rather than the O_DIRECT data-path fd.
                let plain = File::open(&self.path)?;
                read_parent_path(&plain, hdr)
            }
            _ => Ok(None),
        }
    }

    /// Check that `parent` matches the parent this image was snapshotted
    /// from (recorded UUID and modification time).
    pub fn validate_parent(&self, parent: &Path) -> Result<()> {
        if self.kind != VhdType::Diff {
            return Err(VhdError::NoParent);
        }
        format::validate_parent(&self.path, parent)
    }

    /// Flush the accumulated submission vector to the kernel. Entries the
    /// kernel refuses complete with failures through `sink`.
    pub fn submit(&mut self, sink: &mut dyn FnMut(Completion) -> i32) -> Result<i32> {
        self.aio.submit()?;
        self.pump()?;
        Ok(self.drain_done(sink))
    }

    /// Drain raised completions and run the state machine. Must be called
    /// when [`VhdDriver::poll_fd`] becomes readable.
    pub fn do_callbacks(&mut self, sink: &mut dyn FnMut(Completion) -> i32) -> Result<i32> {
        self.aio.clear_poll_fd();
        self.pump()?;
        Ok(self.drain_done(sink))
    }

    /// Close the image. Only legal once every queued request has been
    /// delivered; rewrites the footer for writable opens.
    pub fn close(self) -> Result<()> {
        if self.aio.inflight() > 0
            || self.aio.has_pending()
            || self.aio.has_synthetic()
            || !self.done.is_empty()
            || self.pool.in_use() > 0
            || !self.hosts.is_empty()
        {
            return Err(VhdError::Busy);
        }

        if !self.read_only {
            let mut buf = AlignedBuf::new(SECTOR_SIZE);
            buf.copy_from_slice(&self.footer.to_bytes());
            if self.kind.is_sparse() {
                // Footer lives past the data region and as a backup at
                // byte 0. The file is deliberately not truncated to
                // next_db: a trailing backup footer written by another
                // tool must survive.
                self.file.write_all_at(&buf, self.bat.next_db << SECTOR_SHIFT)?;
                self.file.write_all_at(&buf, 0)?;
            } else {
                self.file.write_all_at(&buf, self.footer.current_size)?;
            }
            self.file.sync_all()?;
        }
        debug!(path = %self.path.display(), "closed vhd image");
        Ok(())
    }

    /// Run the event loop: reap completions (synthetic ones included),
    /// dispatch finishers, and re-submit anything they enqueued.
    fn pump(&mut self) -> Result<()> {
        let mut events = Vec::new();
        loop {
            self.aio.reap(&mut events);
            if events.is_empty() {
                if self.aio.has_pending() {
                    self.aio.submit()?;
                    continue;
                }
                break;
            }
            for (token, res) in events.drain(..) {
                self.dispatch(token, res);
            }
        }
        Ok(())
    }

    /// Deliver undelivered completions to the caller's sink, returning
    /// the sum of its return values. The host buffer rides along with
    /// the final completion of its request.
    fn drain_done(&mut self, sink: &mut dyn FnMut(Completion) -> i32) -> i32 {
        let mut sum = 0;
        while let Some(d) = self.done.pop_front() {
            let h = self.hosts.get_mut(d.host);
            h.outstanding -= 1;
            let (id, buf) = if h.outstanding == 0 {
                let io = self.hosts.remove(d.host);
                (io.id, Some(io.buf))
            } else {
                (h.id, None)
            };
            sum += sink(Completion {
                id,
                sector: d.sector,
                nr_secs: d.nr_secs,
                status: d.status,
                buf,
            });
        }
        sum
    }

    /// Record one delivered-later completion for a run.
    fn complete_run(&mut self, host: usize, sector: u64, nr_secs: u32, status: IoStatus) {
        self.done.push_back(Done { host, sector, nr_secs, status });
    }
}

fn open_direct(path: &Path, read_only: bool) -> Result<File> {
    let mut opts = OpenOptions::new();
    opts.read(true);
    if !read_only {
        opts.write(true);
    }
    match opts.clone().custom_flags(libc::O_DIRECT).open(path) {
        Ok(f) => Ok(f),
        // Not every filesystem supports direct I/O; fall back to buffered.
        Err(_) => Ok(opts.open(path)?),
    }
}

fn read_footer_direct(file: &File, len: u64) -> Result<Footer> {
    let mut buf = AlignedBuf::new(SECTOR_SIZE);
    file.read_exact_at(&mut buf, len - SECTOR_SIZE as u64)?;
    let raw: &[u8; SECTOR_SIZE] = (&buf[..]).try_into().unwrap();
    match Footer::parse(raw) {
        Ok(f) => Ok(f),
        Err(primary) => {
            // Sparse images keep a backup copy at byte 0.
            file.read_exact_at(&mut buf, 0)?;
            let raw: &[u8; SECTOR_SIZE] = (&buf[..]).try_into().unwrap();
            Footer::parse(raw).map_err(|_| primary)
        }
    }
}

fn read_header_direct(file: &File, data_offset: u64) -> Result<DynamicHeader> {
    if data_offset == u64::MAX || data_offset % SECTOR_SIZE as u64 != 0 {
        return Err(VhdError::Corrupt("dynamic header offset invalid"));
    }
    let mut buf = AlignedBuf::new(HEADER_SIZE);
    file.read_exact_at(&mut buf, data_offset)?;
    let raw: &[u8; HEADER_SIZE] = (&buf[..]).try_into().unwrap();
    DynamicHeader::parse(raw)
}

fn read_bat_direct(file: &File, header: &DynamicHeader, len: u64) -> Result<Vec<u32>> {
    let bat_bytes = header.bat_sectors() as usize * SECTOR_SIZE;
    let mut buf = AlignedBuf::new(bat_bytes);
    file.read_exact_at(&mut buf, header.table_offset)?;

    let entries = header.max_bat_size as usize;
    let min_db = (header.table_offset >> SECTOR_SHIFT) + header.bat_sectors();
    let file_secs = len >> SECTOR_SHIFT;

    let mut table = Vec::with_capacity(entries);
    let mut seen = HashSet::new();
    for chunk in buf.chunks_exact(4).take(entries) {
        let entry = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        if entry != DD_BLK_UNUSED {
            if (entry as u64) < min_db || entry as u64 >= file_secs {
                return Err(VhdError::Corrupt("bat entry out of range"));
            }
            if !seen.insert(entry) {
                return Err(VhdError::Corrupt("duplicate bat entry"));
            }
        }
        table.push(entry);
    }
    Ok(table)
}
