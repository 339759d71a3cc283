use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use io_uring::{opcode, squeue, types, IoUring};
use tracing::warn;

use crate::error::Result;

/// Completion token carried through `user_data`: which finisher handles
/// the event, and the descriptor it refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Token {
    Data(usize),
    BitmapRead(usize),
    BitmapWrite(usize),
    ZeroBm,
    BatWrite,
}

const KIND_DATA: u64 = 0;
const KIND_BM_READ: u64 = 1;
const KIND_BM_WRITE: u64 = 2;
const KIND_ZERO_BM: u64 = 3;
const KIND_BAT: u64 = 4;

impl Token {
    fn encode(self) -> u64 {
        match self {
            Token::Data(i) => (KIND_DATA << 56) | i as u64,
            Token::BitmapRead(i) => (KIND_BM_READ << 56) | i as u64,
            Token::BitmapWrite(i) => (KIND_BM_WRITE << 56) | i as u64,
            Token::ZeroBm => KIND_ZERO_BM << 56,
            Token::BatWrite => KIND_BAT << 56,
        }
    }

    fn decode(v: u64) -> Token {
        let idx = (v & 0x00ff_ffff_ffff_ffff) as usize;
        match v >> 56 {
            KIND_DATA => Token::Data(idx),
            KIND_BM_READ => Token::BitmapRead(idx),
            KIND_BM_WRITE => Token::BitmapWrite(idx),
            KIND_ZERO_BM => Token::ZeroBm,
            _ => Token::BatWrite,
        }
    }
}

/// One raised completion: the originating token and the raw io_uring
/// result (negative errno, or bytes transferred).
pub(crate) type Event = (Token, i32);

/// Batched submit / non-blocking poll wrapper around one io_uring.
///
/// The scheduler accumulates entries in a submission vector; `submit`
/// pushes the batch to the kernel. Entries the kernel refuses are
/// synthesized into failure events and drained through the same
/// finishers as real completions.
pub(crate) struct AioContext {
    ring: IoUring,
    fd: RawFd,
    eventfd: OwnedFd,
    pending: Vec<(u64, squeue::Entry)>,
    depth: usize,
    inflight: usize,
    synthetic: VecDeque<Event>,
}

impl AioContext {
    pub fn new(fd: RawFd, depth: u32) -> Result<Self> {
        let ring = IoUring::new(depth)?;

        let efd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if efd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let eventfd = unsafe { OwnedFd::from_raw_fd(efd) };
        ring.submitter().register_eventfd(eventfd.as_raw_fd())?;

        Ok(AioContext {
            ring,
            fd,
            eventfd,
            pending: Vec::with_capacity(depth as usize),
            depth: depth as usize,
            inflight: 0,
            synthetic: VecDeque::new(),
        })
    }

    /// Readable whenever completions are waiting to be reaped.
    pub fn poll_fd(&self) -> RawFd {
        self.eventfd.as_raw_fd()
    }

    pub fn inflight(&self) -> usize {
        self.inflight
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn has_synthetic(&self) -> bool {
        !self.synthetic.is_empty()
    }

    /// Queue a read. `offset` is a byte offset; the buffer must stay
    /// valid until the matching event is reaped.
    pub fn read(&mut self, token: Token, buf: *mut u8, len: u32, offset: u64) {
        let entry = opcode::Read::new(types::Fd(self.fd), buf, len)
            .offset(offset)
            .build();
        self.push(token, entry);
    }

    pub fn write(&mut self, token: Token, buf: *const u8, len: u32, offset: u64) {
        let entry = opcode::Write::new(types::Fd(self.fd), buf, len)
            .offset(offset)
            .build();
        self.push(token, entry);
    }

    fn push(&mut self, token: Token, entry: squeue::Entry) {
        // The submission vector must be flushed before it can overflow.
        if self.pending.len() >= self.depth {
            if let Err(e) = self.submit() {
                warn!(error = %e, "flush of full submission vector failed");
            }
        }
        let user_data = token.encode();
        self.pending.push((user_data, entry.user_data(user_data)));
    }

    /// Flush the submission vector. Entries the kernel queue refuses even
    /// after a drain become synthetic failure events routed through the
    /// ordinary finishers.
    pub fn submit(&mut self) -> Result<()> {
        let mut first_err: Option<io::Error> = None;
        for (user_data, entry) in self.pending.drain(..) {
            let mut pushed = unsafe { self.ring.submission().push(&entry).is_ok() };
            if !pushed {
                // Kernel queue full: flush it and retry once.
                if let Err(e) = self.ring.submit() {
                    first_err.get_or_insert(e);
                }
                pushed = unsafe { self.ring.submission().push(&entry).is_ok() };
            }
            if pushed {
                self.inflight += 1;
            } else {
                warn!(user_data, "submission refused, synthesizing failure");
                self.synthetic
                    .push_back((Token::decode(user_data), -libc::EIO));
            }
        }
        if !self.ring.submission().is_empty() {
            if let Err(e) = self.ring.submit() {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Non-blocking drain of raised completions, synthetic ones included.
    pub fn reap(&mut self, events: &mut Vec<Event>) {
        while let Some(ev) = self.synthetic.pop_front() {
            events.push(ev);
        }
        let mut reaped = 0;
        for cqe in self.ring.completion() {
            reaped += 1;
            events.push((Token::decode(cqe.user_data()), cqe.result()));
        }
        self.inflight -= reaped;
    }

    /// Clear the eventfd after the poll fd fired.
    pub fn clear_poll_fd(&self) {
        let mut buf = [0u8; 8];
        unsafe {
            libc::read(self.eventfd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len());
        }
    }
}
