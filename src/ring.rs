//! Fixed-capacity byte ring buffers for per-endpoint queues.
//!
//! Every endpoint queue in the controller is one of these rings. The ring
//! tracks a running count of unread newline bytes so line-readiness checks
//! are O(1), and its fd-facing paths issue at most one system call per
//! invocation so they compose with a readiness-driven loop: partial I/O is
//! handled by returning to the loop, never by looping internally.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};

/// Ring capacity in bytes. Must be a power of two: index wrapping uses
/// bit-masking.
pub const CAPACITY: usize = 1024;

const MASK: usize = CAPACITY - 1;

// Non-power-of-two capacity would make the masked wrap silently corrupt data.
const _: () = assert!(CAPACITY.is_power_of_two());

/// Outcome of a single OS read into the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    /// Bytes were received into the ring.
    Received(usize),
    /// The fd reported end-of-file (peer disconnect).
    Eof,
    /// The ring has no free space; no read was issued.
    Full,
}

/// Fixed-capacity byte queue with head/tail indices and a running count of
/// unread `\n` bytes.
///
/// One byte of capacity is sacrificed so that a full ring and an empty ring
/// are distinguishable: `readable() + writable() == CAPACITY - 1` always
/// holds.
pub struct RingBuffer {
    head: usize,
    tail: usize,
    newlines: usize,
    data: [u8; CAPACITY],
}

impl RingBuffer {
    pub fn new() -> Self {
        Self {
            head: 0,
            tail: 0,
            newlines: 0,
            data: [0; CAPACITY],
        }
    }

    /// Bytes currently readable.
    pub fn readable(&self) -> usize {
        self.head.wrapping_sub(self.tail) & MASK
    }

    /// Bytes acceptable without overwriting unread data.
    pub fn writable(&self) -> usize {
        self.tail.wrapping_sub(1).wrapping_sub(self.head) & MASK
    }

    /// Count of complete (newline-terminated) lines waiting in the ring.
    pub fn newlines(&self) -> usize {
        self.newlines
    }

    /// Discard all buffered bytes.
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.newlines = 0;
    }

    /// Copy up to `min(bytes.len(), writable())` bytes into the ring,
    /// counting newlines as they are copied. Returns the number of bytes
    /// accepted; the excess is silently not accepted.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.writable());
        for &b in &bytes[..n] {
            self.data[self.head] = b;
            self.head = (self.head + 1) & MASK;
            if b == b'\n' {
                self.newlines += 1;
            }
        }
        n
    }

    /// Copy up to `dst.len()` bytes out of the ring, advancing the tail and
    /// uncounting consumed newlines. Returns the number of bytes copied.
    pub fn read_bytes(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.readable());
        for slot in dst[..n].iter_mut() {
            *slot = self.data[self.tail];
            self.tail = (self.tail + 1) & MASK;
            if *slot == b'\n' {
                self.newlines -= 1;
            }
        }
        n
    }

    /// Copy one complete line, including its terminating `\n`, advancing the
    /// tail past it. Returns 0 without mutating the ring when no complete
    /// line is buffered.
    ///
    /// Callers are expected to pass a `dst` of at least [`CAPACITY`] bytes.
    /// If `dst` fills before the newline is reached, the copied prefix is
    /// consumed and returned without its terminator; the rest of the line
    /// remains in the ring.
    pub fn read_line(&mut self, dst: &mut [u8]) -> usize {
        if self.newlines == 0 {
            return 0;
        }
        let limit = dst.len().min(self.readable());
        let mut t = self.tail;
        for i in 0..limit {
            let b = self.data[t];
            t = (t + 1) & MASK;
            dst[i] = b;
            if b == b'\n' {
                self.tail = t;
                self.newlines -= 1;
                return i + 1;
            }
        }
        self.tail = t;
        limit
    }

    /// Perform at most one OS read into the unused contiguous region
    /// starting at the head. Does not loop on short reads; the caller
    /// returns to the readiness loop instead. The newline count is
    /// re-established by rescanning the readable region afterwards.
    pub fn ingest_from_fd(&mut self, fd: BorrowedFd<'_>) -> io::Result<Ingest> {
        let contig = self.writable().min(CAPACITY - self.head);
        if contig == 0 {
            return Ok(Ingest::Full);
        }
        let n = unsafe {
            libc::read(
                fd.as_raw_fd(),
                self.data[self.head..].as_mut_ptr().cast(),
                contig,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        if n == 0 {
            return Ok(Ingest::Eof);
        }
        self.head = (self.head + n as usize) & MASK;
        self.rescan();
        Ok(Ingest::Received(n as usize))
    }

    /// Perform at most one OS write of the contiguous region starting at the
    /// tail, advancing the tail by however many bytes the OS accepted.
    /// Returns the number of bytes drained; does not loop on short writes.
    pub fn drain_to_fd(&mut self, fd: BorrowedFd<'_>) -> io::Result<usize> {
        let contig = self.readable().min(CAPACITY - self.tail);
        if contig == 0 {
            return Ok(0);
        }
        let n = unsafe {
            libc::write(
                fd.as_raw_fd(),
                self.data[self.tail..].as_ptr().cast(),
                contig,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        for i in 0..n {
            if self.data[self.tail + i] == b'\n' {
                self.newlines -= 1;
            }
        }
        self.tail = (self.tail + n) & MASK;
        Ok(n)
    }

    fn rescan(&mut self) {
        self.newlines = 0;
        let mut i = self.tail;
        while i != self.head {
            if self.data[i] == b'\n' {
                self.newlines += 1;
            }
            i = (i + 1) & MASK;
        }
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new()
    }
}
