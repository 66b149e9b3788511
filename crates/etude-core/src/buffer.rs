// src/buffer.rs
use crate::syscalls;
use std::io;
use std::os::fd::RawFd;
use thiserror::Error;

pub const INITIAL_CAPACITY: usize = 1024;

/// Stack scratch used by `read_fd` when the writable tail is too small.
const SCRATCH_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("cannot retrieve {requested} bytes, only {readable} readable")]
    Range { requested: usize, readable: usize },
}

/// Growable byte store with separate read and write cursors.
///
/// ```text
/// +-------------------+------------------+------------------+
/// | prependable bytes |  readable bytes  |  writable bytes  |
/// +-------------------+------------------+------------------+
/// 0      <=      read_pos     <=     write_pos    <=     len
/// ```
#[derive(Debug, Clone)]
pub struct Buffer {
    storage: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            storage: vec![0; capacity],
            read_pos: 0,
            write_pos: 0,
        }
    }

    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.write_pos - self.read_pos
    }

    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.storage.len() - self.write_pos
    }

    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.read_pos
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// The unread region, without copying.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.storage[self.read_pos..self.write_pos]
    }

    /// Advance the read cursor by `n`. Draining the buffer completely
    /// rewinds both cursors to the front.
    pub fn retrieve(&mut self, n: usize) -> Result<(), BufferError> {
        let readable = self.readable_bytes();
        if n > readable {
            return Err(BufferError::Range {
                requested: n,
                readable,
            });
        }
        self.read_pos += n;
        if self.read_pos == self.write_pos {
            self.read_pos = 0;
            self.write_pos = 0;
        }
        Ok(())
    }

    /// Discard everything and zero the backing store.
    pub fn retrieve_all(&mut self) {
        self.storage.fill(0);
        self.read_pos = 0;
        self.write_pos = 0;
    }

    pub fn retrieve_all_as_string(&mut self) -> String {
        let s = String::from_utf8_lossy(self.peek()).into_owned();
        self.retrieve_all();
        s
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.storage[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.write_pos += data.len();
    }

    /// Make room for `n` more bytes.
    ///
    /// Grows the store to `write_pos + n + 1` when the free space on both
    /// sides is insufficient; otherwise slides the readable region to offset
    /// 0 so that `read_pos == 0` afterwards.
    pub fn ensure_writable(&mut self, n: usize) {
        if self.writable_bytes() + self.prependable_bytes() < n {
            self.storage.resize(self.write_pos + n + 1, 0);
        } else if self.read_pos > 0 {
            let readable = self.readable_bytes();
            self.storage.copy_within(self.read_pos..self.write_pos, 0);
            self.read_pos = 0;
            self.write_pos = readable;
        }
        debug_assert!(self.writable_bytes() >= n);
    }

    /// Scatter-read from `fd` into the writable tail, spilling into a 64 KiB
    /// stack scratch so one syscall drains whatever the socket holds.
    ///
    /// Returns the byte count from the OS; `Ok(0)` is end-of-stream. On error
    /// the buffer is left untouched.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut scratch = [0u8; SCRATCH_SIZE];
        let writable = self.writable_bytes();
        let n = {
            let tail = &mut self.storage[self.write_pos..];
            syscalls::readv_nonblocking(fd, &mut [tail, &mut scratch[..]])?
        };
        if n <= writable {
            self.write_pos += n;
        } else {
            self.write_pos = self.storage.len();
            self.append(&scratch[..n - writable]);
        }
        Ok(n)
    }

    /// Write the readable region to `fd`. Short writes advance the read
    /// cursor only by what the kernel accepted.
    pub fn write_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let n = syscalls::write_nonblocking(fd, self.peek())?;
        self.read_pos += n;
        if self.read_pos == self.write_pos {
            self.read_pos = 0;
            self.write_pos = 0;
        }
        Ok(n)
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl io::Write for Buffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.append(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
