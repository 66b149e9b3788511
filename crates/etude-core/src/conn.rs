// src/conn.rs
use crate::auth::CredentialVerifier;
use crate::buffer::Buffer;
use crate::error::is_transient;
use crate::http::FormDecoding;
use crate::parser::RequestParser;
use crate::response::{MappedFile, Responder};
use crate::syscalls;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use tracing::{debug, warn};

/// Level-triggered writes keep looping while more than this remains, so a
/// large reply is not flushed one event at a time.
const LT_WRITE_BATCH: usize = 10 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ConnState {
    #[default]
    Free = 0,
    Accepted = 1,
    Reading = 2,
    Processing = 3,
    Writing = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Bytes arrived; the socket is drained for this event.
    Data(usize),
    /// Nothing to read right now.
    WouldBlock,
    /// Peer closed its side.
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Done,
    /// The socket is full; wait for write readiness.
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    /// The request is incomplete (or nothing was buffered).
    NeedMore,
    /// A reply sits in the outbound buffer.
    Reply { status: u16 },
}

/// One accepted client socket with its buffers and parser.
///
/// Owned by the connection table; a worker takes it by value for one
/// processing task and hands it back.
pub struct Connection {
    socket: OwnedFd,
    peer: SocketAddr,
    inbound: Buffer,
    outbound: Buffer,
    parser: RequestParser,
    file: Option<MappedFile>,
    file_offset: usize,
    keep_alive: bool,
    closed: bool,
    edge_triggered: bool,
    requests: u32,
}

impl Connection {
    pub fn new(
        socket: OwnedFd,
        peer: SocketAddr,
        edge_triggered: bool,
        decoding: FormDecoding,
    ) -> Self {
        Self {
            socket,
            peer,
            inbound: Buffer::new(),
            outbound: Buffer::new(),
            parser: RequestParser::new(decoding),
            file: None,
            file_offset: 0,
            keep_alive: false,
            closed: false,
            edge_triggered,
            requests: 0,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn requests_served(&self) -> u32 {
        self.requests
    }

    pub fn has_pending_input(&self) -> bool {
        self.inbound.readable_bytes() > 0
    }

    /// Header block plus whatever is left of the mapped file.
    pub fn bytes_to_write(&self) -> usize {
        let file_left = self
            .file
            .as_ref()
            .map_or(0, |f| f.len() - self.file_offset);
        self.outbound.readable_bytes() + file_left
    }

    /// Mark for closure. The socket itself is released when the
    /// connection is dropped.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.file = None;
            debug!(peer = %self.peer, requests = self.requests, "connection closed");
        }
    }

    /// Pull bytes from the socket. Edge-triggered sockets read until
    /// `WouldBlock`; level-triggered ones do one read. An end-of-stream seen
    /// at any point wins over data read before it.
    pub fn on_read(&mut self) -> io::Result<ReadStatus> {
        let mut total = 0;
        loop {
            match self.inbound.read_fd(self.fd()) {
                Ok(0) => return Ok(ReadStatus::Eof),
                Ok(n) => {
                    total += n;
                    if !self.edge_triggered {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(if total == 0 {
            ReadStatus::WouldBlock
        } else {
            ReadStatus::Data(total)
        })
    }

    /// Drive the parser over buffered input and, once a request is complete,
    /// have `responder` build the reply. A protocol error yields a 400 and
    /// clears keep-alive.
    pub fn process(
        &mut self,
        responder: &dyn Responder,
        verifier: &dyn CredentialVerifier,
    ) -> Processed {
        if !self.has_pending_input() {
            return Processed::NeedMore;
        }

        let reply = match self.parser.parse(&mut self.inbound, verifier) {
            Ok(()) if !self.parser.is_finished() => return Processed::NeedMore,
            Ok(()) => {
                self.keep_alive = self.parser.is_keep_alive();
                responder.respond(self.parser.request(), self.keep_alive, &mut self.outbound)
            }
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "bad request");
                self.keep_alive = false;
                self.inbound.retrieve_all();
                responder.reject(400, &mut self.outbound)
            }
        };

        self.requests += 1;
        self.parser.init();
        self.file = reply.file;
        self.file_offset = 0;
        Processed::Reply {
            status: reply.status,
        }
    }

    /// Flush the header block and file segment with vectored writes.
    pub fn on_write(&mut self) -> io::Result<WriteStatus> {
        loop {
            if self.bytes_to_write() == 0 {
                self.file = None;
                self.file_offset = 0;
                return Ok(WriteStatus::Done);
            }

            let n = {
                let file = self
                    .file
                    .as_ref()
                    .map_or(&[][..], |f| &f.as_slice()[self.file_offset..]);
                match syscalls::writev_nonblocking(self.fd(), &[self.outbound.peek(), file]) {
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) if is_transient(&e) => return Ok(WriteStatus::Pending),
                    Err(e) => return Err(e),
                }
            };
            self.advance(n)?;

            if !self.edge_triggered && self.bytes_to_write() <= LT_WRITE_BATCH {
                if self.bytes_to_write() == 0 {
                    continue;
                }
                return Ok(WriteStatus::Pending);
            }
        }
    }

    fn advance(&mut self, n: usize) -> io::Result<()> {
        let head = self.outbound.readable_bytes();
        if n <= head {
            self.outbound.retrieve(n).map_err(io::Error::other)?;
        } else {
            self.outbound.retrieve_all();
            self.file_offset += n - head;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("fd", &self.fd())
            .field("peer", &self.peer)
            .field("keep_alive", &self.keep_alive)
            .field("closed", &self.closed)
            .field("to_write", &self.bytes_to_write())
            .finish()
    }
}
