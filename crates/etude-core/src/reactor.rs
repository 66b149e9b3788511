// src/reactor.rs
use crate::auth::CredentialVerifier;
use crate::config::{Config, Dispatch};
use crate::conn::{ConnState, Connection, Processed, ReadStatus, WriteStatus};
use crate::error::EtudeResult;
use crate::http::FormDecoding;
use crate::metrics::ServerMetrics;
use crate::pool::WorkerPool;
use crate::response::Responder;
use crate::slab::ConnTable;
use crate::syscalls::{
    self, EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP, Epoll,
    EventFd, epoll_event,
};
use crate::timer::TimerHeap;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const LISTEN_TOKEN: u64 = u64::MAX;
pub const WAKE_TOKEN: u64 = u64::MAX - 1;
const MAX_EVENTS: usize = 1024;
const BUSY_REPLY: &[u8] = b"Server busy!";

/// Stops a running reactor from any thread.
#[derive(Clone)]
pub struct ReactorHandle {
    shutdown: Arc<AtomicBool>,
    waker: Arc<EventFd>,
}

impl ReactorHandle {
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Err(e) = self.waker.notify() {
            error!(error = %e, "failed to wake reactor");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

struct Completion {
    token: u64,
    /// `None` if the task panicked; the connection was dropped with it.
    conn: Option<Box<Connection>>,
    outcome: Processed,
}

/// Sends the connection back to the reactor when a task ends, including by
/// unwinding.
struct CompletionGuard {
    token: u64,
    conn: Option<Box<Connection>>,
    outcome: Processed,
    tx: Sender<Completion>,
    waker: Arc<EventFd>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        let conn = if std::thread::panicking() {
            None
        } else {
            self.conn.take()
        };
        let sent = self.tx.send(Completion {
            token: self.token,
            conn,
            outcome: self.outcome,
        });
        if sent.is_ok() {
            let _ = self.waker.notify();
        }
    }
}

/// Single-threaded event loop over one listening socket.
///
/// Owns epoll, the connection table and the idle timer; none of them leave
/// this thread. Client sockets are armed one-shot, so a connection produces
/// no further events until the reactor re-arms it, which is what keeps at
/// most one task per connection in flight.
pub struct Reactor {
    epoll: Epoll,
    listener: OwnedFd,
    waker: Arc<EventFd>,
    shutdown: Arc<AtomicBool>,
    table: ConnTable,
    timer: TimerHeap,
    expired: Arc<Mutex<Vec<u64>>>,
    pool: Option<WorkerPool>,
    completions_tx: Sender<Completion>,
    completions_rx: Receiver<Completion>,
    responder: Arc<dyn Responder>,
    verifier: Arc<dyn CredentialVerifier>,
    metrics: Arc<ServerMetrics>,
    listen_edge: bool,
    conn_edge: bool,
    conn_flags: i32,
    idle_timeout: Option<Duration>,
    decoding: FormDecoding,
}

impl Reactor {
    pub fn new(
        listener: OwnedFd,
        cfg: &Config,
        responder: Arc<dyn Responder>,
        verifier: Arc<dyn CredentialVerifier>,
    ) -> EtudeResult<Self> {
        let epoll = Epoll::new()?;
        let waker = Arc::new(EventFd::new()?);

        let listen_edge = cfg.listen_edge_triggered();
        let conn_edge = cfg.conn_edge_triggered();
        let mut listen_flags = EPOLLIN | EPOLLRDHUP;
        let mut conn_flags = EPOLLONESHOT | EPOLLRDHUP;
        if listen_edge {
            listen_flags |= EPOLLET;
        }
        if conn_edge {
            conn_flags |= EPOLLET;
        }

        epoll.add(listener.as_raw_fd(), LISTEN_TOKEN, listen_flags)?;
        epoll.add(waker.raw_fd(), WAKE_TOKEN, EPOLLIN)?;

        let pool = match cfg.dispatch {
            Dispatch::Pool => Some(WorkerPool::new(cfg.workers)?),
            Dispatch::Inline => None,
        };
        let (completions_tx, completions_rx) = mpsc::channel();

        Ok(Self {
            epoll,
            listener,
            waker,
            shutdown: Arc::new(AtomicBool::new(false)),
            table: ConnTable::new(cfg.max_connections),
            timer: TimerHeap::new(),
            expired: Arc::new(Mutex::new(Vec::new())),
            pool,
            completions_tx,
            completions_rx,
            responder,
            verifier,
            metrics: Arc::new(ServerMetrics::new()),
            listen_edge,
            conn_edge,
            conn_flags,
            idle_timeout: cfg.idle_timeout(),
            decoding: cfg.form_decoding,
        })
    }

    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            shutdown: self.shutdown.clone(),
            waker: self.waker.clone(),
        }
    }

    pub fn metrics(&self) -> Arc<ServerMetrics> {
        self.metrics.clone()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        syscalls::local_addr(self.listener.as_raw_fd())
    }

    pub fn connections(&self) -> usize {
        self.table.len()
    }

    /// Run until [`ReactorHandle::shutdown`] is called.
    pub fn run(&mut self) -> io::Result<()> {
        info!(
            listen_et = self.listen_edge,
            conn_et = self.conn_edge,
            pooled = self.pool.is_some(),
            "reactor running"
        );
        let mut events = vec![epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        while !self.shutdown.load(Ordering::Acquire) {
            // fires whatever is due and bounds the wait by the next deadline
            let timeout = wait_timeout(self.timer.next_tick());
            self.reap_expired();

            let n = match self.epoll.wait(&mut events, timeout) {
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, "epoll_wait failed");
                    self.close_all();
                    return Err(e);
                }
            };

            for i in 0..n {
                let token = events[i].u64;
                let flags = events[i].events;
                match token {
                    LISTEN_TOKEN => self.deal_listen(),
                    WAKE_TOKEN => {
                        if let Err(e) = self.waker.drain() {
                            warn!(error = %e, "failed to drain waker");
                        }
                        self.drain_completions();
                    }
                    _ => self.deal_client(token, flags),
                }
            }

            self.timer.do_work();
            self.reap_expired();
        }

        self.close_all();
        info!("reactor stopped");
        Ok(())
    }

    fn deal_listen(&mut self) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        loop {
            match syscalls::accept_connection(self.listener.as_raw_fd()) {
                Ok(Some((socket, peer))) => self.add_client(socket, peer),
                Ok(None) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
            if !self.listen_edge {
                break;
            }
        }
    }

    fn add_client(&mut self, socket: OwnedFd, peer: SocketAddr) {
        if self.table.is_full() {
            self.reject_busy(socket.as_raw_fd(), peer);
            return;
        }
        let conn = Box::new(Connection::new(socket, peer, self.conn_edge, self.decoding));
        let fd = conn.fd();
        let token = match self.table.allocate(conn) {
            Ok(token) => token,
            Err(conn) => {
                self.reject_busy(conn.fd(), peer);
                return;
            }
        };
        self.metrics.inc_conn();

        if let Some(ttl) = self.idle_timeout {
            let expired = self.expired.clone();
            self.timer.add(token as usize, ttl, move || {
                expired
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(token);
            });
        }

        if let Err(e) = self.epoll.add(fd, token, EPOLLIN | self.conn_flags) {
            warn!(%peer, error = %e, "failed to register client");
            self.close(token);
            return;
        }
        if let Some(slot) = self.table.get_mut(token) {
            slot.state = ConnState::Reading;
        }
        debug!(%peer, token, active = self.table.len(), "client connected");
    }

    fn reject_busy(&self, fd: RawFd, peer: SocketAddr) {
        let _ = syscalls::send_nosignal(fd, BUSY_REPLY);
        self.metrics.inc_rejected();
        warn!(%peer, capacity = self.table.capacity(), "server busy, connection refused");
    }

    fn deal_client(&mut self, token: u64, flags: u32) {
        let Some(slot) = self.table.get(token) else {
            return;
        };
        if slot.conn.is_none() {
            return;
        }

        let flags = flags as i32;
        if flags & (EPOLLRDHUP | EPOLLHUP | EPOLLERR) != 0 {
            self.close(token);
        } else if flags & EPOLLIN != 0 {
            self.deal_read(token);
        } else if flags & EPOLLOUT != 0 {
            self.deal_write(token);
        } else {
            warn!(token, flags, "unexpected event");
        }
    }

    fn extend_time(&mut self, token: u64) {
        if let Some(ttl) = self.idle_timeout {
            self.timer.adjust(token as usize, ttl);
        }
    }

    fn deal_read(&mut self, token: u64) {
        self.extend_time(token);
        let Some(conn) = self.table.get_mut(token).and_then(|s| s.conn.as_mut()) else {
            return;
        };
        match conn.on_read() {
            Ok(ReadStatus::Data(_)) => self.dispatch(token),
            Ok(ReadStatus::WouldBlock) => self.rearm(token, EPOLLIN),
            Ok(ReadStatus::Eof) => self.close(token),
            Err(e) => {
                debug!(token, error = %e, "read failed");
                self.close(token);
            }
        }
    }

    /// Hand the connection to the pool, or process it right here in inline
    /// mode.
    fn dispatch(&mut self, token: u64) {
        let Some(pool) = &self.pool else {
            let Some(slot) = self.table.get_mut(token) else {
                return;
            };
            let Some(conn) = slot.conn.as_mut() else {
                return;
            };
            slot.state = ConnState::Processing;
            let outcome = conn.process(&*self.responder, &*self.verifier);
            self.on_processed(token, outcome);
            return;
        };

        let Some(conn) = self.table.take(token) else {
            return;
        };
        let guard = CompletionGuard {
            token,
            conn: Some(conn),
            outcome: Processed::NeedMore,
            tx: self.completions_tx.clone(),
            waker: self.waker.clone(),
        };
        let responder = self.responder.clone();
        let verifier = self.verifier.clone();

        let queued = pool.execute(move || {
            let mut guard = guard;
            if let Some(conn) = guard.conn.as_mut() {
                guard.outcome = conn.process(&*responder, &*verifier);
            }
        });
        if !queued {
            // the dropped task still reports back, after the slot is gone
            self.close(token);
        }
    }

    fn drain_completions(&mut self) {
        while let Ok(done) = self.completions_rx.try_recv() {
            let Some(conn) = done.conn else {
                warn!(token = done.token, "processing task failed");
                self.close(done.token);
                continue;
            };
            if self.table.restore(done.token, conn).is_err() {
                continue;
            }
            let close_pending = self
                .table
                .get(done.token)
                .is_some_and(|slot| slot.close_pending);
            if close_pending {
                debug!(token = done.token, "closing connection that expired in flight");
                self.metrics.inc_evicted();
                self.close(done.token);
            } else {
                self.on_processed(done.token, done.outcome);
            }
        }
    }

    fn on_processed(&mut self, token: u64, outcome: Processed) {
        match outcome {
            Processed::NeedMore => {
                self.set_state(token, ConnState::Reading);
                self.rearm(token, EPOLLIN);
            }
            Processed::Reply { status } => {
                self.metrics.inc_req();
                debug!(token, status, "reply ready");
                self.set_state(token, ConnState::Writing);
                self.rearm(token, EPOLLOUT);
            }
        }
    }

    fn deal_write(&mut self, token: u64) {
        self.extend_time(token);
        let Some(conn) = self.table.get_mut(token).and_then(|s| s.conn.as_mut()) else {
            return;
        };
        let before = conn.bytes_to_write();
        let result = conn.on_write();
        self.metrics.add_bytes(before - conn.bytes_to_write());

        match result {
            Ok(WriteStatus::Done) if conn.keep_alive() => {
                let leftover = conn.has_pending_input();
                self.set_state(token, ConnState::Reading);
                if leftover {
                    self.dispatch(token);
                } else {
                    self.rearm(token, EPOLLIN);
                }
            }
            Ok(WriteStatus::Done) => self.close(token),
            Ok(WriteStatus::Pending) => self.rearm(token, EPOLLOUT),
            Err(e) => {
                debug!(token, error = %e, "write failed");
                self.close(token);
            }
        }
    }

    fn set_state(&mut self, token: u64, state: ConnState) {
        if let Some(slot) = self.table.get_mut(token) {
            slot.state = state;
        }
    }

    fn rearm(&mut self, token: u64, interest: i32) {
        let Some(fd) = self
            .table
            .get(token)
            .and_then(|s| s.conn.as_ref())
            .map(|c| c.fd())
        else {
            return;
        };
        if let Err(e) = self.epoll.modify(fd, token, interest | self.conn_flags) {
            warn!(token, error = %e, "failed to re-arm client");
            self.close(token);
        }
    }

    /// Evict connections whose idle timer fired. A connection out in a
    /// worker is only flagged; it closes when its task returns.
    fn reap_expired(&mut self) {
        let tokens = std::mem::take(
            &mut *self
                .expired
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for token in tokens {
            let Some(slot) = self.table.get_mut(token) else {
                continue;
            };
            if slot.conn.is_none() {
                slot.close_pending = true;
                continue;
            }
            debug!(token, "idle timeout");
            self.metrics.inc_evicted();
            self.close(token);
        }
    }

    /// Remove the timer entry, epoll registration and table slot for
    /// `token`. The socket closes when the connection drops.
    fn close(&mut self, token: u64) {
        if self.table.get(token).is_none() {
            return;
        }
        self.timer.remove(token as usize);
        if let Some(mut conn) = self.table.free(token) {
            if let Err(e) = self.epoll.delete(conn.fd()) {
                debug!(token, error = %e, "epoll delete failed");
            }
            conn.close();
        }
        self.metrics.dec_conn();

        let m = self.metrics.snapshot();
        debug!(
            active = m.active_conns,
            requests = m.req_count,
            bytes_sent = m.bytes_sent,
            "connection released"
        );
    }

    fn close_all(&mut self) {
        if let Some(mut pool) = self.pool.take() {
            pool.shutdown();
        }
        // tasks that finished during shutdown; their connections drop here
        while self.completions_rx.try_recv().is_ok() {}

        for token in self.table.tokens() {
            self.close(token);
        }
        self.timer.clear();
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        if !self.table.is_empty() || self.pool.is_some() {
            self.close_all();
        }
    }
}

/// epoll timeout in milliseconds, rounded up so we never wake before the
/// deadline. `-1` blocks indefinitely.
fn wait_timeout(next: Option<Duration>) -> i32 {
    match next {
        Some(d) => d.as_micros().div_ceil(1000).min(i32::MAX as u128) as i32,
        None => -1,
    }
}
