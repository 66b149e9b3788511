// src/syscalls.rs
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr::{self, NonNull};

pub use libc::{
    EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP, epoll_event,
};

#[inline]
fn cvt(res: c_int) -> io::Result<c_int> {
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res)
    }
}

#[inline]
fn cvt_size(res: libc::ssize_t) -> io::Result<usize> {
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

// ---- Socket Operations ----

fn set_flag(fd: RawFd, level: c_int, name: c_int, value: c_int) -> io::Result<()> {
    unsafe {
        cvt(libc::setsockopt(
            fd,
            level,
            name,
            &value as *const _ as *const c_void,
            mem::size_of_val(&value) as socklen_t,
        ))?;
    }
    Ok(())
}

/// Create a non-blocking listening TCP socket bound to `addr`.
///
/// `SO_REUSEADDR` is always set; `linger` turns on `SO_LINGER` with a one
/// second grace so a close waits for unsent data.
pub fn create_listen_socket(addr: SocketAddr, linger: bool) -> io::Result<OwnedFd> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    let fd = unsafe {
        let raw = cvt(libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        ))?;
        OwnedFd::from_raw_fd(raw)
    };

    if linger {
        let opt = libc::linger {
            l_onoff: 1,
            l_linger: 1,
        };
        unsafe {
            cvt(libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_LINGER,
                &opt as *const _ as *const c_void,
                mem::size_of_val(&opt) as socklen_t,
            ))?;
        }
    }
    set_flag(fd.as_raw_fd(), libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;

    let (storage, len) = socket_addr_to_raw(&addr);
    unsafe {
        cvt(libc::bind(
            fd.as_raw_fd(),
            &storage as *const _ as *const libc::sockaddr,
            len,
        ))?;
        cvt(libc::listen(fd.as_raw_fd(), libc::SOMAXCONN))?;
    }

    Ok(fd)
}

/// Address the socket is actually bound to (resolves port 0).
pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
    unsafe {
        cvt(libc::getsockname(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        ))?;
    }
    raw_to_socket_addr(&storage)
}

/// Accept one pending connection. `Ok(None)` when the backlog is empty.
pub fn accept_connection(listen_fd: RawFd) -> io::Result<Option<(OwnedFd, SocketAddr)>> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;

    let res = unsafe {
        libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    if res < 0 {
        let err = io::Error::last_os_error();
        return match err.kind() {
            io::ErrorKind::WouldBlock => Ok(None),
            _ => Err(err),
        };
    }

    let fd = unsafe { OwnedFd::from_raw_fd(res) };
    let peer = raw_to_socket_addr(&storage)?;
    Ok(Some((fd, peer)))
}

fn socket_addr_to_raw(addr: &SocketAddr) -> (libc::sockaddr_storage, socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe { ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin) };
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
            };
            unsafe { ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6) };
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as socklen_t)
}

fn raw_to_socket_addr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported address family {}", family),
        )),
    }
}

// ---- Epoll Operations ----

pub struct Epoll {
    fd: c_int,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { cvt(libc::epoll_create1(libc::EPOLL_CLOEXEC))? };
        Ok(Self { fd })
    }

    /// Register `fd`. `interests` carries the trigger flags too; nothing is
    /// implied here so the caller picks edge or level mode per socket.
    pub fn add(&self, fd: RawFd, token: u64, interests: i32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interests)
    }

    pub fn modify(&self, fd: RawFd, token: u64, interests: i32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interests)
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn ctl(&self, op: c_int, fd: RawFd, token: u64, interests: i32) -> io::Result<()> {
        let mut event = epoll_event {
            events: interests as u32,
            u64: token,
        };
        unsafe {
            cvt(libc::epoll_ctl(self.fd, op, fd, &mut event))?;
        }
        Ok(())
    }

    /// Block for at most `timeout_ms` (-1 waits forever). EINTR reports zero
    /// events instead of an error.
    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> io::Result<usize> {
        let res = unsafe {
            libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            )
        };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(res as usize)
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

// ---- Wakeup ----

/// Non-blocking eventfd used to interrupt `epoll_wait` from other threads.
pub struct EventFd {
    fd: c_int,
}

impl EventFd {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { cvt(libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC))? };
        Ok(Self { fd })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    pub fn notify(&self) -> io::Result<()> {
        let one: u64 = 1;
        let res = unsafe { libc::write(self.fd, &one as *const u64 as *const c_void, 8) };
        match cvt_size(res) {
            Ok(_) => Ok(()),
            // counter saturated; a wakeup is already pending
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Reset the counter so level-triggered registrations go quiet.
    pub fn drain(&self) -> io::Result<u64> {
        let mut value: u64 = 0;
        let res = unsafe { libc::read(self.fd, &mut value as *mut u64 as *mut c_void, 8) };
        match cvt_size(res) {
            Ok(_) => Ok(value),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

// ---- Data Transfer ----

/// Vectored read (scatter). Fills the segments in order.
pub fn readv_nonblocking(fd: RawFd, bufs: &mut [&mut [u8]]) -> io::Result<usize> {
    let mut iovecs: [libc::iovec; 8] = unsafe { mem::zeroed() };
    let iov_count = bufs.len().min(8);

    for (slot, buf) in iovecs.iter_mut().zip(bufs.iter_mut()) {
        *slot = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut c_void,
            iov_len: buf.len(),
        };
    }

    let res = unsafe { libc::readv(fd, iovecs.as_ptr(), iov_count as c_int) };
    cvt_size(res)
}

pub fn write_nonblocking(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let res = unsafe { libc::write(fd, buf.as_ptr() as *const c_void, buf.len()) };
    cvt_size(res)
}

/// Vectored write: write multiple buffers in a single syscall (gather).
/// Empty segments are skipped.
pub fn writev_nonblocking(fd: RawFd, bufs: &[&[u8]]) -> io::Result<usize> {
    let mut iovecs: [libc::iovec; 8] = unsafe { mem::zeroed() };
    let mut iov_count = 0;

    for buf in bufs.iter().filter(|b| !b.is_empty()).take(8) {
        iovecs[iov_count] = libc::iovec {
            iov_base: buf.as_ptr() as *mut c_void,
            iov_len: buf.len(),
        };
        iov_count += 1;
    }
    if iov_count == 0 {
        return Ok(0);
    }

    let res = unsafe { libc::writev(fd, iovecs.as_ptr(), iov_count as c_int) };
    cvt_size(res)
}

/// `send` with `MSG_NOSIGNAL`, for one-off writes to sockets we are about
/// to drop.
pub fn send_nosignal(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let res = unsafe {
        libc::send(
            fd,
            buf.as_ptr() as *const c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        )
    };
    cvt_size(res)
}

// ---- Memory Mapping ----

/// Map `len` bytes of `fd` read-only and private.
pub fn mmap_readonly(fd: RawFd, len: usize) -> io::Result<NonNull<u8>> {
    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ,
            libc::MAP_PRIVATE,
            fd,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(addr as *mut u8).ok_or_else(|| io::Error::other("mmap returned null"))
}

/// # Safety
/// `addr`/`len` must come from a live `mmap_readonly` mapping that is not
/// used afterwards.
pub unsafe fn munmap(addr: NonNull<u8>, len: usize) {
    unsafe {
        libc::munmap(addr.as_ptr() as *mut c_void, len);
    }
}

/// Ignore SIGPIPE process-wide so writes to reset peers surface as EPIPE.
pub fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::os::unix::net::UnixStream;

    #[test]
    fn listen_accept_round_trip() {
        let listener =
            create_listen_socket("127.0.0.1:0".parse().unwrap(), false).unwrap();
        let addr = local_addr(listener.as_raw_fd()).unwrap();
        assert_ne!(addr.port(), 0);

        assert!(accept_connection(listener.as_raw_fd()).unwrap().is_none());

        let mut client = TcpStream::connect(addr).unwrap();
        let accepted = loop {
            if let Some(pair) = accept_connection(listener.as_raw_fd()).unwrap() {
                break pair;
            }
            std::thread::yield_now();
        };
        assert_eq!(accepted.1.ip(), addr.ip());

        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        let mut got = 0;
        while got < 4 {
            let n = match readv_nonblocking(accepted.0.as_raw_fd(), &mut [&mut buf[got..]]) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => panic!("{e}"),
            };
            got += n;
        }
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn writev_gathers_segments() {
        let (tx, mut rx) = UnixStream::pair().unwrap();
        let n = writev_nonblocking(tx.as_raw_fd(), &[b"head ", b"", b"body"]).unwrap();
        assert_eq!(n, 9);
        drop(tx);
        let mut out = String::new();
        rx.read_to_string(&mut out).unwrap();
        assert_eq!(out, "head body");
    }

    #[test]
    fn eventfd_wakes_epoll() {
        let epoll = Epoll::new().unwrap();
        let wake = EventFd::new().unwrap();
        epoll.add(wake.raw_fd(), 7, EPOLLIN).unwrap();

        let mut events = vec![epoll_event { events: 0, u64: 0 }; 4];
        assert_eq!(epoll.wait(&mut events, 0).unwrap(), 0);

        wake.notify().unwrap();
        wake.notify().unwrap();
        assert_eq!(epoll.wait(&mut events, 100).unwrap(), 1);
        let token = events[0].u64;
        assert_eq!(token, 7);
        assert_eq!(wake.drain().unwrap(), 2);
        assert_eq!(epoll.wait(&mut events, 0).unwrap(), 0);
    }
}
