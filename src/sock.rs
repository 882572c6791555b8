//! Non-blocking socket syscalls for the reactor.
//!
//! Everything here operates on raw descriptors: the engine owns fd
//! lifetimes itself (see `conn.rs`), so the std net wrappers' implicit
//! close-on-drop would fight the connection table.

use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::RawFd;
use std::time::Duration;

use libc::{c_int, c_void, socklen_t};

/// Create a non-blocking IPv4 listen socket bound to `host:port`.
///
/// `port` 0 binds an ephemeral port; recover it with [`local_port`].
pub fn create_listener(host: Ipv4Addr, port: u16, backlog: i32) -> io::Result<RawFd> {
    unsafe {
        let fd = libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from_ne_bytes(host.octets()),
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            &sin as *const _ as *const libc::sockaddr,
            mem::size_of_val(&sin) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        if libc::listen(fd, backlog) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        Ok(fd)
    }
}

/// Port the socket is actually bound to.
pub fn local_port(fd: RawFd) -> io::Result<u16> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        if libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error());
        }
        match sockaddr_to_addr(&storage) {
            Some(addr) => Ok(addr.port()),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unsupported address family",
            )),
        }
    }
}

/// Accept one pending connection, non-blocking and close-on-exec.
///
/// Returns `Ok(None)` when the accept queue is drained.
pub fn accept(listen_fd: RawFd) -> io::Result<Option<(RawFd, SocketAddr)>> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;

        let fd = libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        );
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }

        let peer = sockaddr_to_addr(&storage).unwrap_or_else(|| {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        });
        Ok(Some((fd, peer)))
    }
}

unsafe fn sockaddr_to_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = &*(storage as *const _ as *const libc::sockaddr_in);
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            let sin6 = &*(storage as *const _ as *const libc::sockaddr_in6);
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::new(IpAddr::V6(ip), u16::from_be(sin6.sin6_port)))
        }
        _ => None,
    }
}

/// Disable Nagle's algorithm on an accepted socket.
pub fn set_nodelay(fd: RawFd) -> io::Result<()> {
    let one: c_int = 1;
    setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, &one)
}

/// Set a kernel receive timeout on an accepted socket.
pub fn set_recv_timeout(fd: RawFd, timeout: Duration) -> io::Result<()> {
    let tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_RCVTIMEO, &tv)
}

fn setsockopt<T>(fd: RawFd, level: c_int, name: c_int, value: &T) -> io::Result<()> {
    let res = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            value as *const T as *const c_void,
            mem::size_of::<T>() as socklen_t,
        )
    };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Non-blocking read. `Ok(0)` is EOF; a would-block condition surfaces as
/// `ErrorKind::WouldBlock` so the caller can tell the two apart.
pub fn recv(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let res = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(res as usize)
}

/// Non-blocking send that never raises SIGPIPE.
pub fn send(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let res = unsafe {
        libc::send(
            fd,
            buf.as_ptr() as *const c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        )
    };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(res as usize)
}

/// Close a raw descriptor, ignoring errors.
pub fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_binds_ephemeral_port() {
        let fd = create_listener(Ipv4Addr::LOCALHOST, 0, 16).unwrap();
        let port = local_port(fd).unwrap();
        assert!(port > 0);
        close(fd);
    }

    #[test]
    fn accept_on_empty_queue_would_block() {
        let fd = create_listener(Ipv4Addr::LOCALHOST, 0, 16).unwrap();
        assert!(accept(fd).unwrap().is_none());
        close(fd);
    }
}
