//! Readiness multiplexer over Linux epoll, level-triggered.
//!
//! One instance is shared between the reactor thread and the workers:
//! `epoll_ctl` is safe to call concurrently with a blocked `epoll_wait`,
//! which is what lets a worker arm `WRITABLE` interest mid-response.

use std::io;
use std::os::unix::io::RawFd;

use libc::c_int;

/// Maximum events drained per `wait` call.
const MAX_EVENTS: usize = 1024;

/// Interest in read readiness (plus peer-hangup, which Linux folds in).
pub const READABLE: u32 = (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
/// Interest in write readiness.
pub const WRITABLE: u32 = libc::EPOLLOUT as u32;

/// One readiness notification.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub fd: RawFd,
    pub events: u32,
}

impl Event {
    /// Readable, or a condition the read path must observe (hangup, error):
    /// a subsequent `recv` reports EOF or the hard error.
    pub fn readable(&self) -> bool {
        const READ_FLAGS: u32 = (libc::EPOLLIN
            | libc::EPOLLRDHUP
            | libc::EPOLLHUP
            | libc::EPOLLERR) as u32;
        self.events & READ_FLAGS != 0
    }

    pub fn writable(&self) -> bool {
        self.events & libc::EPOLLOUT as u32 != 0
    }
}

pub struct Epoll {
    fd: RawFd,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    /// Register a descriptor with the given interest set.
    pub fn register(&self, fd: RawFd, interest: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest)
    }

    /// Replace a registered descriptor's interest set.
    pub fn modify(&self, fd: RawFd, interest: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest)
    }

    /// Remove a descriptor. Deregistering a descriptor that is unknown or
    /// already closed is a no-op, not an error.
    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let res = unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if res < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ENOENT) | Some(libc::EBADF) => return Ok(()),
                _ => return Err(err),
            }
        }
        Ok(())
    }

    /// Block until at least one descriptor is ready or the timeout elapses.
    /// Interruption by a signal is reported as zero events.
    pub fn wait(&self, out: &mut Vec<Event>, timeout_ms: i32) -> io::Result<usize> {
        let mut raw: [libc::epoll_event; MAX_EVENTS] = unsafe { std::mem::zeroed() };
        out.clear();

        let n = unsafe {
            libc::epoll_wait(self.fd, raw.as_mut_ptr(), MAX_EVENTS as c_int, timeout_ms)
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(err);
        }

        for ev in raw.iter().take(n as usize) {
            out.push(Event {
                fd: ev.u64 as RawFd,
                events: ev.events,
            });
        }
        Ok(n as usize)
    }

    fn ctl(&self, op: c_int, fd: RawFd, interest: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest,
            u64: fd as u64,
        };
        let res = unsafe { libc::epoll_ctl(self.fd, op, fd, &mut event) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
