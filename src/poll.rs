//! Readiness set for one worker tick, waited on with `poll(2)`.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Readiness of one descriptor after a wait.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

/// Interest registered for one descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub(crate) const NONE: Interest = Interest {
        read: false,
        write: false,
    };
    pub(crate) const READ: Interest = Interest {
        read: true,
        write: false,
    };

    fn events(self) -> libc::c_short {
        let mut events = 0;
        if self.read {
            events |= libc::POLLIN;
        }
        if self.write {
            events |= libc::POLLOUT;
        }
        events
    }
}

/// A flat `pollfd` array, rebuilt every tick.
#[derive(Debug, Default)]
pub(crate) struct PollSet {
    fds: Vec<libc::pollfd>,
}

impl PollSet {
    pub(crate) fn with_capacity(n: usize) -> Self {
        Self {
            fds: Vec::with_capacity(n),
        }
    }

    /// Register `fd`, returning its slot.
    pub(crate) fn push(&mut self, fd: RawFd, interest: Interest) -> usize {
        self.fds.push(libc::pollfd {
            fd,
            events: interest.events(),
            revents: 0,
        });
        self.fds.len() - 1
    }

    pub(crate) fn len(&self) -> usize {
        self.fds.len()
    }

    pub(crate) fn fd(&self, slot: usize) -> RawFd {
        self.fds[slot].fd
    }

    #[cfg(test)]
    pub(crate) fn interest(&self, slot: usize) -> Interest {
        let events = self.fds[slot].events;
        Interest {
            read: events & libc::POLLIN != 0,
            write: events & libc::POLLOUT != 0,
        }
    }

    /// Wait until a descriptor is ready or `timeout` passes.
    ///
    /// Returns the number of ready descriptors; 0 on timeout or signal.
    pub(crate) fn wait(&mut self, timeout: Duration) -> io::Result<usize> {
        let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        #[allow(unsafe_code)]
        // SAFETY: `fds` is a live, exclusively borrowed array of
        // `self.fds.len()` initialized `pollfd` structs for the whole call.
        let rc = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(rc as usize)
    }

    pub(crate) fn readiness(&self, slot: usize) -> Readiness {
        let revents = self.fds[slot].revents;
        Readiness {
            readable: revents & libc::POLLIN != 0,
            writable: revents & libc::POLLOUT != 0,
            error: revents & (libc::POLLERR | libc::POLLNVAL) != 0,
        }
    }
}
