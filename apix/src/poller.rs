//! Readiness wait over a set of descriptors, shared by the POSIX sinks.

#![allow(unsafe_code)]

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// A descriptor that reported activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    /// The descriptor.
    pub fd: RawFd,
    /// Bytes (or a pending peer) can be read.
    pub readable: bool,
    /// The other end hung up or the descriptor is in error.
    pub hangup: bool,
}

/// Waits up to `timeout` for any of `fds` to become readable.
///
/// An interrupted wait reports nothing ready; the caller simply polls
/// again on its next cycle. With no descriptors this sleeps for `timeout`.
pub fn wait(fds: &[RawFd], timeout: Duration) -> io::Result<Vec<Ready>> {
    if fds.is_empty() {
        if !timeout.is_zero() {
            std::thread::sleep(timeout);
        }
        return Ok(Vec::new());
    }

    let mut pfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    let nfds = libc::nfds_t::try_from(pfds.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "too many descriptors"))?;
    let millis = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);

    // SAFETY: pfds is a valid, exclusively borrowed array of nfds pollfd structs.
    let ret = unsafe { libc::poll(pfds.as_mut_ptr(), nfds, millis) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(Vec::new());
        }
        return Err(err);
    }

    Ok(pfds
        .iter()
        .filter(|p| p.revents != 0)
        .map(|p| Ready {
            fd: p.fd,
            readable: p.revents & libc::POLLIN != 0,
            hangup: p.revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0,
        })
        .collect())
}
