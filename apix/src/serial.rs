//! Serial-line sink.
//!
//! Devices are opened non-blocking and without becoming the controlling
//! terminal. Line settings are applied through [`Ioctl::Serial`].

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use nix::sys::termios::{self, BaudRate, ControlFlags, SetArg};
use tracing::{debug, info, warn};

use crate::conn::{Connection, Connections, Handle};
use crate::error::{Error, Result};
use crate::poller;
use crate::sink::{Baud, DataBits, Ioctl, Parity, SerialParams, Sink, StopBits};

/// Sink over tty devices; `addr` is a device path such as `/dev/ttyUSB0`.
#[derive(Debug)]
pub struct SerialSink {
    name: String,
    ports: BTreeMap<Handle, File>,
}

impl SerialSink {
    /// Creates a sink named `serial`.
    pub fn new() -> Self {
        Self::named("serial")
    }

    /// Creates a sink with a custom name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ports: BTreeMap::new(),
        }
    }
}

impl Default for SerialSink {
    fn default() -> Self {
        Self::new()
    }
}

/// Puts `port` in raw mode with the requested line settings.
fn configure(port: &File, params: SerialParams) -> io::Result<()> {
    let mut tio = termios::tcgetattr(port)?;
    termios::cfmakeraw(&mut tio);
    termios::cfsetspeed(
        &mut tio,
        match params.baud {
            Baud::B9600 => BaudRate::B9600,
            Baud::B115200 => BaudRate::B115200,
        },
    )?;

    let flags = &mut tio.control_flags;
    flags.remove(ControlFlags::CSIZE | ControlFlags::PARENB | ControlFlags::PARODD);
    flags.remove(ControlFlags::CSTOPB);
    flags.insert(match params.bits {
        DataBits::Seven => ControlFlags::CS7,
        DataBits::Eight => ControlFlags::CS8,
    });
    match params.parity {
        Parity::None => {}
        Parity::Odd => flags.insert(ControlFlags::PARENB | ControlFlags::PARODD),
        Parity::Even => flags.insert(ControlFlags::PARENB),
    }
    if params.stop == StopBits::Two {
        flags.insert(ControlFlags::CSTOPB);
    }
    flags.insert(ControlFlags::CLOCAL | ControlFlags::CREAD);

    termios::tcsetattr(port, SetArg::TCSANOW, &tio)?;
    Ok(())
}

impl Sink for SerialSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self, conns: &mut Connections, addr: &str) -> Result<Handle> {
        let port = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
            .open(addr)?;
        let handle = port.as_raw_fd();
        conns.insert(Connection::new(handle, &self.name, addr))?;
        debug!(sink = %self.name, handle, addr, "opened");
        self.ports.insert(handle, port);
        Ok(handle)
    }

    fn close(&mut self, conns: &mut Connections, handle: Handle) -> Result<()> {
        self.ports
            .remove(&handle)
            .ok_or(Error::UnknownHandle(handle))?;
        conns.remove(handle);
        Ok(())
    }

    fn ioctl(&mut self, handle: Handle, cmd: &Ioctl) -> Result<()> {
        let port = self
            .ports
            .get(&handle)
            .ok_or(Error::UnknownHandle(handle))?;
        match *cmd {
            Ioctl::Serial(params) => {
                configure(port, params).map_err(Error::Io)?;
                info!(sink = %self.name, handle, ?params, "line configured");
                Ok(())
            }
        }
    }

    fn send(&mut self, handle: Handle, buf: &[u8]) -> Result<usize> {
        let port = self
            .ports
            .get_mut(&handle)
            .ok_or(Error::UnknownHandle(handle))?;
        match port.write(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn recv(&mut self, handle: Handle, buf: &mut [u8]) -> Result<usize> {
        let port = self
            .ports
            .get_mut(&handle)
            .ok_or(Error::UnknownHandle(handle))?;
        match port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn poll(&mut self, conns: &mut Connections, timeout: Duration) -> Result<()> {
        let fds: Vec<Handle> = self.ports.keys().copied().collect();
        for ready in poller::wait(&fds, timeout)? {
            let handle = ready.fd;
            let (Some(port), Some(conn)) = (self.ports.get_mut(&handle), conns.get_mut(handle))
            else {
                continue;
            };
            let failed = match conn.fill_from(port) {
                // A tty reports zero bytes when the line is idle, not closed;
                // only a hang-up ends it.
                Ok(0) => ready.hangup,
                Ok(_) => false,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
                Err(e) => {
                    warn!(sink = %self.name, handle, error = %e, "read failed");
                    true
                }
            };
            if failed {
                debug!(sink = %self.name, handle, "device closed");
                self.ports.remove(&handle);
                conns.remove(handle);
            }
        }
        Ok(())
    }
}
