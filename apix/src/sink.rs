//! Transport contract.
//!
//! A [`Sink`] is one pluggable I/O backend (Unix socket, TCP, serial line,
//! in-memory, ...). The bus owns its sinks and only ever talks to them
//! through this trait; sinks create and destroy entries in the bus's
//! [`Connections`] table as descriptors come and go.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::conn::{Connections, Handle};
use crate::error::{Error, Result};

/// Transport-specific control request for [`Sink::ioctl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Ioctl {
    /// Configure a serial line.
    Serial(SerialParams),
}

/// Serial line settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[non_exhaustive]
pub struct SerialParams {
    /// Line speed.
    pub baud: Baud,
    /// Data bits per character.
    pub bits: DataBits,
    /// Parity mode.
    pub parity: Parity,
    /// Stop bits.
    pub stop: StopBits,
}

impl SerialParams {
    /// Assembles a parameter set.
    pub const fn new(baud: Baud, bits: DataBits, parity: Parity, stop: StopBits) -> Self {
        Self {
            baud,
            bits,
            parity,
            stop,
        }
    }
}

/// Supported line speeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Baud {
    /// 9600 baud.
    B9600,
    /// 115200 baud.
    #[default]
    B115200,
}

/// Data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[non_exhaustive]
pub enum DataBits {
    /// Seven bits.
    Seven,
    /// Eight bits.
    #[default]
    Eight,
}

/// Parity mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Parity {
    /// No parity bit.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

/// Stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[non_exhaustive]
pub enum StopBits {
    /// One stop bit.
    #[default]
    One,
    /// Two stop bits.
    Two,
}

/// A named transport registered into a bus.
///
/// Every handle a sink hands out, accepted peers included, must have a
/// [`Connection`](crate::Connection) in `conns`; when the descriptor
/// errors, reaches end-of-stream or is closed, the sink removes it.
pub trait Sink: fmt::Debug + Send {
    /// Unique name within the bus.
    fn name(&self) -> &str;

    /// Opens `addr` and returns the new descriptor.
    fn open(&mut self, conns: &mut Connections, addr: &str) -> Result<Handle>;

    /// Closes a descriptor this sink owns.
    fn close(&mut self, conns: &mut Connections, handle: Handle) -> Result<()>;

    /// Applies transport-specific control to a descriptor.
    fn ioctl(&mut self, handle: Handle, cmd: &Ioctl) -> Result<()> {
        let _ = (handle, cmd);
        Err(Error::Unsupported {
            sink: self.name().to_owned(),
            op: "ioctl",
        })
    }

    /// Writes bytes to a descriptor. A full transmit queue yields `Ok(0)`.
    fn send(&mut self, handle: Handle, buf: &[u8]) -> Result<usize>;

    /// Reads bytes directly from a descriptor, bypassing the receive buffer.
    fn recv(&mut self, handle: Handle, buf: &mut [u8]) -> Result<usize>;

    /// Waits at most `timeout` for activity, accepts pending peers and
    /// fills the receive buffers of readable connections.
    fn poll(&mut self, conns: &mut Connections, timeout: Duration) -> Result<()>;
}
