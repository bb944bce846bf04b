//! Embeddable message bus.
//!
//! One [`Bus`] multiplexes any number of transports ([`Sink`]s) behind a
//! single polling loop, decodes the framed wire protocol from
//! [`apix_proto`] on every connection and routes three kinds of traffic:
//! request/response calls to registered services, publish/subscribe
//! topics, and the service registry itself.
//!
//! # Quick start
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use apix::{Bus, BusConfig, UnixSink};
//!
//! let mut bus = Bus::new(BusConfig::default());
//! bus.add_sink(UnixSink::new())?;
//! bus.open("unix", "/tmp/apix.sock")?;
//! for _ in 0..100 {
//!     bus.poll(Duration::from_millis(100))?;
//! }
//! # Ok::<(), apix::Error>(())
//! ```
//!
//! Peers talk to it with [`Client`] or any implementation of the protocol.

mod buffer;
mod bus;
#[cfg(unix)]
mod client;
mod config;
mod conn;
mod error;
mod mem;
#[cfg(unix)]
mod poller;
#[cfg(unix)]
mod serial;
mod sink;
#[cfg(unix)]
mod stream;

pub use apix_proto as proto;
pub use buffer::{ByteBuffer, DEFAULT_CAPACITY};
pub use bus::{
    Bus, PendingRequest, RequestState, SERVICE_ADD, SERVICE_ALIVE, SERVICE_DEL, Service, Topic,
};
#[cfg(unix)]
pub use client::Client;
pub use config::BusConfig;
pub use conn::{Connection, Connections, Handle};
pub use error::{Error, Result};
pub use mem::{MemHub, MemPeer, MemSink};
#[cfg(unix)]
pub use serial::SerialSink;
pub use sink::{Baud, DataBits, Ioctl, Parity, SerialParams, Sink, StopBits};
#[cfg(unix)]
pub use stream::{SocketKind, StreamSink, Tcp, TcpSink, Unix, UnixSink};
