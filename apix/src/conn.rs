//! Per-descriptor connection state and the bus-wide connection table.

use std::collections::BTreeMap;
use std::io::{self, Read};
use std::time::Instant;

use crate::buffer::ByteBuffer;
use crate::error::{Error, Result};

/// Transport-assigned descriptor, unique within one bus.
pub type Handle = i32;

/// Bytes requested from the transport per read.
const READ_CHUNK: usize = 4096;

/// One open descriptor of some sink.
#[derive(Debug)]
pub struct Connection {
    handle: Handle,
    listening: bool,
    addr: String,
    sink: String,
    /// Bytes received and not yet decoded.
    pub rx: ByteBuffer,
    /// Bytes queued for sending.
    pub tx: ByteBuffer,
    last_recv: Instant,
    fresh: bool,
}

impl Connection {
    /// A connected peer (or device) owned by `sink`.
    pub fn new(handle: Handle, sink: &str, addr: impl Into<String>) -> Self {
        Self {
            handle,
            listening: false,
            addr: addr.into(),
            sink: sink.to_owned(),
            rx: ByteBuffer::default(),
            tx: ByteBuffer::default(),
            last_recv: Instant::now(),
            fresh: false,
        }
    }

    /// A listening descriptor that only accepts peers.
    pub fn listener(handle: Handle, sink: &str, addr: impl Into<String>) -> Self {
        Self {
            listening: true,
            ..Self::new(handle, sink, addr)
        }
    }

    /// Descriptor.
    pub const fn handle(&self) -> Handle {
        self.handle
    }

    /// `true` for accepting descriptors.
    pub const fn is_listening(&self) -> bool {
        self.listening
    }

    /// Address for reporting.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Name of the owning sink.
    pub fn sink(&self) -> &str {
        &self.sink
    }

    /// When bytes last arrived (or the connection was created).
    pub const fn last_recv(&self) -> Instant {
        self.last_recv
    }

    /// Appends received bytes to the receive buffer.
    pub fn push_received(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.rx.write(bytes);
        self.mark_received();
    }

    /// Reads once from `src` straight into the receive buffer.
    ///
    /// Returns the byte count; `Ok(0)` means end-of-stream.
    pub fn fill_from(&mut self, src: &mut impl Read) -> io::Result<usize> {
        self.rx.tidy();
        self.rx.reserve(READ_CHUNK);
        let n = src.read(self.rx.writable())?;
        if n > 0 {
            self.rx.write_advance(n);
            self.mark_received();
        }
        Ok(n)
    }

    fn mark_received(&mut self) {
        self.last_recv = Instant::now();
        self.fresh = true;
    }

    /// Returns whether bytes arrived since the last call, and resets it.
    pub(crate) fn take_fresh(&mut self) -> bool {
        std::mem::take(&mut self.fresh)
    }
}

/// All connections of a bus, indexed by handle.
///
/// Sinks insert and remove entries; removals are remembered so the bus can
/// drop routing state that referenced them.
#[derive(Debug, Default)]
pub struct Connections {
    map: BTreeMap<Handle, Connection>,
    closed: Vec<Handle>,
}

impl Connections {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks a new connection. Fails if its handle is already in use.
    pub fn insert(&mut self, conn: Connection) -> Result<()> {
        let handle = conn.handle;
        if self.map.contains_key(&handle) {
            return Err(Error::HandleInUse(handle));
        }
        self.map.insert(handle, conn);
        Ok(())
    }

    /// Destroys a connection, freeing its buffers.
    pub fn remove(&mut self, handle: Handle) -> Option<Connection> {
        let conn = self.map.remove(&handle)?;
        self.closed.push(handle);
        Some(conn)
    }

    /// Looks up a connection.
    pub fn get(&self, handle: Handle) -> Option<&Connection> {
        self.map.get(&handle)
    }

    /// Looks up a connection mutably.
    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut Connection> {
        self.map.get_mut(&handle)
    }

    /// `true` if `handle` is tracked.
    pub fn contains(&self, handle: Handle) -> bool {
        self.map.contains_key(&handle)
    }

    /// Number of tracked connections.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// `true` if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Connections in handle order.
    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.map.values()
    }

    /// Mutable connections in handle order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.map.values_mut()
    }

    /// Handles owned by `sink`.
    pub fn handles_of(&self, sink: &str) -> Vec<Handle> {
        self.map
            .values()
            .filter(|c| c.sink == sink)
            .map(|c| c.handle)
            .collect()
    }

    /// Handles destroyed since the last call.
    pub(crate) fn take_closed(&mut self) -> Vec<Handle> {
        std::mem::take(&mut self.closed)
    }
}
