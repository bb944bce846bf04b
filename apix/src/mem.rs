//! In-process sink.
//!
//! A [`MemSink`] lives inside a bus while [`MemPeer`]s, obtained through
//! its [`MemHub`], play the remote side from ordinary code: what a peer
//! sends shows up in its connection's receive buffer on the next poll, and
//! what the bus writes to the connection is collected with
//! [`MemPeer::recv`]. Handles come from one process-wide counter starting
//! at `0x4000`, clear of real file descriptors, so several in-memory sinks
//! can share a bus.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, warn};

use crate::conn::{Connection, Connections, Handle};
use crate::error::{Error, Result};
use crate::sink::Sink;

const FIRST_HANDLE: Handle = 0x4000;

static NEXT_HANDLE: AtomicI32 = AtomicI32::new(FIRST_HANDLE);

fn alloc() -> Handle {
    NEXT_HANDLE.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Default)]
struct State {
    /// Peers connected but not yet seen by a poll, with their address.
    pending: Vec<(Handle, String)>,
    /// Handles known to the bus.
    open: BTreeSet<Handle>,
    /// Peers that hung up.
    hung_up: Vec<Handle>,
    /// Peer -> bus bytes not yet delivered.
    inbound: BTreeMap<Handle, Vec<u8>>,
    /// Bus -> peer bytes not yet collected.
    outbound: BTreeMap<Handle, Vec<u8>>,
}

impl State {
    fn has_work(&self) -> bool {
        !self.pending.is_empty()
            || !self.hung_up.is_empty()
            || self.inbound.values().any(|b| !b.is_empty())
    }

    fn forget(&mut self, handle: Handle) {
        self.open.remove(&handle);
        self.inbound.remove(&handle);
        self.outbound.remove(&handle);
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    activity: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The in-memory sink.
#[derive(Debug)]
pub struct MemSink {
    name: String,
    shared: Arc<Shared>,
}

impl MemSink {
    /// Creates a sink named `mem`.
    pub fn new() -> Self {
        Self::named("mem")
    }

    /// Creates a sink with a custom name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shared: Arc::default(),
        }
    }

    /// A handle for connecting peers after the sink moved into a bus.
    pub fn hub(&self) -> MemHub {
        MemHub {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Default for MemSink {
    fn default() -> Self {
        Self::new()
    }
}

/// Creates peers of one [`MemSink`].
#[derive(Debug, Clone)]
pub struct MemHub {
    shared: Arc<Shared>,
}

impl MemHub {
    /// Connects a new peer; the bus sees it on its next poll.
    pub fn connect(&self, addr: &str) -> MemPeer {
        let handle = alloc();
        let mut st = self.shared.lock();
        st.pending.push((handle, addr.to_owned()));
        drop(st);
        self.shared.activity.notify_all();
        self.peer(handle)
    }

    /// The peer end of a connection created with [`Sink::open`].
    pub fn peer(&self, handle: Handle) -> MemPeer {
        MemPeer {
            handle,
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Remote end of one in-memory connection.
#[derive(Debug)]
pub struct MemPeer {
    handle: Handle,
    shared: Arc<Shared>,
}

impl MemPeer {
    /// Handle of the bus-side connection.
    pub const fn handle(&self) -> Handle {
        self.handle
    }

    /// Queues bytes towards the bus.
    pub fn send(&self, bytes: &[u8]) -> Result<()> {
        let mut st = self.shared.lock();
        let pending = st.pending.iter().any(|(h, _)| *h == self.handle);
        if !pending && !st.open.contains(&self.handle) {
            return Err(Error::Closed);
        }
        st.inbound
            .entry(self.handle)
            .or_default()
            .extend_from_slice(bytes);
        drop(st);
        self.shared.activity.notify_all();
        Ok(())
    }

    /// Takes every byte the bus has written so far.
    pub fn recv(&self) -> Vec<u8> {
        self.shared
            .lock()
            .outbound
            .get_mut(&self.handle)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    /// `true` while the bus side exists (or is about to).
    pub fn is_open(&self) -> bool {
        let st = self.shared.lock();
        st.open.contains(&self.handle) || st.pending.iter().any(|(h, _)| *h == self.handle)
    }

    /// Hangs up; the bus destroys the connection on its next poll.
    pub fn close(&self) {
        let mut st = self.shared.lock();
        st.pending.retain(|(h, _)| *h != self.handle);
        if st.open.contains(&self.handle) {
            st.hung_up.push(self.handle);
        }
        drop(st);
        self.shared.activity.notify_all();
    }
}

impl Sink for MemSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self, conns: &mut Connections, addr: &str) -> Result<Handle> {
        let mut st = self.shared.lock();
        let handle = alloc();
        conns.insert(Connection::new(handle, &self.name, addr))?;
        st.open.insert(handle);
        debug!(sink = %self.name, handle, addr, "opened");
        Ok(handle)
    }

    fn close(&mut self, conns: &mut Connections, handle: Handle) -> Result<()> {
        let mut st = self.shared.lock();
        if !st.open.contains(&handle) {
            return Err(Error::UnknownHandle(handle));
        }
        st.forget(handle);
        conns.remove(handle);
        Ok(())
    }

    fn send(&mut self, handle: Handle, buf: &[u8]) -> Result<usize> {
        let mut st = self.shared.lock();
        if !st.open.contains(&handle) {
            return Err(Error::UnknownHandle(handle));
        }
        st.outbound
            .entry(handle)
            .or_default()
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn recv(&mut self, handle: Handle, buf: &mut [u8]) -> Result<usize> {
        let mut st = self.shared.lock();
        if !st.open.contains(&handle) {
            return Err(Error::UnknownHandle(handle));
        }
        let Some(queued) = st.inbound.get_mut(&handle) else {
            return Ok(0);
        };
        let n = buf.len().min(queued.len());
        buf[..n].copy_from_slice(&queued[..n]);
        queued.drain(..n);
        Ok(n)
    }

    fn poll(&mut self, conns: &mut Connections, timeout: Duration) -> Result<()> {
        let mut st = self.shared.lock();
        if !st.has_work() && !timeout.is_zero() {
            st = self
                .shared
                .activity
                .wait_timeout_while(st, timeout, |s| !s.has_work())
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        for (handle, addr) in std::mem::take(&mut st.pending) {
            if let Err(e) = conns.insert(Connection::new(handle, &self.name, addr.as_str())) {
                warn!(sink = %self.name, handle, %addr, error = %e, "peer refused");
                st.forget(handle);
                continue;
            }
            st.open.insert(handle);
            debug!(sink = %self.name, handle, %addr, "peer connected");
        }
        for (&handle, bytes) in &mut st.inbound {
            if bytes.is_empty() {
                continue;
            }
            if let Some(conn) = conns.get_mut(handle) {
                conn.push_received(bytes);
            }
            bytes.clear();
        }
        for handle in std::mem::take(&mut st.hung_up) {
            st.forget(handle);
            conns.remove(handle);
            debug!(sink = %self.name, handle, "peer closed");
        }
        Ok(())
    }
}
