//! Stream-socket sinks: Unix-domain and TCP.
//!
//! `open(addr)` binds a non-blocking listener; peers accepted during
//! [`Sink::poll`] become connections of their own. Every descriptor is
//! non-blocking, so a full socket buffer shows up as a short write rather
//! than a stall.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::marker::PhantomData;
use std::net::{TcpListener, TcpStream};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::time::Duration;

use tracing::{debug, warn};

use crate::conn::{Connection, Connections, Handle};
use crate::error::{Error, Result};
use crate::poller;
use crate::sink::Sink;

/// Socket family plugged into a [`StreamSink`].
pub trait SocketKind: Send + 'static {
    /// Default sink name.
    const NAME: &'static str;
    /// Accepting socket.
    type Listener: AsRawFd + Send;
    /// Connected socket.
    type Stream: Read + Write + AsRawFd + Send;

    /// Binds a non-blocking listener on `addr`.
    fn bind(addr: &str) -> io::Result<Self::Listener>;

    /// Accepts one pending peer, returning the stream and a printable
    /// peer address.
    fn accept(listener: &Self::Listener, local: &str) -> io::Result<(Self::Stream, String)>;

    /// Releases whatever `bind` left behind.
    fn unbind(_addr: &str) {}
}

/// Unix-domain stream sockets; `addr` is a filesystem path.
#[derive(Debug, Clone, Copy)]
pub struct Unix;

impl SocketKind for Unix {
    const NAME: &'static str = "unix";
    type Listener = UnixListener;
    type Stream = UnixStream;

    fn bind(addr: &str) -> io::Result<UnixListener> {
        // A socket file left over from a previous run blocks bind().
        if std::fs::symlink_metadata(addr).is_ok_and(|m| m.file_type().is_socket()) {
            std::fs::remove_file(addr)?;
        }
        let listener = UnixListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(listener)
    }

    fn accept(listener: &UnixListener, local: &str) -> io::Result<(UnixStream, String)> {
        let (stream, peer) = listener.accept()?;
        stream.set_nonblocking(true)?;
        let peer = peer
            .as_pathname()
            .map_or_else(|| local.to_owned(), |p| p.display().to_string());
        Ok((stream, peer))
    }

    fn unbind(addr: &str) {
        if let Err(e) = std::fs::remove_file(addr) {
            debug!(addr, error = %e, "socket file not removed");
        }
    }
}

/// TCP sockets; `addr` is `host:port`.
#[derive(Debug, Clone, Copy)]
pub struct Tcp;

impl SocketKind for Tcp {
    const NAME: &'static str = "tcp";
    type Listener = TcpListener;
    type Stream = TcpStream;

    fn bind(addr: &str) -> io::Result<TcpListener> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(listener)
    }

    fn accept(listener: &TcpListener, _local: &str) -> io::Result<(TcpStream, String)> {
        let (stream, peer) = listener.accept()?;
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok((stream, peer.to_string()))
    }
}

/// Sink over one socket family.
pub struct StreamSink<K: SocketKind> {
    name: String,
    listeners: BTreeMap<Handle, (K::Listener, String)>,
    streams: BTreeMap<Handle, K::Stream>,
    _kind: PhantomData<K>,
}

/// Unix-domain socket sink.
pub type UnixSink = StreamSink<Unix>;

/// TCP socket sink.
pub type TcpSink = StreamSink<Tcp>;

impl<K: SocketKind> StreamSink<K> {
    /// Creates a sink named after its socket family.
    pub fn new() -> Self {
        Self::named(K::NAME)
    }

    /// Creates a sink with a custom name, for buses carrying several
    /// sinks of the same family.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            listeners: BTreeMap::new(),
            streams: BTreeMap::new(),
            _kind: PhantomData,
        }
    }

    /// Accepts every pending peer on `handle`.
    fn accept_all(&mut self, conns: &mut Connections, handle: Handle) {
        let Some((listener, local)) = self.listeners.get(&handle) else {
            return;
        };
        loop {
            match K::accept(listener, local) {
                Ok((stream, peer)) => {
                    let fd = stream.as_raw_fd();
                    if let Err(e) = conns.insert(Connection::new(fd, &self.name, peer.as_str())) {
                        warn!(sink = %self.name, handle = fd, error = %e, "dropping accepted peer");
                        continue;
                    }
                    debug!(sink = %self.name, handle = fd, %peer, "accepted");
                    self.streams.insert(fd, stream);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(sink = %self.name, handle, error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    /// Reads what is available on `handle`; destroys it on end-of-stream
    /// or error.
    fn fill(&mut self, conns: &mut Connections, handle: Handle) {
        let (Some(stream), Some(conn)) = (self.streams.get_mut(&handle), conns.get_mut(handle))
        else {
            return;
        };
        match conn.fill_from(stream) {
            Ok(0) => {
                debug!(sink = %self.name, handle, "peer closed");
                self.destroy(conns, handle);
            }
            Ok(_) => {}
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                warn!(sink = %self.name, handle, error = %e, "read failed");
                self.destroy(conns, handle);
            }
        }
    }

    fn destroy(&mut self, conns: &mut Connections, handle: Handle) {
        self.streams.remove(&handle);
        if let Some((_, addr)) = self.listeners.remove(&handle) {
            K::unbind(&addr);
        }
        conns.remove(handle);
    }
}

impl<K: SocketKind> Default for StreamSink<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: SocketKind> fmt::Debug for StreamSink<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSink")
            .field("name", &self.name)
            .field("listeners", &self.listeners.keys().collect::<Vec<_>>())
            .field("streams", &self.streams.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<K: SocketKind> Drop for StreamSink<K> {
    fn drop(&mut self) {
        for (_, addr) in self.listeners.values() {
            K::unbind(addr);
        }
    }
}

impl<K: SocketKind> Sink for StreamSink<K> {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self, conns: &mut Connections, addr: &str) -> Result<Handle> {
        let listener = K::bind(addr)?;
        let handle = listener.as_raw_fd();
        conns.insert(Connection::listener(handle, &self.name, addr))?;
        debug!(sink = %self.name, handle, addr, "listening");
        self.listeners.insert(handle, (listener, addr.to_owned()));
        Ok(handle)
    }

    fn close(&mut self, conns: &mut Connections, handle: Handle) -> Result<()> {
        if !self.listeners.contains_key(&handle) && !self.streams.contains_key(&handle) {
            return Err(Error::UnknownHandle(handle));
        }
        self.destroy(conns, handle);
        Ok(())
    }

    fn send(&mut self, handle: Handle, buf: &[u8]) -> Result<usize> {
        let stream = self
            .streams
            .get_mut(&handle)
            .ok_or(Error::UnknownHandle(handle))?;
        match stream.write(buf) {
            Ok(n) => Ok(n),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn recv(&mut self, handle: Handle, buf: &mut [u8]) -> Result<usize> {
        let stream = self
            .streams
            .get_mut(&handle)
            .ok_or(Error::UnknownHandle(handle))?;
        match stream.read(buf) {
            Ok(0) if !buf.is_empty() => Err(Error::Closed),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn poll(&mut self, conns: &mut Connections, timeout: Duration) -> Result<()> {
        let fds: Vec<Handle> = self
            .listeners
            .keys()
            .chain(self.streams.keys())
            .copied()
            .collect();
        for ready in poller::wait(&fds, timeout)? {
            if self.listeners.contains_key(&ready.fd) {
                if ready.readable {
                    self.accept_all(conns, ready.fd);
                }
            } else {
                self.fill(conns, ready.fd);
            }
        }
        Ok(())
    }
}
