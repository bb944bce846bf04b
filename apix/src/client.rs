//! Blocking client for talking to a bus over a Unix or TCP socket.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use apix_proto::{Decoded, Encoder, Leader, Packet, Reply, Status, read_one_packet};

use crate::buffer::ByteBuffer;
use crate::bus::{SERVICE_ADD, SERVICE_ALIVE, SERVICE_DEL};
use crate::error::{Error, Result};

#[derive(Debug)]
enum Stream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Unix(s) => s.read(buf),
            Self::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Unix(s) => s.write(buf),
            Self::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Unix(s) => s.flush(),
            Self::Tcp(s) => s.flush(),
        }
    }
}

/// A connection to a bus.
///
/// Calls that wait for an answer ([`request`](Self::request),
/// [`subscribe`](Self::subscribe), ...) keep any unrelated frames that
/// arrive meanwhile; the next [`recv`](Self::recv) returns them first.
#[derive(Debug)]
pub struct Client {
    stream: Stream,
    encoder: Encoder,
    rx: ByteBuffer,
    backlog: VecDeque<Packet>,
    next_reqid: u16,
}

impl Client {
    /// Connects to a bus listening on a Unix socket.
    pub fn connect_unix(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::with_stream(Stream::Unix(UnixStream::connect(path)?)))
    }

    /// Connects to a bus listening on TCP.
    pub fn connect_tcp(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self::with_stream(Stream::Tcp(stream)))
    }

    fn with_stream(stream: Stream) -> Self {
        Self {
            stream,
            encoder: Encoder::new(),
            rx: ByteBuffer::default(),
            backlog: VecDeque::new(),
            next_reqid: 1,
        }
    }

    /// Bounds how long [`recv`](Self::recv) and the waiting calls block.
    /// `None` waits forever.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.stream {
            Stream::Unix(s) => s.set_read_timeout(timeout)?,
            Stream::Tcp(s) => s.set_read_timeout(timeout)?,
        }
        Ok(())
    }

    /// Writes one frame.
    pub fn send(&mut self, packet: &Packet) -> Result<()> {
        self.stream.write_all(packet.as_bytes())?;
        Ok(())
    }

    /// Blocks until the next frame arrives. Corrupt bytes are skipped.
    pub fn recv(&mut self) -> Result<Packet> {
        match self.backlog.pop_front() {
            Some(p) => Ok(p),
            None => self.read_frame(),
        }
    }

    /// Decodes the next frame off the socket.
    fn read_frame(&mut self) -> Result<Packet> {
        loop {
            match read_one_packet(self.rx.readable()) {
                Decoded::Packet(p) => {
                    self.rx.read_advance(p.len());
                    return Ok(p);
                }
                Decoded::Malformed { discard } => {
                    self.rx.read_advance(discard);
                    continue;
                }
                Decoded::NeedMoreData => {}
            }
            self.rx.tidy();
            self.rx.reserve(apix_proto::MAX_FRAME_LEN);
            let n = self.stream.read(self.rx.writable())?;
            if n == 0 {
                return Err(Error::Closed);
            }
            self.rx.write_advance(n);
        }
    }

    /// Waits for the first frame accepted by `want`, keeping the others.
    fn wait_for(&mut self, want: impl Fn(&Packet) -> bool) -> Result<Packet> {
        if let Some(i) = self.backlog.iter().position(&want) {
            if let Some(p) = self.backlog.remove(i) {
                return Ok(p);
            }
        }
        loop {
            let p = self.read_frame()?;
            if want(&p) {
                return Ok(p);
            }
            self.backlog.push_back(p);
        }
    }

    fn alloc_reqid(&mut self) -> u16 {
        let id = self.next_reqid;
        self.next_reqid = self.next_reqid.wrapping_add(1).max(1);
        id
    }

    /// Calls a service and waits for its response (or the bus's error
    /// reply).
    pub fn request(&mut self, header: &str, data: &str) -> Result<Packet> {
        let reqid = self.alloc_reqid();
        let req = self.encoder.request(reqid, header, data)?;
        self.send(&req)?;
        let crc = req.crc16();
        self.wait_for(|p| {
            p.leader() == Leader::Response && p.reqid() == reqid && p.reqcrc16() == crc
        })
    }

    /// Answers a request received from the bus.
    pub fn respond(&mut self, to: &Packet, data: &str) -> Result<()> {
        let resp = self
            .encoder
            .response(to.reqid(), to.crc16(), to.header(), data)?;
        self.send(&resp)
    }

    /// Registers this connection as the service for `header`.
    pub fn add_service(&mut self, header: &str) -> Result<Status> {
        self.control(SERVICE_ADD, header)
    }

    /// Removes a service registered by this connection.
    pub fn del_service(&mut self, header: &str) -> Result<Status> {
        self.control(SERVICE_DEL, header)
    }

    /// Refreshes the liveness of a service registered by this connection.
    pub fn alive(&mut self, header: &str) -> Result<Status> {
        self.control(SERVICE_ALIVE, header)
    }

    fn control(&mut self, op: &str, header: &str) -> Result<Status> {
        let body = serde_json::json!({ "header": header }).to_string();
        let reply = self.request(op, &body)?;
        status_of(&reply)
    }

    /// Subscribes to `topic`.
    pub fn subscribe(&mut self, topic: &str) -> Result<Status> {
        let sub = self.encoder.subscribe(topic, "{}")?;
        self.ack(&sub)
    }

    /// Unsubscribes from `topic`.
    pub fn unsubscribe(&mut self, topic: &str) -> Result<Status> {
        let unsub = self.encoder.unsubscribe(topic)?;
        self.ack(&unsub)
    }

    fn ack(&mut self, packet: &Packet) -> Result<Status> {
        self.send(packet)?;
        let crc = packet.crc16();
        let topic = packet.header().to_owned();
        let reply = self.wait_for(|p| {
            p.leader() == Leader::Response
                && p.reqid() == 0
                && p.reqcrc16() == crc
                && p.header() == topic
        })?;
        status_of(&reply)
    }

    /// Publishes `data` on `topic`.
    pub fn publish(&mut self, topic: &str, data: &str) -> Result<()> {
        let msg = self.encoder.publish(topic, data)?;
        self.send(&msg)
    }
}

fn status_of(reply: &Packet) -> Result<Status> {
    Reply::parse(reply.data())
        .and_then(|r| r.status())
        .ok_or_else(|| Error::UnexpectedReply(String::from_utf8_lossy(reply.data()).into_owned()))
}
