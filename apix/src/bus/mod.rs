//! The bus engine.
//!
//! A [`Bus`] owns its sinks and every connection they create. Each call to
//! [`Bus::poll`] runs one cycle:
//!
//! 1. flush queued output and let every sink wait for input,
//! 2. decode complete frames out of each receive buffer,
//! 3. route requests, then responses, then topic messages,
//! 4. expire silent services and overdue requests,
//! 5. flush the replies produced by this cycle.
//!
//! Everything happens on the calling thread; no state is shared.

mod registry;
#[cfg(test)]
mod tests;

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use apix_proto::{
    Decoded, Encoder, Leader, Packet, Status, header_field, read_one_packet, skip_len,
};
use tracing::{debug, info, warn};

pub use self::registry::{PendingRequest, RequestState, Service, Topic};
use crate::config::BusConfig;
use crate::conn::{Connection, Connections, Handle};
use crate::error::{Error, Result};
use crate::sink::{Ioctl, Sink};

/// Registers the calling connection as the service named by `/header`.
pub const SERVICE_ADD: &str = "/core/service/add";
/// Removes a service owned by the calling connection.
pub const SERVICE_DEL: &str = "/core/service/del";
/// Refreshes the liveness of a service owned by the calling connection.
pub const SERVICE_ALIVE: &str = "/core/service/alive";

/// A message bus instance.
#[derive(Debug)]
pub struct Bus {
    config: BusConfig,
    sinks: Vec<Box<dyn Sink>>,
    conns: Connections,
    encoder: Encoder,
    requests: Vec<PendingRequest>,
    responses: Vec<(Handle, Packet)>,
    messages: Vec<(Handle, Packet)>,
    services: Vec<Service>,
    topics: Vec<Topic>,
    /// Last request id handed to a forwarded request.
    last_forward_id: u16,
    /// Current adaptive idle sleep.
    idle: Duration,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl Bus {
    /// Creates an empty bus.
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            sinks: Vec::new(),
            conns: Connections::new(),
            encoder: Encoder::new(),
            requests: Vec::new(),
            responses: Vec::new(),
            messages: Vec::new(),
            services: Vec::new(),
            topics: Vec::new(),
            last_forward_id: 0,
            idle: Duration::ZERO,
        }
    }

    /// Active settings.
    pub const fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Registers a sink under its name.
    pub fn add_sink(&mut self, sink: impl Sink + 'static) -> Result<()> {
        if self.sinks.iter().any(|s| s.name() == sink.name()) {
            return Err(Error::DuplicateSink(sink.name().to_owned()));
        }
        debug!(sink = sink.name(), "sink added");
        self.sinks.push(Box::new(sink));
        Ok(())
    }

    /// Closes every connection of the named sink and hands it back.
    pub fn remove_sink(&mut self, name: &str) -> Result<Box<dyn Sink>> {
        let idx = self.sink_index(name)?;
        let mut sink = self.sinks.remove(idx);
        for handle in self.conns.handles_of(name) {
            if let Err(e) = sink.close(&mut self.conns, handle) {
                warn!(sink = name, handle, error = %e, "close failed");
                self.conns.remove(handle);
            }
        }
        self.reap();
        debug!(sink = name, "sink removed");
        Ok(sink)
    }

    /// Opens `addr` on the named sink.
    pub fn open(&mut self, sink: &str, addr: &str) -> Result<Handle> {
        let idx = self.sink_index(sink)?;
        self.sinks[idx].open(&mut self.conns, addr).inspect_err(|e| {
            warn!(sink, addr, error = %e, "open failed");
        })
    }

    /// Closes a connection and drops all routing state that refers to it.
    pub fn close(&mut self, handle: Handle) -> Result<()> {
        let idx = self.owner_index(handle)?;
        self.sinks[idx].close(&mut self.conns, handle)?;
        self.reap();
        Ok(())
    }

    /// Applies transport-specific control to a connection.
    pub fn ioctl(&mut self, handle: Handle, cmd: &Ioctl) -> Result<()> {
        let idx = self.owner_index(handle)?;
        self.sinks[idx].ioctl(handle, cmd)
    }

    /// Queues bytes for a connection; they go out on the next poll.
    pub fn send(&mut self, handle: Handle, bytes: &[u8]) -> Result<usize> {
        let conn = self
            .conns
            .get_mut(handle)
            .ok_or(Error::UnknownHandle(handle))?;
        Ok(conn.tx.write(bytes))
    }

    /// Reads straight from a connection's transport, bypassing the
    /// decoder.
    pub fn recv(&mut self, handle: Handle, buf: &mut [u8]) -> Result<usize> {
        let idx = self.owner_index(handle)?;
        self.sinks[idx].recv(handle, buf)
    }

    /// Registered services.
    pub fn services(&self) -> &[Service] {
        &self.services
    }

    /// Topics with at least one subscriber.
    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    /// Requests received and not yet answered.
    pub fn pending_requests(&self) -> &[PendingRequest] {
        &self.requests
    }

    /// Looks up a connection.
    pub fn connection(&self, handle: Handle) -> Option<&Connection> {
        self.conns.get(handle)
    }

    /// Every open connection.
    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.conns.iter()
    }

    /// Runs one cycle.
    ///
    /// Without an idle backoff, `timeout` is split evenly between the sinks
    /// as their readiness wait. With one, sinks are polled without waiting
    /// and the cycle ends with the adaptive sleep instead.
    ///
    /// A sink whose wait fails does not stop the cycle; the first such
    /// error is returned once the cycle completes.
    pub fn poll(&mut self, timeout: Duration) -> Result<()> {
        self.flush();
        let failure = self.poll_sinks(timeout);
        self.reap();

        let active = self.drain();
        self.handle_requests();
        self.handle_responses();
        self.handle_messages();
        self.expire_services();

        self.flush();
        self.reap();
        self.backoff(active);

        failure.map_or(Ok(()), Err)
    }

    fn sink_index(&self, name: &str) -> Result<usize> {
        self.sinks
            .iter()
            .position(|s| s.name() == name)
            .ok_or_else(|| Error::UnknownSink(name.to_owned()))
    }

    fn owner_index(&self, handle: Handle) -> Result<usize> {
        let conn = self
            .conns
            .get(handle)
            .ok_or(Error::UnknownHandle(handle))?;
        self.sink_index(conn.sink())
    }

    fn poll_sinks(&mut self, timeout: Duration) -> Option<Error> {
        let slice = if self.config.idle_backoff_ms.is_some() || self.sinks.is_empty() {
            Duration::ZERO
        } else {
            timeout / u32::try_from(self.sinks.len()).unwrap_or(u32::MAX)
        };
        let mut failure = None;
        for sink in &mut self.sinks {
            if let Err(e) = sink.poll(&mut self.conns, slice) {
                warn!(sink = sink.name(), error = %e, "poll failed");
                failure.get_or_insert(e);
            }
        }
        failure
    }

    /// Sleeps between a tenth of the idle bound and the bound itself,
    /// growing while nothing arrives and resetting on any traffic.
    fn backoff(&mut self, active: bool) {
        let Some(max) = self.config.idle_backoff() else {
            return;
        };
        let step = max / 10;
        if active {
            self.idle = step;
            return;
        }
        self.idle = (self.idle + step).clamp(step, max);
        std::thread::sleep(self.idle);
    }

    /// Writes queued output; a connection whose send fails is destroyed.
    fn flush(&mut self) {
        let queued: Vec<Handle> = self
            .conns
            .iter()
            .filter(|c| !c.tx.is_empty())
            .map(Connection::handle)
            .collect();
        for handle in queued {
            let Some(conn) = self.conns.get_mut(handle) else {
                continue;
            };
            let Some(sink) = self.sinks.iter_mut().find(|s| s.name() == conn.sink()) else {
                continue;
            };
            match sink.send(handle, conn.tx.readable()) {
                Ok(n) => {
                    conn.tx.read_advance(n);
                    conn.tx.tidy();
                }
                Err(e) => {
                    warn!(sink = sink.name(), handle, error = %e, "send failed, closing");
                    if sink.close(&mut self.conns, handle).is_err() {
                        self.conns.remove(handle);
                    }
                }
            }
        }
    }

    /// Drops routing state of connections that went away.
    fn reap(&mut self) {
        for handle in self.conns.take_closed() {
            debug!(handle, "connection closed");
            self.services.retain(|s| {
                let keep = s.owner != handle;
                if !keep {
                    info!(header = %s.header, handle, "service dropped with its connection");
                }
                keep
            });
            for topic in &mut self.topics {
                topic.unsubscribe(handle);
            }
            self.topics.retain(|t| !t.subscribers.is_empty());
            self.requests.retain(|r| r.caller != handle);
            self.responses.retain(|(from, _)| *from != handle);
            self.messages.retain(|(from, _)| *from != handle);
        }
    }

    /// Decodes every complete frame in every receive buffer. Returns
    /// whether any connection received bytes since the previous cycle.
    fn drain(&mut self) -> bool {
        let grace = self.config.parse_grace();
        let mut active = false;
        let mut decoded = Vec::new();

        for conn in self.conns.iter_mut() {
            active |= conn.take_fresh();
            if conn.is_listening() {
                continue;
            }
            let handle = conn.handle();
            while !conn.rx.is_empty() {
                match read_one_packet(conn.rx.readable()) {
                    Decoded::Packet(packet) => {
                        conn.rx.read_advance(packet.len());
                        decoded.push((handle, packet));
                    }
                    Decoded::NeedMoreData => {
                        if conn.last_recv().elapsed() <= grace {
                            break;
                        }
                        let discard = skip_len(conn.rx.readable());
                        warn!(handle, discard, "stale partial frame discarded");
                        conn.rx.read_advance(discard);
                    }
                    Decoded::Malformed { discard } => {
                        warn!(handle, discard, "malformed bytes discarded");
                        conn.rx.read_advance(discard);
                    }
                }
            }
            conn.rx.tidy();
        }

        for (handle, packet) in decoded {
            self.classify(handle, packet);
        }
        active
    }

    fn classify(&mut self, from: Handle, packet: Packet) {
        debug!(handle = from, ?packet, "received");
        match packet.leader() {
            Leader::Request => self.requests.push(PendingRequest::new(from, packet)),
            Leader::Response => self.responses.push((from, packet)),
            _ => self.messages.push((from, packet)),
        }
    }

    /// Queues `bytes` on a connection's transmit buffer.
    fn enqueue(&mut self, handle: Handle, bytes: &[u8]) {
        match self.conns.get_mut(handle) {
            Some(conn) => {
                conn.tx.write(bytes);
            }
            None => debug!(handle, "destination gone, dropping"),
        }
    }

    /// Sends a status reply as a Response frame.
    fn reply(&mut self, to: Handle, reqid: u16, reqcrc16: u16, header: &str, status: Status) {
        let body = status.body();
        match self.encoder.response(reqid, reqcrc16, header, &body) {
            Ok(packet) => self.enqueue(to, packet.as_bytes()),
            Err(e) => warn!(handle = to, header, error = %e, "cannot encode reply"),
        }
    }

    fn reply_to(&mut self, req: &PendingRequest, status: Status) {
        self.reply(req.caller, req.reqid(), req.crc, req.header(), status);
    }

    fn handle_requests(&mut self) {
        let now = Instant::now();
        let timeout = self.config.request_timeout();
        let mut kept = Vec::with_capacity(self.requests.len());
        let mut in_flight: BTreeSet<u16> = self
            .requests
            .iter()
            .filter(|r| r.state == RequestState::WaitingResponse)
            .map(|r| r.forward_id)
            .collect();

        for mut req in std::mem::take(&mut self.requests) {
            match req.state {
                RequestState::WaitingResponse => {
                    if req.is_overdue(now, timeout) {
                        warn!(handle = req.caller, header = req.header(), "request timed out");
                        self.reply_to(&req, Status::RequestTimeout);
                    } else {
                        kept.push(req);
                    }
                }
                RequestState::None => match req.header() {
                    SERVICE_ADD => self.service_add(&req),
                    SERVICE_DEL => self.service_del(&req),
                    SERVICE_ALIVE => self.service_alive(&req),
                    _ => {
                        if self.dispatch(&mut req, now, &mut in_flight) {
                            kept.push(req);
                        }
                    }
                },
            }
        }

        // Nothing can add requests while routing, but keep arrival order
        // if that ever changes.
        kept.append(&mut self.requests);
        self.requests = kept;
    }

    /// Next nonzero request id not held by a request in flight.
    fn alloc_forward_id(&mut self, in_flight: &mut BTreeSet<u16>) -> Option<u16> {
        for _ in 0..u16::MAX {
            self.last_forward_id = self.last_forward_id.checked_add(1).unwrap_or(1);
            if in_flight.insert(self.last_forward_id) {
                return Some(self.last_forward_id);
            }
        }
        None
    }

    /// Forwards a request to its service. Returns whether it now waits for
    /// a response.
    fn dispatch(
        &mut self,
        req: &mut PendingRequest,
        now: Instant,
        in_flight: &mut BTreeSet<u16>,
    ) -> bool {
        let Some(owner) = self
            .services
            .iter()
            .find(|s| s.header == req.header())
            .map(|s| s.owner)
        else {
            debug!(handle = req.caller, header = req.header(), "no such service");
            self.reply_to(req, Status::ServiceNotFound);
            return false;
        };

        let Some(forward_id) = self.alloc_forward_id(in_flight) else {
            warn!(handle = req.caller, "every request id is in flight");
            self.reply_to(req, Status::Failed);
            return false;
        };
        match self.encoder.with_reqid(&req.packet, forward_id) {
            Ok(forward) => self.enqueue(owner, forward.as_bytes()),
            Err(e) => {
                warn!(handle = req.caller, error = %e, "cannot re-encode request");
                in_flight.remove(&forward_id);
                self.reply_to(req, Status::Failed);
                return false;
            }
        }
        debug!(
            from = req.caller,
            to = owner,
            forward_id,
            header = req.header(),
            "request dispatched"
        );
        req.forward_id = forward_id;
        req.state = RequestState::WaitingResponse;
        req.sent = Some(now);
        true
    }

    fn service_add(&mut self, req: &PendingRequest) {
        let status = match header_field(req.packet.data(), "/header") {
            Some(header) if header.starts_with('/') => {
                if self.services.iter().any(|s| s.header == header) {
                    Status::DupService
                } else {
                    info!(handle = req.caller, header = %header, "service registered");
                    self.services.push(Service {
                        header,
                        owner: req.caller,
                        last_alive: Instant::now(),
                    });
                    Status::Ok
                }
            }
            _ => Status::Failed,
        };
        self.reply_to(req, status);
    }

    fn service_del(&mut self, req: &PendingRequest) {
        let status = match self.find_owned(req) {
            Ok(idx) => {
                let svc = self.services.remove(idx);
                info!(handle = req.caller, header = %svc.header, "service removed");
                Status::Ok
            }
            Err(status) => status,
        };
        self.reply_to(req, status);
    }

    fn service_alive(&mut self, req: &PendingRequest) {
        let status = match self.find_owned(req) {
            Ok(idx) => {
                self.services[idx].last_alive = Instant::now();
                Status::Ok
            }
            Err(status) => status,
        };
        self.reply_to(req, status);
    }

    /// Index of the service named in a control request, if the caller
    /// owns it.
    fn find_owned(&self, req: &PendingRequest) -> std::result::Result<usize, Status> {
        let header = header_field(req.packet.data(), "/header").ok_or(Status::Failed)?;
        let idx = self
            .services
            .iter()
            .position(|s| s.header == header)
            .ok_or(Status::ServiceNotFound)?;
        if self.services[idx].owner != req.caller {
            return Err(Status::Failed);
        }
        Ok(idx)
    }

    fn handle_responses(&mut self) {
        for (from, resp) in std::mem::take(&mut self.responses) {
            let Some(idx) = self.requests.iter().position(|r| r.answered_by(&resp)) else {
                debug!(handle = from, header = resp.header(), "unmatched response dropped");
                continue;
            };
            let req = self.requests.remove(idx);
            match self.encoder.with_reqid(&resp, req.reqid()) {
                Ok(back) => self.enqueue(req.caller, back.as_bytes()),
                Err(e) => warn!(handle = from, error = %e, "cannot re-encode response"),
            }
            if let Some(svc) = self
                .services
                .iter_mut()
                .find(|s| s.owner == from && s.header == resp.header())
            {
                svc.last_alive = Instant::now();
            }
            debug!(from, to = req.caller, header = resp.header(), "response delivered");
        }
    }

    fn handle_messages(&mut self) {
        for (from, msg) in std::mem::take(&mut self.messages) {
            match msg.leader() {
                Leader::Subscribe => self.subscribe(from, &msg),
                Leader::Unsubscribe => self.unsubscribe(from, &msg),
                Leader::Publish => self.publish(from, &msg),
                _ => {}
            }
        }
    }

    fn subscribe(&mut self, from: Handle, msg: &Packet) {
        let max = self.config.max_subscribers;
        let idx = match self.topics.iter().position(|t| t.header == msg.header()) {
            Some(idx) => idx,
            None => {
                self.topics.push(Topic {
                    header: msg.header().to_owned(),
                    subscribers: Vec::new(),
                });
                self.topics.len() - 1
            }
        };
        let topic = &mut self.topics[idx];
        let status = if topic.subscribers.contains(&from) {
            Status::Ok
        } else if topic.subscribers.len() >= max {
            warn!(handle = from, header = msg.header(), max, "topic is full");
            Status::TooManySubscribers
        } else {
            topic.subscribers.push(from);
            debug!(handle = from, header = msg.header(), "subscribed");
            Status::Ok
        };
        self.topics.retain(|t| !t.subscribers.is_empty());
        self.reply(from, 0, msg.crc16(), msg.header(), status);
    }

    fn unsubscribe(&mut self, from: Handle, msg: &Packet) {
        if let Some(topic) = self.topics.iter_mut().find(|t| t.header == msg.header()) {
            if topic.unsubscribe(from) {
                debug!(handle = from, header = msg.header(), "unsubscribed");
            }
        }
        self.topics.retain(|t| !t.subscribers.is_empty());
        self.reply(from, 0, msg.crc16(), msg.header(), Status::Ok);
    }

    fn publish(&mut self, from: Handle, msg: &Packet) {
        let Some(topic) = self.topics.iter().find(|t| t.header == msg.header()) else {
            debug!(handle = from, header = msg.header(), "publish to unknown topic");
            return;
        };
        for handle in topic.subscribers.clone() {
            self.enqueue(handle, msg.as_bytes());
        }
    }

    fn expire_services(&mut self) {
        let now = Instant::now();
        let timeout = self.config.service_alive_timeout();
        let (expired, alive): (Vec<Service>, Vec<Service>) = std::mem::take(&mut self.services)
            .into_iter()
            .partition(|s| now.saturating_duration_since(s.last_alive) > timeout);
        self.services = alive;
        for svc in expired {
            info!(handle = svc.owner, header = %svc.header, "service expired");
            self.reply(svc.owner, 0, 0, &svc.header, Status::ServiceExpired);
        }
    }
}
