//! Routing state: pending requests, registered services and topics.

use std::time::{Duration, Instant};

use apix_proto::Packet;

use crate::conn::Handle;

/// Lifecycle of a [`PendingRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum RequestState {
    /// Received, not yet dispatched.
    None,
    /// Forwarded to a service, awaiting its response.
    WaitingResponse,
}

/// A request in flight.
#[derive(Debug)]
pub struct PendingRequest {
    pub(super) caller: Handle,
    pub(super) packet: Packet,
    pub(super) crc: u16,
    /// Request id carried by the forwarded copy; zero until dispatched.
    pub(super) forward_id: u16,
    pub(super) created: Instant,
    pub(super) sent: Option<Instant>,
    pub(super) state: RequestState,
}

impl PendingRequest {
    pub(super) fn new(caller: Handle, packet: Packet) -> Self {
        Self {
            caller,
            crc: packet.crc16(),
            packet,
            forward_id: 0,
            created: Instant::now(),
            sent: None,
            state: RequestState::None,
        }
    }

    /// Connection the request came from.
    pub const fn caller(&self) -> Handle {
        self.caller
    }

    /// Service header.
    pub fn header(&self) -> &str {
        self.packet.header()
    }

    /// Request id chosen by the caller.
    pub const fn reqid(&self) -> u16 {
        self.packet.reqid()
    }

    /// Checksum over header and data, echoed by the response.
    pub const fn crc16(&self) -> u16 {
        self.crc
    }

    /// Request id the service sees, unique among requests awaiting a
    /// response on this bus.
    pub const fn forward_id(&self) -> u16 {
        self.forward_id
    }

    /// Current state.
    pub const fn state(&self) -> RequestState {
        self.state
    }

    /// When the request arrived.
    pub const fn created(&self) -> Instant {
        self.created
    }

    /// When the request was forwarded to its service.
    pub const fn sent(&self) -> Option<Instant> {
        self.sent
    }

    /// A dispatched request whose response is overdue.
    pub(super) fn is_overdue(&self, now: Instant, timeout: Duration) -> bool {
        self.state == RequestState::WaitingResponse
            && self
                .sent
                .is_some_and(|t| now.saturating_duration_since(t) > timeout)
    }

    /// Whether a response with this header, echoed checksum and echoed
    /// request id answers this request.
    pub(super) fn answered_by(&self, response: &Packet) -> bool {
        self.state == RequestState::WaitingResponse
            && self.packet.header() == response.header()
            && self.crc == response.reqcrc16()
            && self.forward_id == response.reqid()
    }
}

/// An RPC endpoint bound to one connection.
#[derive(Debug, Clone)]
pub struct Service {
    pub(super) header: String,
    pub(super) owner: Handle,
    pub(super) last_alive: Instant,
}

impl Service {
    /// Header the service answers.
    pub fn header(&self) -> &str {
        &self.header
    }

    /// Connection serving it.
    pub const fn owner(&self) -> Handle {
        self.owner
    }

    /// Last sign of life.
    pub const fn last_alive(&self) -> Instant {
        self.last_alive
    }
}

/// A pub/sub channel.
#[derive(Debug, Clone)]
pub struct Topic {
    pub(super) header: String,
    pub(super) subscribers: Vec<Handle>,
}

impl Topic {
    /// Topic header.
    pub fn header(&self) -> &str {
        &self.header
    }

    /// Subscribed connections, in subscription order until one leaves.
    pub fn subscribers(&self) -> &[Handle] {
        &self.subscribers
    }

    /// Drops `handle`; returns whether it was subscribed.
    pub(super) fn unsubscribe(&mut self, handle: Handle) -> bool {
        match self.subscribers.iter().position(|&h| h == handle) {
            Some(i) => {
                self.subscribers.swap_remove(i);
                true
            }
            None => false,
        }
    }
}
