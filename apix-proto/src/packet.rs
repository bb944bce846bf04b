//! Decoded protocol units.

use std::fmt;

use crate::crc16::crc16_update;

/// Maximum length of one frame, trailer included.
pub const MAX_FRAME_LEN: usize = 4096;

/// Sequence numbers wrap back to zero at this value.
pub const SEQNO_HIGH: u16 = 966;

/// Frame kind, identified by the first byte of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Leader {
    /// `>`: call a service.
    Request,
    /// `<`: answer to a request.
    Response,
    /// `#`: start receiving a topic.
    Subscribe,
    /// `%`: stop receiving a topic.
    Unsubscribe,
    /// `@`: send a message to a topic's subscribers.
    Publish,
}

impl Leader {
    /// Every leader, in wire-byte order of precedence.
    pub const ALL: [Self; 5] = [
        Self::Request,
        Self::Response,
        Self::Subscribe,
        Self::Unsubscribe,
        Self::Publish,
    ];

    /// The tag byte written on the wire.
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::Request => b'>',
            Self::Response => b'<',
            Self::Subscribe => b'#',
            Self::Unsubscribe => b'%',
            Self::Publish => b'@',
        }
    }

    /// Parses a tag byte.
    pub const fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'>' => Some(Self::Request),
            b'<' => Some(Self::Response),
            b'#' => Some(Self::Subscribe),
            b'%' => Some(Self::Unsubscribe),
            b'@' => Some(Self::Publish),
            _ => None,
        }
    }

    /// Request and Response frames carry a request id.
    pub const fn has_reqid(self) -> bool {
        matches!(self, Self::Request | Self::Response)
    }
}

/// Position of a frame within a fragmented payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
pub enum Fragment {
    /// `^`: first fragment.
    Begin,
    /// `0`: middle fragment.
    Middle,
    /// `$`: last (or only) fragment.
    #[default]
    End,
}

impl Fragment {
    /// The marker byte written on the wire.
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::Begin => b'^',
            Self::Middle => b'0',
            Self::End => b'$',
        }
    }

    /// Parses a marker byte.
    pub const fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'^' => Some(Self::Begin),
            b'0' => Some(Self::Middle),
            b'$' => Some(Self::End),
            _ => None,
        }
    }
}

/// One decoded (or freshly encoded) frame.
///
/// The serialized bytes are kept alongside the parsed fields so the bus can
/// forward a packet without re-encoding it.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    pub(crate) leader: Leader,
    pub(crate) fragment: Fragment,
    pub(crate) seqno: u16,
    pub(crate) reqid: u16,
    pub(crate) reqcrc16: u16,
    pub(crate) header: String,
    pub(crate) data: Vec<u8>,
    pub(crate) raw: Vec<u8>,
}

impl Packet {
    /// Frame kind.
    pub const fn leader(&self) -> Leader {
        self.leader
    }

    /// Fragment marker.
    pub const fn fragment(&self) -> Fragment {
        self.fragment
    }

    /// Sequence number assigned by the sender.
    pub const fn seqno(&self) -> u16 {
        self.seqno
    }

    /// Request id (zero for frames that carry none).
    pub const fn reqid(&self) -> u16 {
        self.reqid
    }

    /// For a Response, the checksum of the request it answers.
    pub const fn reqcrc16(&self) -> u16 {
        self.reqcrc16
    }

    /// Service or topic path.
    pub fn header(&self) -> &str {
        &self.header
    }

    /// Payload bytes, starting with `{`.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Payload as text, if it is valid UTF-8.
    pub fn data_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    /// Total frame length on the wire.
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Always `false`; a frame has at least a leader and a trailer.
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Serialized frame.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// Consumes the packet, returning the serialized frame.
    pub fn into_bytes(self) -> Vec<u8> {
        self.raw
    }

    /// Checksum over `header ++ data`.
    ///
    /// A Response echoes this value of its Request in
    /// [`reqcrc16`](Self::reqcrc16).
    pub fn crc16(&self) -> u16 {
        crc16_update(crc16_update(0, self.header.as_bytes()), &self.data)
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("leader", &self.leader)
            .field("seqno", &self.seqno)
            .field("reqid", &format_args!("{:04x}", self.reqid))
            .field("reqcrc16", &format_args!("{:04x}", self.reqcrc16))
            .field("header", &self.header)
            .field("data", &String::from_utf8_lossy(&self.data))
            .field("len", &self.raw.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leader_bytes_roundtrip() {
        for leader in Leader::ALL {
            assert_eq!(Leader::from_byte(leader.as_byte()), Some(leader));
        }
        assert_eq!(Leader::from_byte(b'!'), None);
    }

    #[test]
    fn only_rpc_frames_carry_reqid() {
        assert!(Leader::Request.has_reqid());
        assert!(Leader::Response.has_reqid());
        assert!(!Leader::Publish.has_reqid());
    }

    #[test]
    fn fragment_defaults_to_end() {
        assert_eq!(Fragment::default(), Fragment::End);
        assert_eq!(Fragment::from_byte(b'^'), Some(Fragment::Begin));
        assert_eq!(Fragment::from_byte(b'x'), None);
    }
}
