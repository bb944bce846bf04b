//! Frame encoder, decoder and stream resynchronization.
//!
//! A frame is `[metadata]:[header][data]\0[crc16]\0` where the metadata
//! length field counts every byte of the frame. The decoder trusts nothing:
//! the length must land exactly on the sentinel and the trailer CRC must
//! match, otherwise the frame is reported as malformed together with the
//! number of bytes to drop before the next plausible frame start.

use std::fmt::Write as _;

use crate::crc16::crc16;
use crate::error::{Error, Result};
use crate::packet::{Fragment, Leader, MAX_FRAME_LEN, Packet, SEQNO_HIGH};

/// `\0` + four hex digits + `\0`.
const TRAILER_LEN: usize = 6;

/// Outcome of [`read_one_packet`].
#[derive(Debug)]
pub enum Decoded {
    /// A complete frame; consume [`Packet::len`] bytes.
    Packet(Packet),
    /// The bytes so far are a plausible frame prefix.
    NeedMoreData,
    /// The buffer does not start with a valid frame; drop `discard` bytes.
    Malformed {
        /// Bytes to discard before the next plausible frame start
        /// (the whole buffer if there is none).
        discard: usize,
    },
}

/// Builds outgoing frames, numbering them with a wrapping sequence.
#[derive(Debug, Default, Clone, Copy)]
pub struct Encoder {
    /// Sequence number for the next frame.
    seqno: u16,
}

impl Encoder {
    /// Creates an encoder starting at sequence number zero.
    pub const fn new() -> Self {
        Self { seqno: 0 }
    }

    /// Encodes a Request for `header` carrying `reqid`.
    pub fn request(&mut self, reqid: u16, header: &str, data: &str) -> Result<Packet> {
        self.write(Leader::Request, reqid, 0, header, data.as_bytes())
    }

    /// Encodes a Response to a request whose checksum was `reqcrc16`.
    pub fn response(
        &mut self,
        reqid: u16,
        reqcrc16: u16,
        header: &str,
        data: &str,
    ) -> Result<Packet> {
        self.write(Leader::Response, reqid, reqcrc16, header, data.as_bytes())
    }

    /// Encodes a Subscribe with subscriber control options in `ctrl`.
    pub fn subscribe(&mut self, header: &str, ctrl: &str) -> Result<Packet> {
        self.write(Leader::Subscribe, 0, 0, header, ctrl.as_bytes())
    }

    /// Encodes an Unsubscribe.
    pub fn unsubscribe(&mut self, header: &str) -> Result<Packet> {
        self.write(Leader::Unsubscribe, 0, 0, header, b"{}")
    }

    /// Encodes a Publish.
    pub fn publish(&mut self, header: &str, data: &str) -> Result<Packet> {
        self.write(Leader::Publish, 0, 0, header, data.as_bytes())
    }

    /// Re-encodes `packet` with a different request id, keeping everything
    /// else (and therefore its payload checksum).
    pub fn with_reqid(&mut self, packet: &Packet, reqid: u16) -> Result<Packet> {
        self.write(
            packet.leader,
            reqid,
            packet.reqcrc16,
            &packet.header,
            &packet.data,
        )
    }

    fn next_seqno(&mut self) -> u16 {
        let seqno = self.seqno;
        self.seqno = (self.seqno + 1) % SEQNO_HIGH;
        seqno
    }

    fn write(
        &mut self,
        leader: Leader,
        reqid: u16,
        reqcrc16: u16,
        header: &str,
        data: &[u8],
    ) -> Result<Packet> {
        check_header(header)?;
        check_data(data)?;

        let seqno = self.next_seqno();
        let fragment = Fragment::End;

        // The length field is fixed width, so a first pass with a
        // placeholder yields the final size.
        let len = metadata(leader, seqno, fragment, 0, reqid, reqcrc16).len()
            + header.len()
            + data.len()
            + TRAILER_LEN;
        if len > MAX_FRAME_LEN {
            return Err(Error::FrameTooLong {
                len,
                max: MAX_FRAME_LEN,
            });
        }
        #[allow(clippy::cast_possible_truncation)]
        let mut body = metadata(leader, seqno, fragment, len as u16, reqid, reqcrc16);
        body.push_str(header);

        let mut raw = body.into_bytes();
        raw.extend_from_slice(data);
        let crc = crc16(&raw);
        raw.push(0);
        raw.extend_from_slice(format!("{crc:04x}").as_bytes());
        raw.push(0);
        debug_assert_eq!(raw.len(), len);

        Ok(Packet {
            leader,
            fragment,
            seqno,
            reqid: if leader.has_reqid() { reqid } else { 0 },
            reqcrc16: if leader == Leader::Response {
                reqcrc16
            } else {
                0
            },
            header: header.to_owned(),
            data: data.to_vec(),
            raw,
        })
    }
}

/// Everything up to and including the `:` delimiter, plus the echoed
/// request checksum for responses.
fn metadata(
    leader: Leader,
    seqno: u16,
    fragment: Fragment,
    len: u16,
    reqid: u16,
    reqcrc16: u16,
) -> String {
    let mut s = String::with_capacity(24);
    s.push(char::from(leader.as_byte()));
    // Writing to a String cannot fail.
    let _ = write!(s, "{seqno:x},{},{len:04x}", char::from(fragment.as_byte()));
    if leader.has_reqid() {
        let _ = write!(s, ",{reqid:04x}");
    }
    s.push(':');
    if leader == Leader::Response {
        let _ = write!(s, "{reqcrc16:04x}");
    }
    s
}

fn check_header(header: &str) -> Result<()> {
    if !header.starts_with('/') || header.contains(['{', '\0']) {
        return Err(Error::InvalidHeader(header.to_owned()));
    }
    Ok(())
}

fn check_data(data: &[u8]) -> Result<()> {
    if data.first() != Some(&b'{') {
        return Err(Error::InvalidData("payload must start with '{'"));
    }
    if data.contains(&0) {
        return Err(Error::InvalidData("payload contains a NUL byte"));
    }
    Ok(())
}

/// Decodes the frame at the start of `buf`.
///
/// On [`Decoded::Packet`] the caller consumes `packet.len()` bytes; on
/// [`Decoded::Malformed`] it drops `discard` bytes and tries again.
pub fn read_one_packet(buf: &[u8]) -> Decoded {
    match parse(buf) {
        Ok(packet) => Decoded::Packet(packet),
        Err(Fail::Incomplete) => Decoded::NeedMoreData,
        Err(Fail::Invalid) => Decoded::Malformed {
            discard: skip_len(buf),
        },
    }
}

/// Offset of the first plausible frame start at or after `from`.
///
/// A plausible start is a leader byte followed by a hex digit that is not
/// itself preceded by the same leader byte.
pub fn next_packet_offset(buf: &[u8], from: usize) -> Option<usize> {
    (from..buf.len().saturating_sub(1)).find(|&i| {
        let b = buf[i];
        Leader::from_byte(b).is_some()
            && buf[i + 1].is_ascii_hexdigit()
            && (i == 0 || buf[i - 1] != b)
    })
}

/// Bytes to drop from a buffer whose head is not a valid frame.
pub fn skip_len(buf: &[u8]) -> usize {
    next_packet_offset(buf, 1).unwrap_or(buf.len())
}

/// Why a parse attempt stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fail {
    /// Ran out of bytes while everything seen so far was valid.
    Incomplete,
    /// Found a byte that no valid frame could contain here.
    Invalid,
}

/// Forward-only reader over the metadata prefix.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn byte(&mut self) -> std::result::Result<u8, Fail> {
        let b = *self.buf.get(self.pos).ok_or(Fail::Incomplete)?;
        self.pos += 1;
        Ok(b)
    }

    fn expect(&mut self, want: u8) -> std::result::Result<(), Fail> {
        if self.byte()? == want {
            Ok(())
        } else {
            Err(Fail::Invalid)
        }
    }

    /// Exactly `n` hex digits.
    fn hex_fixed(&mut self, n: usize) -> std::result::Result<u16, Fail> {
        let mut v = 0u16;
        for _ in 0..n {
            v = (v << 4) | hex_value(self.byte()?)?;
        }
        Ok(v)
    }

    /// One to four hex digits terminated by `end` (consumed).
    fn hex_until(&mut self, end: u8) -> std::result::Result<u16, Fail> {
        let mut v = 0u16;
        let mut digits = 0;
        loop {
            let b = self.byte()?;
            if b == end && digits > 0 {
                return Ok(v);
            }
            if digits == 4 {
                return Err(Fail::Invalid);
            }
            v = (v << 4) | hex_value(b)?;
            digits += 1;
        }
    }
}

fn hex_value(b: u8) -> std::result::Result<u16, Fail> {
    char::from(b)
        .to_digit(16)
        .and_then(|d| u16::try_from(d).ok())
        .ok_or(Fail::Invalid)
}

fn parse(buf: &[u8]) -> std::result::Result<Packet, Fail> {
    let mut c = Cursor { buf, pos: 0 };

    let leader = Leader::from_byte(c.byte()?).ok_or(Fail::Invalid)?;
    let seqno = c.hex_until(b',')?;
    let fragment = Fragment::from_byte(c.byte()?).ok_or(Fail::Invalid)?;
    c.expect(b',')?;
    let len = usize::from(c.hex_fixed(4)?);
    let reqid = if leader.has_reqid() {
        c.expect(b',')?;
        c.hex_fixed(4)?
    } else {
        0
    };
    c.expect(b':')?;
    let reqcrc16 = if leader == Leader::Response {
        c.hex_fixed(4)?
    } else {
        0
    };

    // header needs at least one byte, data at least "{}"
    if len > MAX_FRAME_LEN || len < c.pos + 3 + TRAILER_LEN {
        return Err(Fail::Invalid);
    }
    if buf.len() < len {
        return Err(Fail::Incomplete);
    }

    let frame = &buf[..len];
    let body_end = len - TRAILER_LEN;
    if frame[body_end] != 0 || frame[len - 1] != 0 {
        return Err(Fail::Invalid);
    }
    let crc = Cursor {
        buf: &frame[body_end + 1..len - 1],
        pos: 0,
    }
    .hex_fixed(4)
    // Only four bytes are available; running short means garbage.
    .map_err(|_| Fail::Invalid)?;
    if crc16(&frame[..body_end]) != crc {
        return Err(Fail::Invalid);
    }

    let rest = &frame[c.pos..body_end];
    if rest.contains(&0) {
        return Err(Fail::Invalid);
    }
    let brace = rest.iter().position(|&b| b == b'{').ok_or(Fail::Invalid)?;
    if rest[0] != b'/' {
        return Err(Fail::Invalid);
    }
    let header = std::str::from_utf8(&rest[..brace]).map_err(|_| Fail::Invalid)?;

    Ok(Packet {
        leader,
        fragment,
        seqno,
        reqid,
        reqcrc16,
        header: header.to_owned(),
        data: rest[brace..].to_vec(),
        raw: frame.to_vec(),
    })
}
