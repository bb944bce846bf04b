//! Wire protocol for the apix message bus.
//!
//! Frames are short, self-describing text records terminated by a NUL
//! sentinel and a CRC16 trailer, suitable for any byte stream that may
//! lose or corrupt bytes (serial lines as well as sockets):
//!
//! ```text
//! >[seqno],[^|0|$],[len],[reqid]:[header]{data}\0<crc16>\0            request
//! <[seqno],[^|0|$],[len],[reqid]:[reqcrc16][header]{data}\0<crc16>\0  response
//! #[seqno],[^|0|$],[len]:[topic]{ctrl}\0<crc16>\0                     subscribe
//! %[seqno],[^|0|$],[len]:[topic]{}\0<crc16>\0                         unsubscribe
//! @[seqno],[^|0|$],[len]:[topic]{data}\0<crc16>\0                     publish
//! ```
//!
//! `seqno` is 1–4 hex digits; `len`, `reqid`, `reqcrc16` and the trailing
//! `crc16` are exactly four hex digits. `len` covers the whole frame,
//! trailer included.
//!
//! [`Encoder`] produces [`Packet`]s, [`read_one_packet`] turns a byte
//! stream back into packets and tells the caller how much garbage to skip
//! when the stream is corrupt.

mod codec;
mod crc16;
mod error;
mod message;
mod packet;

pub use codec::{Decoded, Encoder, next_packet_offset, read_one_packet, skip_len};
pub use crc16::{crc16, crc16_update};
pub use error::{Error, Result};
pub use message::{Reply, Status, header_field};
pub use packet::{Fragment, Leader, MAX_FRAME_LEN, Packet, SEQNO_HIGH};
