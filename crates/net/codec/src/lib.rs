//! Wire codecs for the stream runtime.
//!
//! Two layers live here: length-prefixed packet framing with configurable
//! header specs ([`packet`]), and the newline-terminated line discipline the
//! multistream handshake runs inside varint frames ([`line`]). Both are
//! pure: no I/O, no async.

mod line;
mod packet;

pub use line::{
    decode_line, decode_lines, encode_line, encode_lines, strip_line, LineError, MAX_LINE_LENGTH,
};
pub use packet::{
    decode_from, decode_packet, decode_varint, encode_packet, encode_varint, DecodeOutcome,
    FrameHead, LengthField, PacketError, PacketSpec,
};
