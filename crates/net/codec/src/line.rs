//! Newline-terminated lines inside varint frames, as used by the
//! multistream negotiation handshake.

use bytes::{BufMut, Bytes, BytesMut};

use crate::packet::{decode_varint, encode_varint, PacketError};

/// Maximum length of one line, trailing newline included.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Error from line encoding or decoding.
#[derive(Debug, thiserror::Error)]
pub enum LineError {
    #[error("line of {0} bytes exceeds the {MAX_LINE_LENGTH} byte maximum")]
    MaxLine(usize),
    #[error("malformed line")]
    InvalidLine,
    #[error("invalid line count")]
    InvalidLineCount,
    #[error("malformed line list")]
    InvalidLines,
    #[error(transparent)]
    Packet(#[from] PacketError),
}

/// Encode one line: append `\n` and wrap in a varint frame.
pub fn encode_line(line: &[u8]) -> Result<Bytes, LineError> {
    let framed_len = line.len() + 1;
    if framed_len > MAX_LINE_LENGTH {
        return Err(LineError::MaxLine(line.len()));
    }
    let mut out = BytesMut::with_capacity(framed_len + 2);
    out.put_slice(&encode_varint(framed_len as u64));
    out.put_slice(line);
    out.put_u8(b'\n');
    Ok(out.freeze())
}

/// Decode one varint-framed line; returns the line without its newline and
/// the unconsumed tail.
pub fn decode_line(input: &[u8]) -> Result<(Bytes, Bytes), LineError> {
    let (len, consumed) = decode_varint(input)?.ok_or(LineError::InvalidLine)?;
    let len = usize::try_from(len).map_err(|_| LineError::InvalidLine)?;
    if input.len() - consumed < len {
        return Err(LineError::InvalidLine);
    }
    let line = strip_line(&input[consumed..consumed + len])?;
    Ok((line, Bytes::copy_from_slice(&input[consumed + len..])))
}

/// Validate and trim an already-unframed `line\n` payload.
///
/// This is the shape a transport running the `[varint]` packet spec hands
/// to its handler: the frame length is consumed, the newline is not.
pub fn strip_line(payload: &[u8]) -> Result<Bytes, LineError> {
    if payload.len() > MAX_LINE_LENGTH {
        return Err(LineError::MaxLine(payload.len() - 1));
    }
    match payload.split_last() {
        Some((&b'\n', line)) => Ok(Bytes::copy_from_slice(line)),
        _ => Err(LineError::InvalidLine),
    }
}

/// Encode a list of lines: a varint count followed by each encoded line,
/// all inside one outer varint frame.
pub fn encode_lines<L: AsRef<[u8]>>(lines: &[L]) -> Result<Bytes, LineError> {
    let mut inner = BytesMut::new();
    inner.put_slice(&encode_varint(lines.len() as u64));
    for line in lines {
        inner.put_slice(&encode_line(line.as_ref())?);
    }
    let mut out = BytesMut::with_capacity(inner.len() + 2);
    out.put_slice(&encode_varint(inner.len() as u64));
    out.put_slice(&inner);
    Ok(out.freeze())
}

/// Decode a framed list of lines; returns the lines and the unconsumed tail.
pub fn decode_lines(input: &[u8]) -> Result<(Vec<Bytes>, Bytes), LineError> {
    let (total, consumed) = decode_varint(input)?.ok_or(LineError::InvalidLines)?;
    let total = usize::try_from(total).map_err(|_| LineError::InvalidLines)?;
    if input.len() - consumed < total {
        return Err(LineError::InvalidLines);
    }
    let tail = Bytes::copy_from_slice(&input[consumed + total..]);
    let inner = &input[consumed..consumed + total];

    let (count, consumed) = decode_varint(inner)?.ok_or(LineError::InvalidLineCount)?;
    let count = usize::try_from(count).map_err(|_| LineError::InvalidLineCount)?;
    let mut rest = Bytes::copy_from_slice(&inner[consumed..]);
    let mut lines = Vec::with_capacity(count);
    for _ in 0..count {
        let (line, remaining) = decode_line(&rest)?;
        lines.push(line);
        rest = remaining;
    }
    if !rest.is_empty() {
        return Err(LineError::InvalidLines);
    }
    Ok((lines, tail))
}
