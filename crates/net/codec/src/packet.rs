//! Length-prefixed packet framing with configurable header specs.

use bytes::{BufMut, Bytes, BytesMut};

/// A single length-field descriptor in a framing header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthField {
    /// Fixed-width unsigned, 1 byte.
    U8,
    /// Fixed-width unsigned, 2 bytes big-endian.
    U16,
    /// Fixed-width unsigned, 4 bytes big-endian.
    U32,
    /// Fixed-width unsigned, 8 bytes big-endian.
    U64,
    /// LEB128 unsigned varint.
    Varint,
}

impl LengthField {
    /// Width in bytes for fixed fields, `None` for varints.
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            Self::U8 => Some(1),
            Self::U16 => Some(2),
            Self::U32 => Some(4),
            Self::U64 => Some(8),
            Self::Varint => None,
        }
    }

    /// Largest value the field can carry.
    pub fn max_value(&self) -> u64 {
        match self {
            Self::U8 => u8::MAX as u64,
            Self::U16 => u16::MAX as u64,
            Self::U32 => u32::MAX as u64,
            Self::U64 | Self::Varint => u64::MAX,
        }
    }

    /// Fewest bytes an encoding of this field can occupy.
    fn min_width(&self) -> usize {
        self.fixed_width().unwrap_or(1)
    }
}

/// Ordered list of length fields forming a framing header.
///
/// The last field always carries the payload length; any preceding fields
/// are opaque metadata handed back to the caller on decode. An empty spec
/// means no framing header at all: the decoder yields the entire input as
/// one packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketSpec(Vec<LengthField>);

impl PacketSpec {
    /// Build a spec from header fields in wire order.
    pub fn new(fields: Vec<LengthField>) -> Self {
        Self(fields)
    }

    /// The single-varint spec used by multistream and most libp2p protocols.
    pub fn varint() -> Self {
        Self(vec![LengthField::Varint])
    }

    /// Header fields in wire order.
    pub fn fields(&self) -> &[LengthField] {
        &self.0
    }

    /// Whether the spec has no framing header.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<LengthField>> for PacketSpec {
    fn from(fields: Vec<LengthField>) -> Self {
        Self(fields)
    }
}

/// Error from packet encoding or decoding.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("length {value} overflows a {field:?} header field")]
    LengthOverflow { field: LengthField, value: u64 },
    #[error("spec expects {expected} metadata values, got {got}")]
    HeaderMismatch { expected: usize, got: usize },
    #[error("invalid varint: {0}")]
    Varint(unsigned_varint::decode::Error),
}

/// A decoded frame's header: field values plus the byte extents of the
/// header and payload within the source buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHead {
    /// Metadata header values (the payload-length field is omitted).
    pub headers: Vec<u64>,
    /// Bytes occupied by the encoded header.
    pub header_len: usize,
    /// Bytes occupied by the payload.
    pub payload_len: usize,
}

/// Outcome of a pure [`decode_packet`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// A complete frame with any unconsumed tail.
    Frame {
        /// Metadata header values.
        headers: Vec<u64>,
        /// Frame payload.
        payload: Bytes,
        /// Bytes following the frame.
        tail: Bytes,
    },
    /// Input stops short of a complete frame; `need` is a lower bound on
    /// the additional bytes required.
    Incomplete { need: usize },
}

enum Parsed {
    Frame(FrameHead),
    Short { need: usize },
}

/// Encode one packet: metadata header values (in spec order, excluding the
/// final payload-length field, which is computed) followed by the payload.
pub fn encode_packet(
    spec: &PacketSpec,
    headers: &[u64],
    payload: &[u8],
) -> Result<Bytes, PacketError> {
    let fields = spec.fields();
    if fields.is_empty() {
        if !headers.is_empty() {
            return Err(PacketError::HeaderMismatch {
                expected: 0,
                got: headers.len(),
            });
        }
        return Ok(Bytes::copy_from_slice(payload));
    }
    if headers.len() + 1 != fields.len() {
        return Err(PacketError::HeaderMismatch {
            expected: fields.len() - 1,
            got: headers.len(),
        });
    }

    let mut out = BytesMut::with_capacity(fields.len() * 2 + payload.len());
    for (idx, field) in fields.iter().enumerate() {
        let value = if idx + 1 == fields.len() {
            payload.len() as u64
        } else {
            headers[idx]
        };
        if value > field.max_value() {
            return Err(PacketError::LengthOverflow {
                field: *field,
                value,
            });
        }
        match field {
            LengthField::U8 => out.put_u8(value as u8),
            LengthField::U16 => out.put_u16(value as u16),
            LengthField::U32 => out.put_u32(value as u32),
            LengthField::U64 => out.put_u64(value),
            LengthField::Varint => {
                let mut buf = unsigned_varint::encode::u64_buffer();
                out.put_slice(unsigned_varint::encode::u64(value, &mut buf));
            }
        }
    }
    out.put_slice(payload);
    Ok(out.freeze())
}

/// Decode one packet from `input`, returning the frame and tail or an
/// incompleteness hint.
pub fn decode_packet(spec: &PacketSpec, input: Bytes) -> Result<DecodeOutcome, PacketError> {
    match parse_frame(spec, &input)? {
        Parsed::Frame(head) => {
            let payload_end = head.header_len + head.payload_len;
            Ok(DecodeOutcome::Frame {
                headers: head.headers,
                payload: input.slice(head.header_len..payload_end),
                tail: input.slice(payload_end..),
            })
        }
        Parsed::Short { need } => Ok(DecodeOutcome::Incomplete { need }),
    }
}

/// Decode one packet header from the front of a streaming buffer.
///
/// Returns `Ok(None)` while the buffer stops short of a full frame. On
/// `Some`, the caller consumes `header_len` then `payload_len` bytes.
pub fn decode_from(spec: &PacketSpec, src: &[u8]) -> Result<Option<FrameHead>, PacketError> {
    match parse_frame(spec, src)? {
        Parsed::Frame(head) => Ok(Some(head)),
        Parsed::Short { .. } => Ok(None),
    }
}

fn parse_frame(spec: &PacketSpec, src: &[u8]) -> Result<Parsed, PacketError> {
    let fields = spec.fields();
    if fields.is_empty() {
        // Header-less framing: the whole buffer is one packet. An empty
        // buffer is incomplete, never an empty frame.
        if src.is_empty() {
            return Ok(Parsed::Short { need: 1 });
        }
        return Ok(Parsed::Frame(FrameHead {
            headers: Vec::new(),
            header_len: 0,
            payload_len: src.len(),
        }));
    }

    let mut values = Vec::with_capacity(fields.len());
    let mut offset = 0usize;
    for (idx, field) in fields.iter().enumerate() {
        let rest = &src[offset..];
        let remaining_min: usize = fields[idx + 1..].iter().map(LengthField::min_width).sum();
        match field.fixed_width() {
            Some(width) => {
                if rest.len() < width {
                    return Ok(Parsed::Short {
                        need: width - rest.len() + remaining_min,
                    });
                }
                let mut value = 0u64;
                for byte in &rest[..width] {
                    value = value << 8 | *byte as u64;
                }
                values.push(value);
                offset += width;
            }
            None => match decode_varint(rest)? {
                Some((value, consumed)) => {
                    values.push(value);
                    offset += consumed;
                }
                None => {
                    return Ok(Parsed::Short {
                        need: 1 + remaining_min,
                    });
                }
            },
        }
    }

    let payload_len = values.pop().expect("spec is non-empty");
    let payload_len = usize::try_from(payload_len).map_err(|_| PacketError::LengthOverflow {
        field: *fields.last().expect("spec is non-empty"),
        value: payload_len,
    })?;
    let avail = src.len() - offset;
    if avail < payload_len {
        return Ok(Parsed::Short {
            need: payload_len - avail,
        });
    }
    Ok(Parsed::Frame(FrameHead {
        headers: values,
        header_len: offset,
        payload_len,
    }))
}

/// Encode an unsigned LEB128 varint.
pub fn encode_varint(value: u64) -> Bytes {
    let mut buf = unsigned_varint::encode::u64_buffer();
    Bytes::copy_from_slice(unsigned_varint::encode::u64(value, &mut buf))
}

/// Decode an unsigned LEB128 varint from the front of `src`.
///
/// Returns `Ok(None)` on short input, `(value, bytes_consumed)` otherwise.
pub fn decode_varint(src: &[u8]) -> Result<Option<(u64, usize)>, PacketError> {
    match unsigned_varint::decode::u64(src) {
        Ok((value, rest)) => Ok(Some((value, src.len() - rest.len()))),
        Err(unsigned_varint::decode::Error::Insufficient) => Ok(None),
        Err(e) => Err(PacketError::Varint(e)),
    }
}
