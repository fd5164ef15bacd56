use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol::error::{Error, Result};
use crate::protocol::{ProtocolHeader, ProtocolMessage};

/// Largest frame accepted from the wire (100 MB).
///
/// Anything bigger is treated as a corrupt length prefix rather than an
/// allocation request.
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Size of the length prefix written by [`Framer::encode`].
const PREFIX_LEN: usize = 5;

/// Wire framer for protocol messages.
///
/// # Wire Format
///
/// ```text
/// [MessagePack uint length] [header map] [body value]
/// ```
///
/// The length covers header and body but not itself. The encoder always
/// writes the 5-byte `0xce` form; the decoder accepts every MessagePack
/// unsigned integer form because servers are free to pick any of them.
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use iproto_common::protocol::{ProtocolHeader, RequestType};
/// use iproto_common::transport::Framer;
///
/// let header = ProtocolHeader::new(1, RequestType::Ping);
/// let frame = Framer::encode(&header, &Bytes::from_static(&[0x80])).unwrap();
///
/// let (message, consumed) = Framer::decode(&frame).unwrap().unwrap();
/// assert_eq!(consumed, frame.len());
/// assert_eq!(message.header, header);
/// ```
pub struct Framer;

impl Framer {
    /// Encodes a header and an already-encoded body into one frame.
    pub fn encode(header: &ProtocolHeader, body: &[u8]) -> Result<Bytes> {
        let mut encoded_header = Vec::with_capacity(16);
        rmpv::encode::write_value(&mut encoded_header, &header.to_value())?;

        let len = encoded_header.len() + body.len();
        let len = u32::try_from(len)
            .ok()
            .filter(|len| *len as usize <= MAX_FRAME_SIZE)
            .ok_or_else(|| Error::Framing(format!("frame of {} bytes is too large", len)))?;

        let mut buf = BytesMut::with_capacity(PREFIX_LEN + len as usize);
        buf.put_u8(0xce);
        buf.put_u32(len);
        buf.put_slice(&encoded_header);
        buf.put_slice(body);
        Ok(buf.freeze())
    }

    /// Decodes one frame from the front of `buf`.
    ///
    /// # Returns
    ///
    /// - `Ok(None)` when `buf` does not yet hold a complete frame
    /// - `Ok(Some((message, consumed)))` with the number of bytes the frame
    ///   occupied, prefix included
    ///
    /// # Errors
    ///
    /// Returns `Error::Framing` for an invalid length prefix, an oversized
    /// frame, a header that is not a valid header map, or a body that is
    /// truncated or followed by extra bytes inside the frame.
    pub fn decode(buf: &[u8]) -> Result<Option<(ProtocolMessage, usize)>> {
        let (len, prefix_len) = match Self::decode_length(buf)? {
            Some(parsed) => parsed,
            None => return Ok(None),
        };

        if len > MAX_FRAME_SIZE {
            return Err(Error::Framing(format!(
                "frame too large: {} bytes (max {} bytes)",
                len, MAX_FRAME_SIZE
            )));
        }

        let total = prefix_len + len;
        if buf.len() < total {
            return Ok(None);
        }

        let frame = &buf[prefix_len..total];
        let mut cursor = frame;
        let header_value = rmpv::decode::read_value(&mut cursor)
            .map_err(|e| Error::Framing(format!("truncated header: {}", e)))?;
        let header = ProtocolHeader::from_value(&header_value)?;

        let body_start = frame.len() - cursor.len();
        if !cursor.is_empty() {
            rmpv::decode::read_value(&mut cursor)
                .map_err(|e| Error::Framing(format!("truncated body: {}", e)))?;
            if !cursor.is_empty() {
                return Err(Error::Framing(format!(
                    "{} unexpected trailing bytes in frame",
                    cursor.len()
                )));
            }
        }

        let body = Bytes::copy_from_slice(&frame[body_start..]);
        Ok(Some((ProtocolMessage::new(header, body), total)))
    }

    /// Reads the MessagePack unsigned integer at the front of `buf`.
    ///
    /// Returns the frame length and the prefix size, or `None` if the prefix
    /// itself is incomplete.
    fn decode_length(buf: &[u8]) -> Result<Option<(usize, usize)>> {
        let marker = match buf.first() {
            Some(marker) => *marker,
            None => return Ok(None),
        };

        let width = match marker {
            0x00..=0x7f => return Ok(Some((marker as usize, 1))),
            0xcc => 1,
            0xcd => 2,
            0xce => 4,
            0xcf => 8,
            other => {
                return Err(Error::Framing(format!(
                    "invalid length prefix marker 0x{:02x}",
                    other
                )))
            }
        };

        if buf.len() < 1 + width {
            return Ok(None);
        }

        let len = buf[1..1 + width]
            .iter()
            .fold(0u64, |acc, byte| (acc << 8) | *byte as u64);
        let len = usize::try_from(len)
            .map_err(|_| Error::Framing(format!("frame length {} overflows", len)))?;
        Ok(Some((len, 1 + width)))
    }
}
