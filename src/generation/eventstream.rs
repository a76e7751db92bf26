//! Incremental decoder for the binary event-stream framing used by streaming model responses.
//!
//! Each message is laid out as:
//!
//! ```text
//! total length (u32) | headers length (u32) | prelude crc (u32) | headers | payload | message crc (u32)
//! ```
//!
//! All integers are big-endian. Headers are `name length (u8) | name | type (u8) | value`.
//! Both checksums are CRC-32: the prelude CRC covers the two length fields, the message
//! CRC covers everything before it.

use thiserror::Error;

const PRELUDE_LEN: usize = 12;
const TRAILER_LEN: usize = 4;
const MIN_MESSAGE_LEN: usize = PRELUDE_LEN + TRAILER_LEN;
const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

/// Framing errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventStreamError {
    /// Declared message length is outside the accepted bounds.
    #[error("invalid message length {0}")]
    InvalidLength(usize),
    /// Declared headers do not fit in the message.
    #[error("headers length {headers} exceeds message length {total}")]
    HeadersOverflow {
        /// Declared headers length.
        headers: usize,
        /// Declared total length.
        total: usize,
    },
    /// A header was cut short or used an unknown value type.
    #[error("malformed header: {0}")]
    MalformedHeader(String),
    /// The length fields do not match the prelude checksum.
    #[error("prelude checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    PreludeChecksum {
        /// Checksum carried in the prelude.
        expected: u32,
        /// Checksum of the received length fields.
        computed: u32,
    },
    /// The message bytes do not match the trailing checksum.
    #[error("message checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    MessageChecksum {
        /// Checksum carried in the trailer.
        expected: u32,
        /// Checksum of the received message.
        computed: u32,
    },
}

/// Decoded header value. Only string and byte-array values are retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    /// UTF-8 string value.
    String(String),
    /// Raw bytes value.
    Bytes(Vec<u8>),
    /// Any other typed value (booleans, integers, timestamps, uuids).
    Other,
}

/// One decoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMessage {
    /// Headers in wire order.
    pub headers: Vec<(String, HeaderValue)>,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

impl EventMessage {
    /// Look up a string header by name.
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.iter().find_map(|(key, value)| match value {
            HeaderValue::String(text) if key == name => Some(text.as_str()),
            _ => None,
        })
    }
}

/// Buffers partial network reads and yields complete messages.
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: Vec<u8>,
}

impl EventStreamDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes received from the network.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// True when no partial message is buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Pop the next complete message, if one is buffered.
    pub fn next_message(&mut self) -> Result<Option<EventMessage>, EventStreamError> {
        if self.buffer.len() < PRELUDE_LEN {
            return Ok(None);
        }
        verify_crc(&self.buffer[..8], read_u32(&self.buffer[8..12])).map_err(
            |(expected, computed)| EventStreamError::PreludeChecksum { expected, computed },
        )?;
        let total = read_u32(&self.buffer[0..4]) as usize;
        let headers_len = read_u32(&self.buffer[4..8]) as usize;
        if !(MIN_MESSAGE_LEN..=MAX_MESSAGE_LEN).contains(&total) {
            return Err(EventStreamError::InvalidLength(total));
        }
        if headers_len > total - MIN_MESSAGE_LEN {
            return Err(EventStreamError::HeadersOverflow {
                headers: headers_len,
                total,
            });
        }
        if self.buffer.len() < total {
            return Ok(None);
        }

        let frame: Vec<u8> = self.buffer.drain(..total).collect();
        let body_end = total - TRAILER_LEN;
        verify_crc(&frame[..body_end], read_u32(&frame[body_end..])).map_err(
            |(expected, computed)| EventStreamError::MessageChecksum { expected, computed },
        )?;
        let headers_end = PRELUDE_LEN + headers_len;
        let headers = parse_headers(&frame[PRELUDE_LEN..headers_end])?;
        let payload = frame[headers_end..body_end].to_vec();
        Ok(Some(EventMessage { headers, payload }))
    }
}

fn verify_crc(bytes: &[u8], expected: u32) -> Result<(), (u32, u32)> {
    let computed = crc32fast::hash(bytes);
    if computed == expected {
        Ok(())
    } else {
        Err((expected, computed))
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn parse_headers(mut bytes: &[u8]) -> Result<Vec<(String, HeaderValue)>, EventStreamError> {
    let mut headers = Vec::new();
    while !bytes.is_empty() {
        let name_len = usize::from(bytes[0]);
        let name = take(&mut bytes, 1 + name_len, "name")?;
        let name = String::from_utf8_lossy(&name[1..]).into_owned();
        let kind = take(&mut bytes, 1, &name)?[0];

        let value = match kind {
            0 | 1 => HeaderValue::Other,
            2 => skip(&mut bytes, 1, &name)?,
            3 => skip(&mut bytes, 2, &name)?,
            4 => skip(&mut bytes, 4, &name)?,
            5 | 8 => skip(&mut bytes, 8, &name)?,
            9 => skip(&mut bytes, 16, &name)?,
            6 | 7 => {
                let len_bytes = take(&mut bytes, 2, &name)?;
                let len = usize::from(u16::from_be_bytes([len_bytes[0], len_bytes[1]]));
                let raw = take(&mut bytes, len, &name)?.to_vec();
                if kind == 7 {
                    let text = String::from_utf8(raw)
                        .map_err(|_| EventStreamError::MalformedHeader(name.clone()))?;
                    HeaderValue::String(text)
                } else {
                    HeaderValue::Bytes(raw)
                }
            }
            _ => return Err(EventStreamError::MalformedHeader(name)),
        };
        headers.push((name, value));
    }
    Ok(headers)
}

fn take<'a>(bytes: &mut &'a [u8], len: usize, name: &str) -> Result<&'a [u8], EventStreamError> {
    if bytes.len() < len {
        return Err(EventStreamError::MalformedHeader(name.to_string()));
    }
    let (head, tail) = bytes.split_at(len);
    *bytes = tail;
    Ok(head)
}

fn skip(bytes: &mut &[u8], len: usize, name: &str) -> Result<HeaderValue, EventStreamError> {
    take(bytes, len, name)?;
    Ok(HeaderValue::Other)
}

/// Frame pre-encoded header bytes and a payload, computing both checksums.
#[cfg(test)]
pub(crate) fn frame_message(header_bytes: &[u8], payload: &[u8]) -> Vec<u8> {
    let total = MIN_MESSAGE_LEN + header_bytes.len() + payload.len();
    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&(total as u32).to_be_bytes());
    frame.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
    frame.extend_from_slice(&crc32fast::hash(&frame).to_be_bytes());
    frame.extend_from_slice(header_bytes);
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&crc32fast::hash(&frame).to_be_bytes());
    frame
}

/// Encode a message with string headers.
#[cfg(test)]
pub(crate) fn encode_message(headers: &[(&str, &str)], payload: &[u8]) -> Vec<u8> {
    let mut header_bytes = Vec::new();
    for (name, value) in headers {
        header_bytes.push(name.len() as u8);
        header_bytes.extend_from_slice(name.as_bytes());
        header_bytes.push(7);
        header_bytes.extend_from_slice(&(value.len() as u16).to_be_bytes());
        header_bytes.extend_from_slice(value.as_bytes());
    }
    frame_message(&header_bytes, payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_message_split_across_reads() {
        let frame = encode_message(
            &[(":message-type", "event"), (":event-type", "chunk")],
            br#"{"bytes":"e30="}"#,
        );
        let mut decoder = EventStreamDecoder::new();

        decoder.push(&frame[..5]);
        assert_eq!(decoder.next_message().expect("partial"), None);
        decoder.push(&frame[5..frame.len() - 1]);
        assert_eq!(decoder.next_message().expect("partial"), None);
        decoder.push(&frame[frame.len() - 1..]);

        let message = decoder.next_message().expect("decode").expect("message");
        assert_eq!(message.header_str(":event-type"), Some("chunk"));
        assert_eq!(message.header_str(":message-type"), Some("event"));
        assert_eq!(message.payload, br#"{"bytes":"e30="}"#.to_vec());
        assert!(decoder.is_empty());
    }

    #[test]
    fn decodes_back_to_back_messages() {
        let mut bytes = encode_message(&[(":event-type", "chunk")], b"one");
        bytes.extend(encode_message(&[(":event-type", "chunk")], b"two"));
        let mut decoder = EventStreamDecoder::new();
        decoder.push(&bytes);

        let first = decoder.next_message().expect("first").expect("message");
        let second = decoder.next_message().expect("second").expect("message");
        assert_eq!(first.payload, b"one");
        assert_eq!(second.payload, b"two");
        assert_eq!(decoder.next_message().expect("drained"), None);
    }

    #[test]
    fn skips_non_string_headers() {
        let mut headers = Vec::new();
        headers.push(4u8);
        headers.extend_from_slice(b"flag");
        headers.push(0);
        headers.push(3u8);
        headers.extend_from_slice(b"num");
        headers.push(4);
        headers.extend_from_slice(&42i32.to_be_bytes());

        let frame = frame_message(&headers, b"");

        let mut decoder = EventStreamDecoder::new();
        decoder.push(&frame);
        let message = decoder.next_message().expect("decode").expect("message");
        assert_eq!(message.headers.len(), 2);
        assert_eq!(message.headers[1], ("num".to_string(), HeaderValue::Other));
        assert!(message.payload.is_empty());
    }

    fn prelude(total: u32, headers: u32) -> Vec<u8> {
        let mut bytes = total.to_be_bytes().to_vec();
        bytes.extend_from_slice(&headers.to_be_bytes());
        bytes.extend_from_slice(&crc32fast::hash(&bytes).to_be_bytes());
        bytes
    }

    #[test]
    fn rejects_impossible_lengths() {
        let mut decoder = EventStreamDecoder::new();
        decoder.push(&prelude(4, 0));
        assert_eq!(
            decoder.next_message(),
            Err(EventStreamError::InvalidLength(4))
        );

        let mut decoder = EventStreamDecoder::new();
        decoder.push(&prelude(20, 10));
        assert_eq!(
            decoder.next_message(),
            Err(EventStreamError::HeadersOverflow {
                headers: 10,
                total: 20
            })
        );
    }

    #[test]
    fn corrupted_length_fails_prelude_checksum() {
        let mut frame = encode_message(&[(":event-type", "chunk")], b"payload");
        frame[3] ^= 0x01;
        let mut decoder = EventStreamDecoder::new();
        decoder.push(&frame);

        assert!(matches!(
            decoder.next_message(),
            Err(EventStreamError::PreludeChecksum { .. })
        ));
    }

    #[test]
    fn corrupted_payload_fails_message_checksum() {
        let mut frame = encode_message(&[(":event-type", "chunk")], b"payload");
        let last_payload_byte = frame.len() - TRAILER_LEN - 1;
        frame[last_payload_byte] ^= 0xff;
        let mut decoder = EventStreamDecoder::new();
        decoder.push(&frame);

        assert!(matches!(
            decoder.next_message(),
            Err(EventStreamError::MessageChecksum { .. })
        ));
    }

    #[test]
    fn zeroed_checksums_are_rejected() {
        let mut frame = encode_message(&[(":event-type", "chunk")], b"payload");
        frame[8..12].copy_from_slice(&[0; 4]);
        let mut decoder = EventStreamDecoder::new();
        decoder.push(&frame);

        assert!(decoder.next_message().is_err());
    }
}
