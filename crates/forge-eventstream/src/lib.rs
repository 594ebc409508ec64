//! Binary event-stream framing (component C4, wire layout §6.4).
//!
//! Frames are self-delimited by a 12-byte prelude; the [`FrameCodec`]
//! implements `tokio_util::codec::{Decoder, Encoder}` so a transport's byte
//! stream can be turned into a `Stream<Item = Frame>` with ordinary
//! `tokio_util::codec::Framed`, giving us the one-chunk-of-backpressure
//! behavior for free instead of hand-rolling a reader loop.

use bytes::{BufMut, Bytes, BytesMut};
use forge_error::{ErrorKind, RuntimeError};
use tokio_util::codec::{Decoder, Encoder};

pub const MAX_TOTAL_LEN: u32 = 16 * 1024 * 1024;
pub const MAX_HEADERS_LEN: u32 = 128 * 1024;

const PRELUDE_LEN: usize = 12;
const TRAILING_CRC_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    ByteArray(Bytes),
    String(String),
    Timestamp(i64),
    Uuid(uuid::Uuid),
}

impl HeaderValue {
    fn type_byte(&self) -> u8 {
        match self {
            HeaderValue::Bool(true) => 0,
            HeaderValue::Bool(false) => 1,
            HeaderValue::Byte(_) => 2,
            HeaderValue::Short(_) => 3,
            HeaderValue::Int(_) => 4,
            HeaderValue::Long(_) => 5,
            HeaderValue::ByteArray(_) => 6,
            HeaderValue::String(_) => 7,
            HeaderValue::Timestamp(_) => 8,
            HeaderValue::Uuid(_) => 9,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub name: String,
    pub value: HeaderValue,
}

/// A fully decoded, self-delimited event-stream message.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Frame {
    pub headers: Vec<Header>,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(headers: Vec<Header>, payload: Bytes) -> Self {
        Frame { headers, payload }
    }

    pub fn header(&self, name: &str) -> Option<&Header> {
        // Duplicate names overwrite earlier ones during decode (headers are
        // pushed in order, so the last match wins); an encoder never
        // produces duplicates, but we keep the same "last wins" rule here
        // for symmetry.
        self.headers.iter().rev().find(|h| h.name == name)
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.header(name).and_then(|h| h.value.as_str())
    }

    pub fn message_type(&self) -> Option<&str> {
        self.header_str(":message-type")
    }

    pub fn event_type(&self) -> Option<&str> {
        self.header_str(":event-type")
    }

    pub fn exception_type(&self) -> Option<&str> {
        self.header_str(":exception-type")
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header_str(":content-type")
    }

    pub fn error_code(&self) -> Option<&str> {
        self.header_str(":error-code")
    }

    pub fn error_message(&self) -> Option<&str> {
        self.header_str(":error-message")
    }

    pub fn add_header(mut self, name: impl Into<String>, value: HeaderValue) -> Self {
        self.headers.push(Header {
            name: name.into(),
            value,
        });
        self
    }
}

/// The higher-level classification of a [`Frame`], per §4.4's decoder
/// semantics: an `event` frame carries a modeled union member, an
/// `exception` frame carries a modeled error, and an `error` frame carries
/// an unmodeled framing-level failure.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Event {
        event_type: String,
        content_type: Option<String>,
        payload: Bytes,
    },
    Exception {
        exception_type: String,
        payload: Bytes,
    },
    Error {
        code: String,
        message: String,
    },
}

impl Message {
    pub fn from_frame(frame: Frame) -> Result<Message, RuntimeError> {
        match frame.message_type() {
            Some("event") => {
                let event_type = frame
                    .event_type()
                    .ok_or_else(|| framing_error("event frame missing :event-type"))?
                    .to_owned();
                let content_type = frame.content_type().map(str::to_owned);
                Ok(Message::Event {
                    event_type,
                    content_type,
                    payload: frame.payload,
                })
            }
            Some("exception") => {
                let exception_type = frame
                    .exception_type()
                    .ok_or_else(|| framing_error("exception frame missing :exception-type"))?
                    .to_owned();
                Ok(Message::Exception {
                    exception_type,
                    payload: frame.payload,
                })
            }
            Some("error") => Ok(Message::Error {
                code: frame.error_code().unwrap_or_default().to_owned(),
                message: frame.error_message().unwrap_or_default().to_owned(),
            }),
            other => Err(framing_error(format!(
                "unrecognized :message-type {other:?}"
            ))),
        }
    }

    pub fn into_frame(self) -> Frame {
        match self {
            Message::Event {
                event_type,
                content_type,
                payload,
            } => {
                let mut frame = Frame::new(Vec::new(), payload)
                    .add_header(":message-type", HeaderValue::String("event".into()))
                    .add_header(":event-type", HeaderValue::String(event_type));
                if let Some(ct) = content_type {
                    frame = frame.add_header(":content-type", HeaderValue::String(ct));
                }
                frame
            }
            Message::Exception {
                exception_type,
                payload,
            } => Frame::new(Vec::new(), payload)
                .add_header(":message-type", HeaderValue::String("exception".into()))
                .add_header(":exception-type", HeaderValue::String(exception_type)),
            Message::Error { code, message } => Frame::new(Vec::new(), Bytes::new())
                .add_header(":message-type", HeaderValue::String("error".into()))
                .add_header(":error-code", HeaderValue::String(code))
                .add_header(":error-message", HeaderValue::String(message)),
        }
    }
}

fn framing_error(message: impl Into<String>) -> RuntimeError {
    RuntimeError::new(ErrorKind::FramingEventStream, message.into())
}

/// A `tokio_util::codec` `Decoder`/`Encoder` over the wire format of §6.4.
/// Stateless across calls: each invocation either returns a complete frame
/// or asks for more bytes — a malformed prelude or a CRC mismatch is fatal
/// and the caller must not attempt to resynchronize the stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = RuntimeError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, RuntimeError> {
        if buf.len() < PRELUDE_LEN {
            return Ok(None);
        }

        let total_len = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let headers_len = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let prelude_crc = u32::from_be_bytes(buf[8..12].try_into().unwrap());

        if total_len > MAX_TOTAL_LEN {
            return Err(framing_error(format!(
                "frame totalLen {total_len} exceeds max {MAX_TOTAL_LEN}"
            )));
        }
        if headers_len > MAX_HEADERS_LEN {
            return Err(framing_error(format!(
                "frame headersLen {headers_len} exceeds max {MAX_HEADERS_LEN}"
            )));
        }
        if (total_len as usize) < PRELUDE_LEN + TRAILING_CRC_LEN + headers_len as usize {
            return Err(framing_error("frame totalLen too small for its headersLen"));
        }

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf[0..8]);
        if hasher.finalize() != prelude_crc {
            return Err(framing_error("prelude CRC mismatch"));
        }

        if buf.len() < total_len as usize {
            buf.reserve(total_len as usize - buf.len());
            return Ok(None);
        }

        let message = buf.split_to(total_len as usize);
        let message_crc = u32::from_be_bytes(
            message[total_len as usize - 4..total_len as usize]
                .try_into()
                .unwrap(),
        );
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&message[0..total_len as usize - 4]);
        if hasher.finalize() != message_crc {
            return Err(framing_error("message CRC mismatch"));
        }

        let headers_start = PRELUDE_LEN;
        let headers_end = headers_start + headers_len as usize;
        let headers = decode_headers(&message[headers_start..headers_end])?;
        let payload = Bytes::copy_from_slice(&message[headers_end..total_len as usize - 4]);

        Ok(Some(Frame { headers, payload }))
    }
}

fn decode_headers(mut buf: &[u8]) -> Result<Vec<Header>, RuntimeError> {
    let mut headers = Vec::new();
    while !buf.is_empty() {
        let name_len = buf[0] as usize;
        buf = &buf[1..];
        if buf.len() < name_len {
            return Err(framing_error("truncated header name"));
        }
        let name = std::str::from_utf8(&buf[..name_len])
            .map_err(|_| framing_error("header name is not valid utf8"))?
            .to_owned();
        buf = &buf[name_len..];

        if buf.is_empty() {
            return Err(framing_error("truncated header value type"));
        }
        let value_type = buf[0];
        buf = &buf[1..];

        let value = decode_header_value(value_type, &mut buf)?;
        headers.push(Header { name, value });
    }
    Ok(headers)
}

fn decode_header_value(value_type: u8, buf: &mut &[u8]) -> Result<HeaderValue, RuntimeError> {
    let take = |buf: &mut &[u8], n: usize| -> Result<Vec<u8>, RuntimeError> {
        if buf.len() < n {
            return Err(framing_error("truncated header value"));
        }
        let (head, tail) = buf.split_at(n);
        let v = head.to_vec();
        *buf = tail;
        Ok(v)
    };

    Ok(match value_type {
        0 => HeaderValue::Bool(true),
        1 => HeaderValue::Bool(false),
        2 => HeaderValue::Byte(take(buf, 1)?[0] as i8),
        3 => HeaderValue::Short(i16::from_be_bytes(take(buf, 2)?.try_into().unwrap())),
        4 => HeaderValue::Int(i32::from_be_bytes(take(buf, 4)?.try_into().unwrap())),
        5 => HeaderValue::Long(i64::from_be_bytes(take(buf, 8)?.try_into().unwrap())),
        6 => {
            let len = u16::from_be_bytes(take(buf, 2)?.try_into().unwrap()) as usize;
            HeaderValue::ByteArray(Bytes::from(take(buf, len)?))
        }
        7 => {
            let len = u16::from_be_bytes(take(buf, 2)?.try_into().unwrap()) as usize;
            let bytes = take(buf, len)?;
            HeaderValue::String(
                String::from_utf8(bytes).map_err(|_| framing_error("header string is not valid utf8"))?,
            )
        }
        8 => HeaderValue::Timestamp(i64::from_be_bytes(take(buf, 8)?.try_into().unwrap())),
        9 => {
            let bytes = take(buf, 16)?;
            HeaderValue::Uuid(uuid::Uuid::from_slice(&bytes).unwrap())
        }
        other => return Err(framing_error(format!("unknown header value type {other}"))),
    })
}

impl Encoder<Frame> for FrameCodec {
    type Error = RuntimeError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), RuntimeError> {
        let mut headers_buf = BytesMut::new();
        for header in &frame.headers {
            encode_header(header, &mut headers_buf)?;
        }

        let headers_len = headers_buf.len() as u32;
        let total_len = PRELUDE_LEN as u32 + headers_len + frame.payload.len() as u32 + TRAILING_CRC_LEN as u32;
        if total_len > MAX_TOTAL_LEN {
            return Err(framing_error(format!(
                "encoded frame totalLen {total_len} exceeds max {MAX_TOTAL_LEN}"
            )));
        }
        if headers_len > MAX_HEADERS_LEN {
            return Err(framing_error(format!(
                "encoded frame headersLen {headers_len} exceeds max {MAX_HEADERS_LEN}"
            )));
        }

        let mut prelude = BytesMut::with_capacity(PRELUDE_LEN);
        prelude.put_u32(total_len);
        prelude.put_u32(headers_len);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&prelude);
        prelude.put_u32(hasher.finalize());

        dst.reserve(total_len as usize);
        dst.extend_from_slice(&prelude);
        dst.extend_from_slice(&headers_buf);
        dst.extend_from_slice(&frame.payload);

        let message_start = dst.len() - (PRELUDE_LEN + headers_len as usize + frame.payload.len());
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&dst[message_start..]);
        dst.put_u32(hasher.finalize());

        Ok(())
    }
}

fn encode_header(header: &Header, out: &mut BytesMut) -> Result<(), RuntimeError> {
    if header.name.len() > u8::MAX as usize {
        return Err(framing_error(format!(
            "header name '{}' exceeds 255 bytes",
            header.name
        )));
    }
    out.put_u8(header.name.len() as u8);
    out.extend_from_slice(header.name.as_bytes());
    out.put_u8(header.value.type_byte());
    match &header.value {
        HeaderValue::Bool(_) => {}
        HeaderValue::Byte(v) => out.put_i8(*v),
        HeaderValue::Short(v) => out.put_i16(*v),
        HeaderValue::Int(v) => out.put_i32(*v),
        HeaderValue::Long(v) => out.put_i64(*v),
        HeaderValue::ByteArray(v) => {
            out.put_u16(v.len() as u16);
            out.extend_from_slice(v);
        }
        HeaderValue::String(v) => {
            out.put_u16(v.len() as u16);
            out.extend_from_slice(v.as_bytes());
        }
        HeaderValue::Timestamp(v) => out.put_i64(*v),
        HeaderValue::Uuid(v) => out.extend_from_slice(v.as_bytes()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_an_event_frame() {
        let message = Message::Event {
            event_type: "Hello".into(),
            content_type: Some("application/json".into()),
            payload: Bytes::from_static(br#"{"m":1}"#),
        };
        let frame = message.clone().into_frame();

        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().expect("full frame decoded");
        assert_eq!(decoded, frame);
        assert_eq!(Message::from_frame(decoded).unwrap(), message);
        assert!(buf.is_empty());
    }

    #[test]
    fn incomplete_frame_asks_for_more_bytes() {
        let frame = Message::Error {
            code: "InternalError".into(),
            message: "boom".into(),
        }
        .into_frame();
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();

        let mut partial = BytesMut::from(&buf[..buf.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn corrupted_prelude_crc_is_fatal() {
        let frame = Frame::new(Vec::new(), Bytes::from_static(b"x"));
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        // Flip a bit in the totalLen field, invalidating the prelude CRC.
        buf[3] ^= 0x01;

        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FramingEventStream);
    }

    #[test]
    fn oversized_total_len_is_rejected_before_allocating() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_TOTAL_LEN + 1);
        buf.put_u32(0);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf[0..8]);
        buf.put_u32(hasher.finalize());

        let mut codec = FrameCodec;
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FramingEventStream);
    }
}
