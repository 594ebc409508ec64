//! Splices a request/response body stream through the event-stream codec
//! (§4.13 step 5): for operations whose input or output carries an
//! event-stream member, the dispatcher hands the raw body stream here
//! instead of buffering it whole and running it through [`crate::codec`].
//!
//! Kept decoupled from [`forge_stream::DataStream`]'s internals — it only
//! needs a plain `Stream<Item = Result<Bytes, RuntimeError>>`, the same
//! shape a [`crate::Codec`]-free body arrives in from any transport.

use bytes::{Bytes, BytesMut};
use forge_error::RuntimeError;
use forge_eventstream::{Frame, FrameCodec, Message};
use futures::stream::{self, Stream, StreamExt};
use tokio_util::codec::{Decoder, Encoder};

/// Decodes an incoming byte stream into a stream of typed [`Message`]s, one
/// frame at a time. Each poll reads only as many upstream chunks as it
/// takes to complete the next frame — the one-chunk-of-backpressure rule
/// from §5 — and a CRC or framing failure ends the stream with that error
/// rather than attempting to resynchronize.
pub fn decode_messages<S>(body: S) -> impl Stream<Item = Result<Message, RuntimeError>>
where
    S: Stream<Item = Result<Bytes, RuntimeError>> + Send + 'static,
{
    struct State<S> {
        body: std::pin::Pin<Box<S>>,
        buf: BytesMut,
        codec: FrameCodec,
        done: bool,
    }

    let state = State {
        body: Box::pin(body),
        buf: BytesMut::new(),
        codec: FrameCodec,
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if state.done {
                return None;
            }
            match state.codec.decode(&mut state.buf) {
                Ok(Some(frame)) => {
                    return Some((Message::from_frame(frame), state));
                }
                Ok(None) => match state.body.next().await {
                    Some(Ok(chunk)) => {
                        state.buf.extend_from_slice(&chunk);
                        continue;
                    }
                    Some(Err(err)) => {
                        state.done = true;
                        return Some((Err(err), state));
                    }
                    None => {
                        state.done = true;
                        return None;
                    }
                },
                Err(err) => {
                    state.done = true;
                    return Some((Err(err), state));
                }
            }
        }
    })
}

/// Encodes a stream of outgoing [`Message`]s into the wire byte stream a
/// transport writes out, preserving source order (§5: "encoded frames are
/// emitted in the order their source events were produced").
pub fn encode_messages<S>(messages: S) -> impl Stream<Item = Result<Bytes, RuntimeError>>
where
    S: Stream<Item = Message> + Send + 'static,
{
    messages.map(|message| {
        let frame: Frame = message.into_frame();
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf)?;
        Ok(buf.freeze())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_eventstream::HeaderValue;

    fn hello_event() -> Message {
        Message::Event {
            event_type: "Hello".into(),
            content_type: Some("application/json".into()),
            payload: Bytes::from_static(br#"{"m":1}"#),
        }
    }

    #[tokio::test]
    async fn round_trips_a_sequence_of_events_through_the_byte_stream() {
        let events = vec![
            hello_event(),
            Message::Event {
                event_type: "Goodbye".into(),
                content_type: None,
                payload: Bytes::new(),
            },
        ];

        let encoded: Vec<Bytes> = Box::pin(encode_messages(stream::iter(events.clone())))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<Vec<_>, RuntimeError>>()
            .unwrap();

        // Simulate a transport that hands the encoded frames back as one
        // chunk per original frame.
        let body = stream::iter(encoded.into_iter().map(Ok));
        let decoded: Vec<Message> = Box::pin(decode_messages(body))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<Vec<_>, RuntimeError>>()
            .unwrap();

        assert_eq!(decoded, events);
    }

    #[tokio::test]
    async fn decoder_assembles_a_frame_split_across_many_small_chunks() {
        let event = hello_event();
        let frame = event.clone().into_frame();
        let mut codec = FrameCodec;
        let mut whole = BytesMut::new();
        codec.encode(frame, &mut whole).unwrap();

        // Split the encoded frame into one-byte chunks to exercise the
        // "ask for more bytes" path on every iteration.
        let chunks: Vec<Result<Bytes, RuntimeError>> =
            whole.iter().map(|b| Ok(Bytes::copy_from_slice(&[*b]))).collect();

        let decoded: Vec<Message> = Box::pin(decode_messages(stream::iter(chunks)))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<Vec<_>, RuntimeError>>()
            .unwrap();

        assert_eq!(decoded, vec![event]);
        assert!(HeaderValue::String("application/json".into()).as_str().is_some());
    }
}
