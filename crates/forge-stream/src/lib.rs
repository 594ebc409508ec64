//! A uniform body abstraction over bytes, files, and publishers (component C2).
//!
//! `DataStream` is single-owner: consuming it (via [`DataStream::to_buffer`],
//! [`DataStream::to_iterator`], or [`DataStream::subscribe`]) transfers
//! consumption rights, matching the lifecycle rule that only one subscriber
//! may ever attach to a non-replayable stream.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use forge_error::{ErrorKind, RuntimeError};
use futures::stream::{self, Stream, StreamExt};
use tokio::sync::Notify;

/// The "unknown length" case is spelled out as an explicit variant rather
/// than a sentinel integer like `-1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentLength {
    Known(u64),
    Unknown,
}

impl ContentLength {
    pub fn as_i64(self) -> i64 {
        match self {
            ContentLength::Known(n) => n as i64,
            ContentLength::Unknown => -1,
        }
    }
}

type BoxStream = Pin<Box<dyn Stream<Item = Result<Bytes, RuntimeError>> + Send>>;

enum Body {
    Bytes(Bytes),
    File(PathBuf),
    Publisher(BoxStream),
}

/// A lazy, possibly-infinite sequence of bytes with content metadata.
pub struct DataStream {
    body: Body,
    content_type: Option<String>,
    content_length: ContentLength,
    replayable: bool,
}

impl DataStream {
    pub fn of_bytes(buf: impl Into<Bytes>, content_type: Option<String>) -> Self {
        let buf = buf.into();
        DataStream {
            content_length: ContentLength::Known(buf.len() as u64),
            body: Body::Bytes(buf),
            content_type,
            replayable: true,
        }
    }

    /// `length` is not probed eagerly; pass it if already known (e.g. from a
    /// prior `stat`) to avoid the dispatcher falling back to chunked framing.
    pub fn of_file(path: impl Into<PathBuf>, content_type: Option<String>) -> Self {
        DataStream {
            body: Body::File(path.into()),
            content_type,
            content_length: ContentLength::Unknown,
            replayable: true,
        }
    }

    pub fn of_file_with_length(
        path: impl Into<PathBuf>,
        content_type: Option<String>,
        length: u64,
    ) -> Self {
        DataStream {
            body: Body::File(path.into()),
            content_type,
            content_length: ContentLength::Known(length),
            replayable: true,
        }
    }

    /// Wraps an arbitrary async byte source. Not replayable unless the
    /// caller explicitly marks it so with [`DataStream::replayable`] — the
    /// runtime has no way to rewind an opaque input source on its own.
    pub fn of_input_source(
        source: impl Stream<Item = Result<Bytes, RuntimeError>> + Send + 'static,
        content_type: Option<String>,
        length: Option<u64>,
    ) -> Self {
        DataStream {
            body: Body::Publisher(Box::pin(source)),
            content_type,
            content_length: length.map(ContentLength::Known).unwrap_or(ContentLength::Unknown),
            replayable: false,
        }
    }

    pub fn of_publisher(
        publisher: impl Stream<Item = Result<Bytes, RuntimeError>> + Send + 'static,
        content_type: Option<String>,
        length: Option<u64>,
    ) -> Self {
        Self::of_input_source(publisher, content_type, length)
    }

    pub fn replayable(mut self, replayable: bool) -> Self {
        self.replayable = replayable;
        self
    }

    pub fn content_length(&self) -> i64 {
        self.content_length.as_i64()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn is_replayable(&self) -> bool {
        self.replayable
    }

    /// Materializes the whole stream into one contiguous buffer.
    pub async fn to_buffer(self) -> Result<Bytes, RuntimeError> {
        match self.body {
            Body::Bytes(b) => Ok(b),
            Body::File(path) => tokio::fs::read(&path).await.map(Bytes::from).map_err(|e| {
                RuntimeError::new(
                    ErrorKind::TransportGeneric,
                    format!("failed to read {}", path.display()),
                )
                .with_cause(e)
            }),
            Body::Publisher(mut s) => {
                let mut out = Vec::new();
                while let Some(chunk) = s.next().await {
                    out.extend_from_slice(&chunk?);
                }
                Ok(Bytes::from(out))
            }
        }
    }

    /// A one-shot synchronous iterator over the stream's chunks. Intended
    /// for call sites outside an async context; it drives the underlying
    /// stream to completion up front, so it is not suitable for unbounded
    /// publishers.
    pub fn to_iterator(self) -> Result<ByteIterator, RuntimeError> {
        let chunks = match self.body {
            Body::Bytes(b) => VecDeque::from([b]),
            Body::File(path) => {
                let bytes = futures::executor::block_on(tokio::fs::read(&path)).map_err(|e| {
                    RuntimeError::new(
                        ErrorKind::TransportGeneric,
                        format!("failed to read {}", path.display()),
                    )
                    .with_cause(e)
                })?;
                VecDeque::from([Bytes::from(bytes)])
            }
            Body::Publisher(mut s) => {
                let mut chunks = VecDeque::new();
                futures::executor::block_on(async {
                    while let Some(chunk) = s.next().await {
                        chunks.push_back(chunk?);
                    }
                    Ok::<_, RuntimeError>(())
                })?;
                chunks
            }
        };
        Ok(ByteIterator { chunks })
    }

    /// Registers `subscriber` as the stream's consumer. The producer emits
    /// at most the cumulative count requested via [`Subscription::request`];
    /// cancellation and errors are honored per the reactive-streams style
    /// backpressure contract of §4.2.
    pub fn subscribe(self, mut subscriber: impl Subscriber + 'static) {
        let demand = Arc::new(AtomicU64::new(0));
        let notify = Arc::new(Notify::new());
        let cancelled = Arc::new(AtomicBool::new(false));

        subscriber.on_subscribe(Box::new(ChannelSubscription {
            demand: demand.clone(),
            notify: notify.clone(),
            cancelled: cancelled.clone(),
        }));

        tokio::spawn(async move {
            let mut stream: BoxStream = match self.body {
                Body::Bytes(b) => Box::pin(stream::once(async move { Ok(b) })),
                Body::Publisher(s) => s,
                Body::File(path) => {
                    let fut = async move {
                        tokio::fs::read(&path).await.map(Bytes::from).map_err(|e| {
                            RuntimeError::new(
                                ErrorKind::TransportGeneric,
                                format!("failed to read {}", path.display()),
                            )
                            .with_cause(e)
                        })
                    };
                    Box::pin(stream::once(fut))
                }
            };

            loop {
                if cancelled.load(Ordering::Acquire) {
                    return;
                }
                if demand.load(Ordering::Acquire) == 0 {
                    notify.notified().await;
                    continue;
                }
                match stream.next().await {
                    Some(Ok(chunk)) => {
                        demand.fetch_sub(1, Ordering::AcqRel);
                        subscriber.on_next(chunk);
                    }
                    Some(Err(err)) => {
                        subscriber.on_error(err);
                        return;
                    }
                    None => {
                        subscriber.on_complete();
                        return;
                    }
                }
            }
        });
    }
}

pub struct ByteIterator {
    chunks: VecDeque<Bytes>,
}

impl Iterator for ByteIterator {
    type Item = Bytes;
    fn next(&mut self) -> Option<Bytes> {
        self.chunks.pop_front()
    }
}

/// The consumer half of the subscribe/demand contract.
pub trait Subscriber: Send {
    fn on_subscribe(&mut self, subscription: Box<dyn Subscription>);
    fn on_next(&mut self, chunk: Bytes);
    fn on_error(&mut self, err: RuntimeError);
    fn on_complete(&mut self);
}

/// The producer-facing handle a subscriber uses to signal demand.
pub trait Subscription: Send + Sync {
    fn request(&self, n: u64);
    fn cancel(&self);
}

struct ChannelSubscription {
    demand: Arc<AtomicU64>,
    notify: Arc<Notify>,
    cancelled: Arc<AtomicBool>,
}

impl Subscription for ChannelSubscription {
    fn request(&self, n: u64) {
        self.demand.fetch_add(n, Ordering::AcqRel);
        self.notify.notify_one();
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn bytes_stream_reports_known_length_and_is_replayable() {
        let s = DataStream::of_bytes(Bytes::from_static(b"hello"), Some("text/plain".into()));
        assert_eq!(s.content_length(), 5);
        assert!(s.is_replayable());
        assert_eq!(s.to_buffer().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn publisher_stream_is_not_replayable_by_default() {
        let items = vec![Ok(Bytes::from_static(b"a")), Ok(Bytes::from_static(b"b"))];
        let s = DataStream::of_publisher(stream::iter(items), None, None);
        assert!(!s.is_replayable());
        assert_eq!(s.content_length(), -1);
        assert_eq!(s.to_buffer().await.unwrap(), Bytes::from_static(b"ab"));
    }

    struct Collector {
        received: Arc<Mutex<Vec<Bytes>>>,
        completed: Arc<Mutex<bool>>,
    }

    impl Subscriber for Collector {
        fn on_subscribe(&mut self, subscription: Box<dyn Subscription>) {
            subscription.request(u64::MAX);
        }
        fn on_next(&mut self, chunk: Bytes) {
            self.received.lock().unwrap().push(chunk);
        }
        fn on_error(&mut self, _err: RuntimeError) {}
        fn on_complete(&mut self) {
            *self.completed.lock().unwrap() = true;
        }
    }

    #[tokio::test]
    async fn subscribe_delivers_chunks_in_order_then_completes() {
        let items = vec![Ok(Bytes::from_static(b"a")), Ok(Bytes::from_static(b"b"))];
        let s = DataStream::of_publisher(stream::iter(items), None, None);

        let received = Arc::new(Mutex::new(Vec::new()));
        let completed = Arc::new(Mutex::new(false));
        s.subscribe(Collector {
            received: received.clone(),
            completed: completed.clone(),
        });

        for _ in 0..50 {
            if *completed.lock().unwrap() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        assert!(*completed.lock().unwrap());
        assert_eq!(
            *received.lock().unwrap(),
            vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]
        );
    }
}
