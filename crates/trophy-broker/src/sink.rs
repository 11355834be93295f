//! Transport capability: a sink that accepts encoded frames and can be closed.
//!
//! The broker never touches HTTP types. Any server that can keep a response
//! open plugs in through [`EventSink`]; [`ChannelSink`] is the tokio-channel
//! implementation the gateway streams from.

use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::SinkError;

/// Non-blocking frame writer for one client.
pub trait EventSink: Send + Sync {
    /// Queue one encoded frame. Must not block.
    fn write(&self, frame: Bytes) -> Result<(), SinkError>;

    /// Stop accepting frames and let the transport finish. Idempotent.
    fn close(&self);
}

impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    fn write(&self, frame: Bytes) -> Result<(), SinkError> {
        (**self).write(frame)
    }

    fn close(&self) {
        (**self).close()
    }
}

/// Bounded channel sink. A full buffer is a failed write.
pub struct ChannelSink {
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
}

impl ChannelSink {
    /// Create a sink and the body stream that drains it.
    ///
    /// `closed` is cancelled when the stream is dropped, which is how the
    /// transport reports that the client went away.
    pub fn pair(capacity: usize, closed: CancellationToken) -> (Self, FrameStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = Self {
            tx: Mutex::new(Some(tx)),
        };
        let stream = FrameStream {
            rx: ReceiverStream::new(rx),
            _closed: closed.drop_guard(),
        };
        (sink, stream)
    }
}

impl EventSink for ChannelSink {
    fn write(&self, frame: Bytes) -> Result<(), SinkError> {
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = guard.as_ref().ok_or(SinkError::Closed)?;
        tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => SinkError::Full,
            TrySendError::Closed(_) => SinkError::Closed,
        })
    }

    fn close(&self) {
        // dropping the sender ends the stream once queued frames are drained
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Response body side of a [`ChannelSink`].
pub struct FrameStream {
    rx: ReceiverStream<Bytes>,
    _closed: DropGuard,
}

impl Stream for FrameStream {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    /// In-memory sink that records frames and can be told to fail.
    #[derive(Default)]
    pub struct MemorySink {
        frames: Mutex<Vec<Bytes>>,
        failing: AtomicBool,
        closed: AtomicBool,
        /// Writes left before every further write fails. `None` is unlimited.
        budget: Mutex<Option<usize>>,
    }

    impl MemorySink {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn failing() -> Arc<Self> {
            let sink = Self::new();
            sink.set_failing(true);
            sink
        }

        /// Accepts `writes` frames, then fails like a full buffer.
        pub fn failing_after(writes: usize) -> Arc<Self> {
            let sink = Self::new();
            *sink.budget.lock().unwrap() = Some(writes);
            sink
        }

        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        pub fn frames(&self) -> Vec<trophy_protocol::SseFrame> {
            let frames = self.frames.lock().unwrap();
            let text: String = frames
                .iter()
                .map(|b| String::from_utf8(b.to_vec()).unwrap())
                .collect();
            trophy_protocol::parse_stream(&text)
        }

        pub fn events_named(&self, event: &str) -> Vec<trophy_protocol::SseFrame> {
            self.frames().into_iter().filter(|f| f.event == event).collect()
        }
    }

    impl EventSink for MemorySink {
        fn write(&self, frame: Bytes) -> Result<(), SinkError> {
            if self.failing.load(Ordering::SeqCst) || self.is_closed() {
                return Err(SinkError::Closed);
            }
            if let Some(left) = self.budget.lock().unwrap().as_mut() {
                if *left == 0 {
                    return Err(SinkError::Full);
                }
                *left -= 1;
            }
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }
}
