//! Response-body streaming with slot accounting.
//!
//! Upstream bodies are forwarded chunk by chunk, never buffered. The chosen
//! backend's busy slot has to stay held for as long as bytes may still flow,
//! so the guard rides inside the stream and releases on drop: normal
//! completion, an upstream error, and a client disconnect all end up dropping
//! the stream.

use crate::busy::BusyGuard;
use axum::body::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};

/// A byte stream that owns the busy slot of the backend producing it.
pub struct TrackedBody<S> {
    inner: S,
    _slot: BusyGuard,
}

impl<S> TrackedBody<S> {
    pub fn new(inner: S, slot: BusyGuard) -> Self {
        Self { inner, _slot: slot }
    }
}

impl<S, E> Stream for TrackedBody<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::busy::BusyTracker;
    use futures_util::{StreamExt, stream};
    use std::sync::Arc;

    #[tokio::test]
    async fn slot_held_while_streaming_released_after() {
        let tracker = Arc::new(BusyTracker::default());
        let chunks: Vec<Result<Bytes, std::io::Error>> =
            vec![Ok(Bytes::from("hello ")), Ok(Bytes::from("world"))];
        let mut body = TrackedBody::new(
            stream::iter(chunks),
            BusyGuard::acquire(Arc::clone(&tracker), 1),
        );

        assert_eq!(tracker.in_flight(1), 1);
        let mut collected = Vec::new();
        while let Some(chunk) = body.next().await {
            assert_eq!(tracker.in_flight(1), 1);
            collected.extend_from_slice(&chunk.unwrap());
        }
        drop(body);

        assert_eq!(collected, b"hello world");
        assert_eq!(tracker.in_flight(1), 0);
    }

    #[tokio::test]
    async fn dropping_mid_stream_releases_the_slot() {
        let tracker = Arc::new(BusyTracker::default());
        let chunks: Vec<Result<Bytes, std::io::Error>> =
            vec![Ok(Bytes::from("a")), Ok(Bytes::from("b"))];
        let mut body = TrackedBody::new(
            stream::iter(chunks),
            BusyGuard::acquire(Arc::clone(&tracker), 1),
        );

        // Client goes away after one chunk.
        let _ = body.next().await;
        drop(body);

        assert_eq!(tracker.in_flight(1), 0);
    }
}
