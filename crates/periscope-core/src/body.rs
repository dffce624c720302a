//! Body capture
//!
//! [`tap`] wraps a body stream so every chunk passes through unchanged while
//! a cheap clone is handed to a detached [`BodyCapture`]. The capture side
//! never sits on the forwarding path: if it stops listening, is slow, or is
//! dropped, the wrapped stream keeps yielding exactly what the inner stream
//! yields.
//!
//! Framed bodies (a known `Content-Length`) are often dropped by the HTTP
//! layer as soon as the declared length has been written, without a final
//! poll. When the expected length is known the capture therefore counts as
//! complete once that many bytes have gone through.
//!
//! Captured bytes are base64-encoded so a [`CapturedBody`] always fits in a
//! JSON text frame.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::sync::mpsc;
use tracing::debug;

/// Encode raw bytes for transport. Empty input has no encoding.
pub fn encode_body(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() {
        None
    } else {
        Some(STANDARD.encode(bytes))
    }
}

/// Reverse of [`encode_body`]; an absent body decodes to no bytes
pub fn decode_body(body: Option<&str>) -> Result<Vec<u8>, base64::DecodeError> {
    match body {
        Some(encoded) => STANDARD.decode(encoded),
        None => Ok(Vec::new()),
    }
}

/// Body of one captured message leg, ready for serialization
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedBody {
    /// Base64 of the captured bytes (absent when nothing was captured)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Total bytes observed on the wire, including any past the capture limit
    pub body_size: u64,
    /// True when `body` holds only a prefix of the observed bytes
    #[serde(default)]
    pub truncated: bool,
    /// False when the stream errored or was dropped before its end
    #[serde(default)]
    pub complete: bool,
}

impl CapturedBody {
    /// A complete capture of a body with no bytes
    pub fn empty() -> Self {
        Self {
            complete: true,
            ..Self::default()
        }
    }

    /// Decode the transport encoding back to the captured bytes
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        decode_body(self.body.as_deref())
    }
}

/// Accumulates body chunks up to a byte limit
#[derive(Debug)]
pub struct BodyCollector {
    buf: BytesMut,
    limit: usize,
    observed: u64,
    truncated: bool,
}

impl BodyCollector {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            limit,
            observed: 0,
            truncated: false,
        }
    }

    /// Append a chunk, keeping only what fits under the limit
    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.buf.len());
        let keep = chunk.len().min(room);
        self.buf.extend_from_slice(&chunk[..keep]);
        if keep < chunk.len() {
            self.truncated = true;
        }
        self.observed += chunk.len() as u64;
    }

    /// Record bytes that went by without being buffered
    pub fn skip(&mut self, len: usize) {
        self.observed += len as u64;
        self.truncated = true;
    }

    /// Number of bytes seen so far
    pub fn observed(&self) -> u64 {
        self.observed
    }

    /// The stream ended normally
    pub fn finish(self) -> CapturedBody {
        self.into_captured(true)
    }

    /// The stream failed or was abandoned; keep what arrived
    pub fn abort(self) -> CapturedBody {
        self.into_captured(false)
    }

    fn into_captured(self, complete: bool) -> CapturedBody {
        CapturedBody {
            body: encode_body(&self.buf),
            body_size: self.observed,
            truncated: self.truncated,
            complete,
        }
    }
}

#[derive(Debug)]
enum TapEvent {
    Chunk(Bytes),
    Skipped(usize),
    End,
    Failed(String),
}

/// Stream adapter that mirrors chunks into a [`BodyCapture`]
pub struct TappedStream<S> {
    inner: S,
    tx: Option<mpsc::UnboundedSender<TapEvent>>,
    budget: usize,
    seen: u64,
    expected: Option<u64>,
}

impl<S> TappedStream<S> {
    fn observe(&mut self, chunk: &Bytes) {
        let keep = chunk.len().min(self.budget);
        self.budget -= keep;
        if keep > 0 {
            self.send(TapEvent::Chunk(chunk.slice(..keep)));
        }
        if keep < chunk.len() {
            self.send(TapEvent::Skipped(chunk.len() - keep));
        }
        self.seen += chunk.len() as u64;
        if self.expected.is_some_and(|expected| self.seen >= expected) {
            self.close(TapEvent::End);
        }
    }

    fn send(&mut self, event: TapEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                // Capture side went away; keep forwarding
                self.tx = None;
            }
        }
    }

    fn close(&mut self, event: TapEvent) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(event);
        }
    }
}

impl<S, E> Stream for TappedStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: fmt::Display,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        let item = ready!(Pin::new(&mut this.inner).poll_next(cx));
        match &item {
            Some(Ok(chunk)) => this.observe(chunk),
            Some(Err(e)) => this.close(TapEvent::Failed(e.to_string())),
            None => this.close(TapEvent::End),
        }
        Poll::Ready(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// Receiving half of a tap; resolves to the captured body
#[derive(Debug)]
pub struct BodyCapture {
    rx: mpsc::UnboundedReceiver<TapEvent>,
    collector: BodyCollector,
}

impl BodyCapture {
    /// Drain the tap until the stream ends, fails, or is dropped
    pub async fn finish(mut self) -> CapturedBody {
        while let Some(event) = self.rx.recv().await {
            match event {
                TapEvent::Chunk(chunk) => self.collector.push(&chunk),
                TapEvent::Skipped(len) => self.collector.skip(len),
                TapEvent::End => return self.collector.finish(),
                TapEvent::Failed(reason) => {
                    debug!(
                        "Body stream failed after {} bytes: {}",
                        self.collector.observed(),
                        reason
                    );
                    return self.collector.abort();
                }
            }
        }
        debug!(
            "Body stream dropped after {} bytes",
            self.collector.observed()
        );
        self.collector.abort()
    }
}

/// Wrap `stream` so its chunks are captured (up to `limit` bytes) on the side.
///
/// `expected_len` is the declared body length, if any. Reaching it ends the
/// capture even if the stream is never polled to its end.
pub fn tap<S>(
    stream: S,
    limit: usize,
    expected_len: Option<u64>,
) -> (TappedStream<S>, BodyCapture) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut tapped = TappedStream {
        inner: stream,
        tx: Some(tx),
        budget: limit,
        seen: 0,
        expected: expected_len,
    };
    if expected_len == Some(0) {
        tapped.close(TapEvent::End);
    }
    (
        tapped,
        BodyCapture {
            rx,
            collector: BodyCollector::new(limit),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{stream, StreamExt};

    fn chunks(parts: &[&'static [u8]]) -> Vec<Result<Bytes, String>> {
        parts.iter().map(|p| Ok(Bytes::from_static(p))).collect()
    }

    #[test]
    fn test_round_trip_payloads() {
        let binary: Vec<u8> = (0..=255u8).collect();
        for payload in [&b""[..], b"hello world", &binary[..]] {
            let mut collector = BodyCollector::new(1024);
            collector.push(payload);
            let captured = collector.finish();
            assert_eq!(captured.decode().unwrap(), payload);
            assert_eq!(captured.body_size, payload.len() as u64);
            assert!(captured.complete);
        }
    }

    #[test]
    fn test_empty_body_is_absent() {
        let captured = BodyCollector::new(16).finish();
        assert!(captured.body.is_none());
        assert_eq!(captured, CapturedBody::empty());

        let json = serde_json::to_value(&captured).unwrap();
        assert!(json.get("body").is_none());
        assert_eq!(json["bodySize"], 0);
    }

    #[test]
    fn test_collector_truncates_at_limit() {
        let mut collector = BodyCollector::new(4);
        collector.push(b"abc");
        collector.push(b"defgh");
        let captured = collector.finish();
        assert_eq!(captured.decode().unwrap(), b"abcd");
        assert_eq!(captured.body_size, 8);
        assert!(captured.truncated);
    }

    #[tokio::test]
    async fn test_tap_passes_chunks_through() {
        let source = stream::iter(chunks(&[b"{\"id\"", b":1}"]));
        let (tapped, capture) = tap(source, 1024, None);

        let forwarded: Vec<Bytes> = tapped.map(|r| r.unwrap()).collect().await;
        assert_eq!(forwarded.concat(), b"{\"id\":1}");

        let captured = capture.finish().await;
        assert!(captured.complete);
        assert_eq!(captured.decode().unwrap(), b"{\"id\":1}");
    }

    #[tokio::test]
    async fn test_tap_limit_does_not_affect_forwarding() {
        let source = stream::iter(chunks(&[b"0123", b"4567", b"89"]));
        let (tapped, capture) = tap(source, 6, None);

        let forwarded: Vec<Bytes> = tapped.map(|r| r.unwrap()).collect().await;
        assert_eq!(forwarded.concat(), b"0123456789");

        let captured = capture.finish().await;
        assert_eq!(captured.decode().unwrap(), b"012345");
        assert_eq!(captured.body_size, 10);
        assert!(captured.truncated);
        assert!(captured.complete);
    }

    #[tokio::test]
    async fn test_tap_error_yields_partial_capture() {
        let source = stream::iter(vec![
            Ok(Bytes::from_static(b"part")),
            Err("connection reset".to_string()),
        ]);
        let (mut tapped, capture) = tap(source, 1024, Some(100));

        assert_eq!(tapped.next().await.unwrap().unwrap(), "part");
        assert!(tapped.next().await.unwrap().is_err());

        let captured = capture.finish().await;
        assert!(!captured.complete);
        assert_eq!(captured.decode().unwrap(), b"part");
    }

    #[tokio::test]
    async fn test_tap_dropped_mid_stream() {
        let source = stream::iter(chunks(&[b"first", b"second"]));
        let (mut tapped, capture) = tap(source, 1024, Some(11));
        assert_eq!(tapped.next().await.unwrap().unwrap(), "first");
        drop(tapped);

        let captured = capture.finish().await;
        assert!(!captured.complete);
        assert_eq!(captured.decode().unwrap(), b"first");
    }

    #[tokio::test]
    async fn test_tap_survives_dropped_capture() {
        let source = stream::iter(chunks(&[b"a", b"b", b"c"]));
        let (tapped, capture) = tap(source, 1024, None);
        drop(capture);

        let forwarded: Vec<Bytes> = tapped.map(|r| r.unwrap()).collect().await;
        assert_eq!(forwarded.concat(), b"abc");
    }

    #[tokio::test]
    async fn test_declared_length_completes_without_final_poll() {
        let source = stream::iter(chunks(&[b"{\"id\"", b":1}", b"never read"]));
        let (mut tapped, capture) = tap(source, 1024, Some(8));

        assert_eq!(tapped.next().await.unwrap().unwrap(), "{\"id\"");
        assert_eq!(tapped.next().await.unwrap().unwrap(), ":1}");
        // Consumer stops at the declared length, as an HTTP encoder does
        drop(tapped);

        let captured = capture.finish().await;
        assert!(captured.complete);
        assert_eq!(captured.body_size, 8);
        assert_eq!(captured.decode().unwrap(), b"{\"id\":1}");
    }

    #[tokio::test]
    async fn test_declared_zero_length_is_complete_unpolled() {
        let source = stream::iter(chunks(&[]));
        let (tapped, capture) = tap(source, 1024, Some(0));
        drop(tapped);

        let captured = capture.finish().await;
        assert_eq!(captured, CapturedBody::empty());
    }
}
