//! Channel-backed SSE writer.
//!
//! The response body is the receiving half of an mpsc channel, so each frame
//! is flushed to the client as soon as it is sent.

use bytes::Bytes;
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::sse::{done_event, error_event, token_event};
use crate::error::ErrorBody;
use crate::metrics;

/// Frames buffered between the producer task and the response body.
const CHANNEL_CAPACITY: usize = 32;

/// Body stream half handed to axum.
pub type SseBody = ReceiverStream<Result<Bytes, Infallible>>;

/// Error returned once the client has gone away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientGone;

/// Writer half of an SSE response.
pub struct SseWriter {
    tx: mpsc::Sender<Result<Bytes, Infallible>>,
    bytes_written: u64,
    tokens_sent: usize,
}

impl SseWriter {
    /// Create a writer and the body stream it feeds.
    pub fn channel() -> (Self, SseBody) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let writer = Self {
            tx,
            bytes_written: 0,
            tokens_sent: 0,
        };
        (writer, ReceiverStream::new(rx))
    }

    /// Send a token event.
    pub async fn send_token(&mut self, text: &str) -> Result<(), ClientGone> {
        self.write(token_event(text)).await?;
        self.tokens_sent += 1;
        metrics::record_token_sent();
        Ok(())
    }

    /// Send an error event.
    pub async fn send_error(&mut self, error: &ErrorBody) -> Result<(), ClientGone> {
        self.write(error_event(error)).await
    }

    /// Send the terminal done event.
    pub async fn send_done(&mut self, ok: bool) -> Result<(), ClientGone> {
        self.write(done_event(ok)).await
    }

    /// Resolves when the client disconnects and the body is dropped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Get total bytes written.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn tokens_sent(&self) -> usize {
        self.tokens_sent
    }

    async fn write(&mut self, frame: Bytes) -> Result<(), ClientGone> {
        let len = frame.len() as u64;
        self.tx.send(Ok(frame)).await.map_err(|_| ClientGone)?;
        self.bytes_written += len;
        metrics::record_bytes_sent(len);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let (mut writer, mut body) = SseWriter::channel();
        writer.send_token("hi").await.unwrap();
        writer.send_done(true).await.unwrap();
        assert_eq!(writer.tokens_sent(), 1);
        drop(writer);

        let mut frames = Vec::new();
        while let Some(Ok(frame)) = body.next().await {
            frames.push(frame);
        }
        assert_eq!(frames.len(), 2);
        assert!(frames[0].starts_with(b"event: token\n"));
        assert_eq!(frames[1].as_ref(), b"event: done\ndata: {\"ok\":true}\n\n");
    }

    #[tokio::test]
    async fn test_dropped_body_reports_client_gone() {
        let (mut writer, body) = SseWriter::channel();
        drop(body);
        assert!(writer.is_closed());
        assert_eq!(writer.send_token("late").await, Err(ClientGone));
        writer.closed().await;
    }
}
