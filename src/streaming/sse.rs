//! SSE (Server-Sent Events) framing and parsing.

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::ErrorBody;

/// Content type for SSE responses.
pub const SSE_CONTENT_TYPE: &str = "text/event-stream; charset=utf-8";

/// Format a named event with a JSON payload.
pub fn format_event<T: Serialize>(name: &str, data: &T) -> Bytes {
    let data = serde_json::to_string(data).unwrap_or_else(|_| "null".to_string());
    format!("event: {}\ndata: {}\n\n", name, data).into()
}

/// Format a token event.
pub fn token_event(text: &str) -> Bytes {
    format_event("token", &json!({ "text": text }))
}

/// Format the terminal event.
pub fn done_event(ok: bool) -> Bytes {
    format_event("done", &json!({ "ok": ok }))
}

/// Format an error event.
pub fn error_event(error: &ErrorBody) -> Bytes {
    format_event("error", error)
}

/// One parsed SSE block.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: String,
    /// JSON-decoded data, or the raw text when it is not JSON.
    pub data: Value,
}

impl SseEvent {
    /// Whether this event ends the stream.
    pub fn is_done(&self) -> bool {
        self.event == "done" || self.data.as_str() == Some("[DONE]")
    }
}

/// Incremental SSE parser. Feed bytes as they arrive and drain events.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: BytesMut,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes. Carriage returns are dropped so CRLF framing parses too.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer
            .extend(chunk.iter().copied().filter(|b| *b != b'\r'));
    }

    /// Next complete event, if a blank-line-terminated block is buffered.
    pub fn next_event(&mut self) -> Option<SseEvent> {
        loop {
            let end = self.buffer.windows(2).position(|w| w == b"\n\n")?;
            let block = self.buffer.split_to(end + 2);
            if let Some(event) = parse_block(&block[..end]) {
                return Some(event);
            }
        }
    }

    /// Parse whatever remains once the byte stream has closed.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = self.buffer.split();
        parse_block(&rest)
    }
}

fn parse_block(block: &[u8]) -> Option<SseEvent> {
    let text = String::from_utf8_lossy(block);
    let mut event = None;
    let mut data_lines = Vec::new();

    for line in text.split('\n') {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data_lines.push(value),
            _ => {}
        }
    }

    if event.is_none() && data_lines.is_empty() {
        return None;
    }

    let raw = data_lines.join("\n");
    let data = serde_json::from_str(&raw).unwrap_or(Value::String(raw));

    Some(SseEvent {
        event: event.unwrap_or_else(|| "message".to_string()),
        data,
    })
}

/// Lazily parse a byte stream into events, stopping after a done signal or
/// when the source closes.
pub fn parse_event_stream<S, E>(bytes: S) -> impl Stream<Item = Result<SseEvent, E>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Send + 'static,
{
    async_stream::stream! {
        let mut parser = SseParser::new();
        futures::pin_mut!(bytes);

        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(chunk) => parser.feed(&chunk),
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
            while let Some(event) = parser.next_event() {
                let done = event.is_done();
                yield Ok(event);
                if done {
                    return;
                }
            }
        }

        if let Some(event) = parser.finish() {
            yield Ok(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    #[test]
    fn test_token_event_format() {
        let frame = token_event("hello");
        assert_eq!(
            frame.as_ref(),
            b"event: token\ndata: {\"text\":\"hello\"}\n\n"
        );
    }

    #[test]
    fn test_emitted_event_parses_back() {
        let mut parser = SseParser::new();
        parser.feed(&token_event("x"));
        let event = parser.next_event().unwrap();
        assert_eq!(event.event, "token");
        assert_eq!(event.data, json!({ "text": "x" }));
        assert!(parser.next_event().is_none());
    }

    #[test]
    fn test_split_across_chunks_and_crlf() {
        let mut parser = SseParser::new();
        parser.feed(b"data: {\"a\":");
        assert!(parser.next_event().is_none());
        parser.feed(b"1}\r\n\r\n: keepalive\r\n\r\ndata: [DONE]\r\n\r\n");

        let first = parser.next_event().unwrap();
        assert_eq!(first.event, "message");
        assert_eq!(first.data, json!({ "a": 1 }));

        let done = parser.next_event().unwrap();
        assert!(done.is_done());
    }

    #[test]
    fn test_multiline_data_falls_back_to_text() {
        let mut parser = SseParser::new();
        parser.feed(b"event: note\ndata: line one\ndata: line two\n\n");
        let event = parser.next_event().unwrap();
        assert_eq!(event.event, "note");
        assert_eq!(event.data, Value::String("line one\nline two".into()));
    }

    #[test]
    fn test_finish_flushes_unterminated_block() {
        let mut parser = SseParser::new();
        parser.feed(b"data: tail");
        assert!(parser.next_event().is_none());
        assert_eq!(parser.finish().unwrap().data, Value::String("tail".into()));
    }

    #[tokio::test]
    async fn test_stream_stops_at_done() {
        let chunks: Vec<Result<Bytes, Infallible>> = vec![
            Ok(Bytes::from_static(b"data: {\"delta\":\"a\"}\n\ndata: [DONE]\n\n")),
            Ok(Bytes::from_static(b"data: {\"delta\":\"ignored\"}\n\n")),
        ];
        let events: Vec<_> = parse_event_stream(futures::stream::iter(chunks))
            .collect()
            .await;
        assert_eq!(events.len(), 2);
        assert!(events[1].as_ref().unwrap().is_done());
    }
}
