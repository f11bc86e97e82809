//! SSE framing, parsing and response writing.

mod sse;
mod writer;

pub use sse::{
    done_event, error_event, format_event, parse_event_stream, token_event, SseEvent, SseParser,
    SSE_CONTENT_TYPE,
};
pub use writer::{ClientGone, SseBody, SseWriter};
