//! Streaming token normalization.
//!
//! Upstreams send either true deltas or cumulative-so-far text, and sometimes
//! mix the two within one response. [`TokenNormalizer`] turns both shapes into
//! deltas that never repeat or skip text.

use serde_json::Value;

/// Per-call normalization state. Owned by exactly one in-flight call.
#[derive(Debug, Default)]
pub struct TokenNormalizer {
    cumulative: String,
    last_chunk: String,
}

impl TokenNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one raw chunk and get the delta to emit. An empty result means
    /// the chunk was a duplicate.
    pub fn push<'a>(&mut self, raw: &'a str) -> &'a str {
        if raw.is_empty() || raw == self.last_chunk || raw == self.cumulative {
            return "";
        }

        let delta = if let Some(suffix) = raw.strip_prefix(self.cumulative.as_str()) {
            // cumulative-style chunk
            self.cumulative.push_str(suffix);
            suffix
        } else if self.cumulative.ends_with(raw) {
            // stale repeat of the tail
            ""
        } else {
            self.cumulative.push_str(raw);
            raw
        };

        self.last_chunk.clear();
        self.last_chunk.push_str(raw);
        delta
    }

    /// Text delivered so far.
    pub fn text(&self) -> &str {
        &self.cumulative
    }
}

/// Pull the text of one upstream payload.
///
/// Looks at `delta`, `output_text`, `choices[0].delta.content` and
/// `choices[0].message.content` in that order.
pub fn extract_token(payload: &Value) -> String {
    if let Some(text) = payload.get("delta").and_then(Value::as_str) {
        return text.to_string();
    }
    if let Some(text) = payload.get("output_text").and_then(Value::as_str) {
        return text.to_string();
    }

    let choice = payload.get("choices").and_then(|c| c.get(0));
    let delta = text_content(choice.and_then(|c| c.pointer("/delta/content")));
    if !delta.is_empty() {
        return delta;
    }
    text_content(choice.and_then(|c| c.pointer("/message/content")))
}

/// A content field as text: a string, or the concatenated parts of an array
/// whose items are strings or `{text}` objects.
fn text_content(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| match part {
                Value::String(text) => Some(text.as_str()),
                other => other.get("text").and_then(Value::as_str),
            })
            .collect(),
        _ => String::new(),
    }
}
