//! Per-request configuration resolution.
//!
//! Server defaults are merged with caller overrides carried in request headers.
//! Every override is validated before anything is applied, so a single bad
//! header rejects the whole request.

use std::fmt;
use std::str::FromStr;

use axum::http::HeaderMap;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::config::{parse_flag, ProvidersConfig};
use crate::error::{InvalidOverride, OverrideField};

/// Longest accepted `x-ai-key` value, in characters.
pub const MAX_API_KEY_LENGTH: usize = 4096;
const MAX_MEMORY_NOTES: usize = 12;
const MAX_NOTE_LENGTH: usize = 200;
const MAX_MEMORY_TURNS: usize = 4;
const MAX_TURN_QUESTION_LENGTH: usize = 220;
const MAX_TURN_ANSWER_LENGTH: usize = 280;
const MAX_SESSION_ID_LENGTH: usize = 80;

/// Key prefix that identifies a Perplexity credential.
const PERPLEXITY_KEY_PREFIX: &str = "pplx-";

/// Completion provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Perplexity,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Perplexity => "perplexity",
        }
    }

    /// Human-readable name used in messages.
    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "OpenAI",
            ProviderKind::Perplexity => "Perplexity",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "perplexity" => Ok(ProviderKind::Perplexity),
            _ => Err(()),
        }
    }
}

/// Answer verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    Brief,
    #[default]
    Standard,
    Deep,
}

impl OutputMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputMode::Brief => "brief",
            OutputMode::Standard => "standard",
            OutputMode::Deep => "deep",
        }
    }
}

impl FromStr for OutputMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "brief" => Ok(OutputMode::Brief),
            "standard" => Ok(OutputMode::Standard),
            "deep" => Ok(OutputMode::Deep),
            _ => Err(()),
        }
    }
}

/// One prior question/answer exchange supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MemoryTurn {
    #[serde(default)]
    pub q: String,
    #[serde(default)]
    pub a: String,
}

/// Raw override values as received, before validation.
#[derive(Debug, Clone, Default)]
pub struct RequestOverrides {
    pub provider: Option<String>,
    pub api_key: Option<String>,
    pub output_mode: Option<String>,
    pub show_sources: Option<String>,
    pub memory_enabled: Option<String>,
    pub memory_notes: Option<String>,
    pub memory_turns: Option<String>,
    pub session_id: Option<String>,
}

impl RequestOverrides {
    /// Collect overrides from request headers. Blank headers count as absent.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        Self {
            provider: get("x-ai-provider"),
            api_key: get("x-ai-key"),
            output_mode: get("x-output-mode"),
            show_sources: get("x-show-sources"),
            memory_enabled: get("x-memory-enabled"),
            memory_notes: get("x-memory-notes"),
            memory_turns: get("x-memory-turns"),
            session_id: get("x-session-id"),
        }
    }
}

/// Fully resolved settings for one request. Immutable after construction.
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    provider: Option<ProviderKind>,
    openai_key: Option<String>,
    perplexity_key: Option<String>,
    output_mode: OutputMode,
    show_sources: bool,
    memory_enabled: bool,
    memory_notes: Vec<String>,
    memory_turns: Vec<MemoryTurn>,
    session_id: Option<String>,
}

impl EffectiveConfig {
    /// Merge server defaults with validated caller overrides.
    pub fn resolve(
        base: &ProvidersConfig,
        overrides: &RequestOverrides,
    ) -> Result<Self, InvalidOverride> {
        let explicit_provider = match overrides.provider.as_deref() {
            Some(raw) => Some(ProviderKind::from_str(raw).map_err(|_| InvalidOverride {
                field: OverrideField::Provider,
            })?),
            None => None,
        };

        if let Some(key) = overrides.api_key.as_deref() {
            if key.chars().count() > MAX_API_KEY_LENGTH {
                return Err(InvalidOverride {
                    field: OverrideField::ApiKey,
                });
            }
        }

        let output_mode = match overrides.output_mode.as_deref() {
            Some(raw) => OutputMode::from_str(raw).map_err(|_| InvalidOverride {
                field: OverrideField::OutputMode,
            })?,
            None => base.output_mode,
        };

        let show_sources = match overrides.show_sources.as_deref() {
            Some(raw) => parse_flag(raw).ok_or(InvalidOverride {
                field: OverrideField::ShowSources,
            })?,
            None => base.show_sources,
        };

        let memory_enabled = match overrides.memory_enabled.as_deref() {
            Some(raw) => parse_flag(raw).ok_or(InvalidOverride {
                field: OverrideField::MemoryEnabled,
            })?,
            None => true,
        };

        let mut provider = explicit_provider.or(base.default_provider);
        let mut openai_key = base.openai.api_key.clone();
        let mut perplexity_key = base.perplexity.api_key.clone();

        if let Some(key) = overrides.api_key.clone() {
            let target = explicit_provider.unwrap_or_else(|| infer_provider(&key));
            match target {
                ProviderKind::OpenAi => openai_key = Some(key),
                ProviderKind::Perplexity => perplexity_key = Some(key),
            }
            provider = Some(target);
        }

        let memory_notes = overrides
            .memory_notes
            .as_deref()
            .map(decode_notes)
            .unwrap_or_default();
        let memory_turns = overrides
            .memory_turns
            .as_deref()
            .map(decode_turns)
            .unwrap_or_default();

        Ok(Self {
            provider,
            openai_key,
            perplexity_key,
            output_mode,
            show_sources,
            memory_enabled,
            memory_notes,
            memory_turns,
            session_id: overrides
                .session_id
                .as_deref()
                .map(normalize_session_id)
                .filter(|id| !id.is_empty()),
        })
    }

    /// Provider to call: explicit choice, else whichever credential is present.
    pub fn selected_provider(&self) -> Option<ProviderKind> {
        if self.provider.is_some() {
            return self.provider;
        }
        if self.perplexity_key.is_some() {
            return Some(ProviderKind::Perplexity);
        }
        if self.openai_key.is_some() {
            return Some(ProviderKind::OpenAi);
        }
        None
    }

    /// Credential for the given provider, if any.
    pub fn credential(&self, kind: ProviderKind) -> Option<&str> {
        match kind {
            ProviderKind::OpenAi => self.openai_key.as_deref(),
            ProviderKind::Perplexity => self.perplexity_key.as_deref(),
        }
    }

    pub fn output_mode(&self) -> OutputMode {
        self.output_mode
    }

    pub fn show_sources(&self) -> bool {
        self.show_sources
    }

    pub fn memory_enabled(&self) -> bool {
        self.memory_enabled
    }

    pub fn memory_notes(&self) -> &[String] {
        &self.memory_notes
    }

    pub fn memory_turns(&self) -> &[MemoryTurn] {
        &self.memory_turns
    }

    /// Sanitized session id, `None` when the caller sent none.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }
}

fn infer_provider(key: &str) -> ProviderKind {
    if key.starts_with(PERPLEXITY_KEY_PREFIX) {
        ProviderKind::Perplexity
    } else {
        ProviderKind::OpenAi
    }
}

fn decode_blob(raw: &str) -> Option<serde_json::Value> {
    let bytes = STANDARD
        .decode(raw)
        .or_else(|_| STANDARD_NO_PAD.decode(raw.trim_end_matches('=')))
        .ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn decode_notes(raw: &str) -> Vec<String> {
    let Some(serde_json::Value::Array(items)) = decode_blob(raw) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| item.as_str())
        .map(|note| clamp_text(note, MAX_NOTE_LENGTH))
        .filter(|note| !note.is_empty())
        .take(MAX_MEMORY_NOTES)
        .collect()
}

fn decode_turns(raw: &str) -> Vec<MemoryTurn> {
    let Some(serde_json::Value::Array(items)) = decode_blob(raw) else {
        return Vec::new();
    };

    items
        .into_iter()
        .filter_map(|item| serde_json::from_value::<MemoryTurn>(item).ok())
        .map(|turn| MemoryTurn {
            q: clamp_text(&turn.q, MAX_TURN_QUESTION_LENGTH),
            a: clamp_text(&turn.a, MAX_TURN_ANSWER_LENGTH),
        })
        .filter(|turn| !turn.q.is_empty() && !turn.a.is_empty())
        .take(MAX_MEMORY_TURNS)
        .collect()
}

/// Trim and cap `text` at `max` characters, marking truncation with an ellipsis.
pub fn clamp_text(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Keep `[A-Za-z0-9._:-]` and cap the length.
pub fn normalize_session_id(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-'))
        .take(MAX_SESSION_ID_LENGTH)
        .collect()
}
