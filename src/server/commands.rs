//! Terminal commands behind `POST /api/cli`.

use std::sync::LazyLock;
use std::time::Duration;

use axum::http::StatusCode;
use regex::Regex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::AppState;
use crate::backend::{code_prompt, summarize_prompt};
use crate::error::{ApiError, FetchError};
use crate::fetch::FetchRequest;
use crate::resolver::EffectiveConfig;

/// Fetched page text handed to the summarizer is cut to this many chars.
const SUMMARY_SOURCE_CHARS: usize = 9000;

const WEATHER_BASE: &str = "https://wttr.in/";

/// Curated documentation links, matched in order by substring.
const DOCS: &[(&str, &str, &str)] = &[
    (
        "javascript",
        "MDN JS Guide",
        "https://developer.mozilla.org/docs/Web/JavaScript/Guide",
    ),
    (
        "js",
        "MDN JS Guide",
        "https://developer.mozilla.org/docs/Web/JavaScript/Guide",
    ),
    ("node", "Node.js Docs", "https://nodejs.org/docs/latest/api/"),
    ("react", "React Docs", "https://react.dev/learn"),
    ("css", "MDN CSS", "https://developer.mozilla.org/docs/Web/CSS"),
    ("html", "MDN HTML", "https://developer.mozilla.org/docs/Web/HTML"),
    (
        "typescript",
        "TypeScript Handbook",
        "https://www.typescriptlang.org/docs/",
    ),
    ("python", "Python Docs", "https://docs.python.org/3/"),
    (
        "openai",
        "OpenAI Docs",
        "https://platform.openai.com/docs/overview",
    ),
    ("perplexity", "Perplexity API Docs", "https://docs.perplexity.ai/"),
    ("rust", "The Rust Book", "https://doc.rust-lang.org/book/"),
];

static SCRIPT_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script.*?</script>").unwrap());
static STYLE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<style.*?</style>").unwrap());
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Known command names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Status,
    Ask,
    Code,
    Docs,
    Weather,
    SummarizeUrl,
    Unknown,
}

impl Command {
    fn from_name(name: &str) -> Self {
        match name {
            "status" => Command::Status,
            "ask" => Command::Ask,
            "code" => Command::Code,
            "docs" => Command::Docs,
            "weather" => Command::Weather,
            "summarize-url" => Command::SummarizeUrl,
            _ => Command::Unknown,
        }
    }

    /// Whether the command is answered by a provider.
    pub fn is_answer(&self) -> bool {
        matches!(self, Command::Ask | Command::Code | Command::SummarizeUrl)
    }
}

/// A command split into its name and argument text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    /// Trimmed input as received.
    pub raw: String,
    pub command: Command,
    /// Arguments with runs of whitespace collapsed.
    pub args: String,
    /// Everything after the command name, inner whitespace and newlines kept.
    pub rest: String,
}

impl CommandLine {
    /// Split `input`, rejecting empty and oversized commands.
    pub fn parse(input: &str, max_length: usize) -> Result<Self, ApiError> {
        let raw = input.trim();
        if raw.is_empty() {
            return Err(ApiError::bad_request("EMPTY_COMMAND", "No command received."));
        }
        if raw.chars().count() > max_length {
            return Err(ApiError::bad_request(
                "COMMAND_TOO_LONG",
                format!("Command exceeds max length ({}).", max_length),
            ));
        }

        let (name, rest) = raw
            .split_once(char::is_whitespace)
            .unwrap_or((raw, ""));
        let rest = rest.trim();
        let args = rest.split_whitespace().collect::<Vec<_>>().join(" ");

        Ok(Self {
            raw: raw.to_string(),
            command: Command::from_name(&name.to_lowercase()),
            args,
            rest: rest.to_string(),
        })
    }

    /// Text the caller actually asked about, for usage estimates.
    pub fn prompt_text(&self) -> &str {
        if self.args.is_empty() {
            &self.raw
        } else if self.command == Command::Ask {
            &self.rest
        } else {
            &self.args
        }
    }
}

/// Run one parsed command and produce the response text.
pub(super) async fn run(
    state: &AppState,
    line: &CommandLine,
    config: &EffectiveConfig,
    cancel: &CancellationToken,
) -> Result<String, ApiError> {
    match line.command {
        Command::Status => Ok(status(state)),
        Command::Ask => ask(state, &line.rest, config, cancel).await,
        Command::Code => {
            if line.args.is_empty() {
                return Ok("Usage: code <what to generate>".to_string());
            }
            let prompt = code_prompt(&line.args);
            Ok(state.adapter.answer(&prompt, config, cancel).await?)
        }
        Command::Docs => Ok(docs(&line.args)),
        Command::Weather => weather(state, &line.args, cancel).await,
        Command::SummarizeUrl => summarize_url(state, &line.args, config, cancel).await,
        Command::Unknown => Ok(format!(
            "Command received by API: \"{}\". Try \"help\", \"ask <prompt>\", \"weather <location>\", \
             \"docs <topic>\", \"code <task>\", or \"summarize-url <url>\".",
            line.raw
        )),
    }
}

fn status(state: &AppState) -> String {
    format!(
        "STATUS ONLINE | version={} | host={} | uptime={}",
        env!("CARGO_PKG_VERSION"),
        state.hostname(),
        format_uptime(state.started_at().elapsed())
    )
}

/// `Hh Mm Ss`, hours unbounded.
pub(super) fn format_uptime(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    format!(
        "{}h {}m {}s",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

/// Validate an ask prompt against the configured length limit.
pub(super) fn validate_prompt(prompt: &str, max_length: usize) -> Result<(), ApiError> {
    if prompt.is_empty() {
        return Err(ApiError::bad_request(
            "ASK_PROMPT_REQUIRED",
            "Usage: ask <prompt>",
        ));
    }
    if prompt.chars().count() > max_length {
        return Err(ApiError::bad_request(
            "ASK_PROMPT_TOO_LONG",
            format!("Prompt exceeds max length ({}).", max_length),
        ));
    }
    Ok(())
}

async fn ask(
    state: &AppState,
    prompt: &str,
    config: &EffectiveConfig,
    cancel: &CancellationToken,
) -> Result<String, ApiError> {
    validate_prompt(prompt, state.config.server.ask_max_length)?;
    Ok(state.adapter.answer(prompt, config, cancel).await?)
}

fn docs(topic_raw: &str) -> String {
    let topic = topic_raw.trim().to_lowercase();
    if topic.is_empty() {
        return "Usage: docs <topic>\nExamples: docs javascript, docs react, docs node, docs openai"
            .to_string();
    }

    if let Some((key, title, link)) = DOCS.iter().find(|(key, _, _)| topic.contains(key)) {
        return format!("Answer: Documentation for {}\nDetails:\n- {}\n- {}", key, title, link);
    }

    let search = Url::parse_with_params(
        "https://duckduckgo.com/",
        &[("q", format!("{} documentation", topic))],
    )
    .map(String::from)
    .unwrap_or_else(|_| "https://duckduckgo.com/".to_string());

    format!(
        "Answer: No curated docs match for \"{}\".\nDetails:\n- Try search: {}\n- Or run: docs javascript | docs react | docs node | docs openai",
        topic_raw, search
    )
}

fn weather_url(location: &str, format: &str) -> Result<Url, ApiError> {
    let mut url = Url::parse(WEATHER_BASE).map_err(|_| ApiError::internal())?;
    url.path_segments_mut()
        .map_err(|_| ApiError::internal())?
        .pop_if_empty()
        .push(location);
    url.set_query(Some(&format!("format={}", format)));
    Ok(url)
}

async fn weather(
    state: &AppState,
    location: &str,
    cancel: &CancellationToken,
) -> Result<String, ApiError> {
    if location.is_empty() {
        return Ok("Usage: weather <location>".to_string());
    }

    let detailed = weather_url(location, "j1")?;
    match state
        .fetcher
        .fetch(FetchRequest::get(detailed.as_str()), cancel)
        .await
    {
        Ok(doc) if doc.is_success() => {
            if let Some(report) = render_weather(&doc.body, location) {
                return Ok(report);
            }
            tracing::debug!("Unreadable weather payload, trying plain format");
        }
        Ok(doc) => tracing::debug!(status = %doc.status, "Weather lookup failed, trying plain format"),
        Err(FetchError::Aborted) => return Err(FetchError::Aborted.into()),
        Err(e) => tracing::debug!(error = %e, "Weather lookup failed, trying plain format"),
    }

    let plain = weather_url(location, "3")?;
    let doc = state
        .fetcher
        .fetch(FetchRequest::get(plain.as_str()), cancel)
        .await?;
    if !doc.is_success() {
        return Err(fetch_failed(format!(
            "Weather lookup failed ({}).",
            doc.status.as_u16()
        )));
    }
    Ok(format!("Answer: {}", doc.text().trim()))
}

/// Render the wttr.in JSON report, or `None` when it cannot be parsed.
fn render_weather(body: &[u8], location: &str) -> Option<String> {
    let data: Value = serde_json::from_slice(body).ok()?;
    let current = data.pointer("/current_condition/0");
    let field = |path: &str| current.and_then(|c| c.pointer(path));

    let text = |value: Option<&Value>, fallback: &str| -> String {
        value
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or(fallback)
            .to_string()
    };

    let area = text(data.pointer("/nearest_area/0/areaName/0/value"), location);
    let desc = text(field("/weatherDesc/0/value"), "Unknown");
    let temp_c = text(field("/temp_C"), "?");
    let humidity = text(field("/humidity"), "?");
    let wind = text(field("/windspeedKmph"), "?");

    Some(format!(
        "Answer: Weather for {}: {}, {}°C.\nDetails:\n- Humidity: {}%\n- Wind: {} km/h",
        area, desc, temp_c, humidity, wind
    ))
}

async fn summarize_url(
    state: &AppState,
    url: &str,
    config: &EffectiveConfig,
    cancel: &CancellationToken,
) -> Result<String, ApiError> {
    let lower = url.to_ascii_lowercase();
    if !(lower.starts_with("http://") || lower.starts_with("https://")) {
        return Ok("Usage: summarize-url <https://...>".to_string());
    }

    let doc = state.fetcher.fetch(FetchRequest::get(url), cancel).await?;
    if !doc.is_success() {
        return Err(fetch_failed(format!(
            "Could not fetch URL ({}).",
            doc.status.as_u16()
        )));
    }

    let plain: String = strip_html(&doc.text())
        .chars()
        .take(SUMMARY_SOURCE_CHARS)
        .collect();
    if plain.is_empty() {
        return Ok("No readable text found at URL.".to_string());
    }

    tracing::debug!(url = %doc.url, chars = plain.len(), "Summarizing fetched page");
    Ok(state
        .adapter
        .answer(&summarize_prompt(&plain), config, cancel)
        .await?)
}

fn fetch_failed(message: String) -> ApiError {
    ApiError::new(StatusCode::BAD_GATEWAY, "URL_FETCH_FAILED", message, true)
}

/// Drop scripts, styles and tags, then collapse whitespace.
pub fn strip_html(html: &str) -> String {
    let without_scripts = SCRIPT_BLOCK.replace_all(html, " ");
    let without_styles = STYLE_BLOCK.replace_all(&without_scripts, " ");
    let without_tags = TAG.replace_all(&without_styles, " ");
    WHITESPACE
        .replace_all(&without_tags, " ")
        .trim()
        .to_string()
}
