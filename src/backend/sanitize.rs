//! Output cleanup for terminal display.

use regex::Regex;
use std::sync::LazyLock;

use crate::resolver::OutputMode;

/// Longest brief answer, in characters.
const BRIEF_MAX_CHARS: usize = 140;

static MARKUP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[*_`~>#]").unwrap());
static BULLET: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^[ \t]*[-•][ \t]+").unwrap());
static BLANK_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());
static PARAGRAPH_BREAK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{2,}").unwrap());
static CITATION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[\d+\]").unwrap());
static SOURCES_TRAILER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(^|\n)\s*Sources?:[\s\S]*$").unwrap());
static ANSWER_LABEL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^Answer:\s*").unwrap());
static FIRST_SENTENCE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^.!?]+[.!?]?").unwrap());
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Strip markup, duplicate paragraphs and (optionally) citations, then apply
/// the brief-mode cut.
pub fn sanitize_output(text: &str, mode: OutputMode, show_sources: bool) -> String {
    let value = text.trim().replace("\r\n", "\n");
    let value = MARKUP.replace_all(&value, "");
    let value = BULLET.replace_all(&value, "");
    let value = BLANK_RUN.replace_all(&value, "\n\n");

    let mut paragraphs: Vec<&str> = Vec::new();
    for paragraph in PARAGRAPH_BREAK.split(value.trim()) {
        let paragraph = paragraph.trim();
        if !paragraph.is_empty() && !paragraphs.contains(&paragraph) {
            paragraphs.push(paragraph);
        }
    }
    let mut value = paragraphs.join("\n\n");

    if !show_sources {
        let uncited = CITATION.replace_all(&value, "").into_owned();
        let trimmed = SOURCES_TRAILER.replace(&uncited, "");
        value = trimmed.trim().to_string();
    }

    if mode == OutputMode::Brief {
        return brief(&value);
    }

    value
}

fn brief(value: &str) -> String {
    let line = value
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or(value);
    let line = ANSWER_LABEL.replace(line, "");
    let line = line.trim();
    let sentence = FIRST_SENTENCE
        .find(line)
        .map(|m| m.as_str())
        .unwrap_or(line)
        .trim();
    let compact = WHITESPACE.replace_all(sentence, " ");
    let compact = compact.trim();

    if compact.chars().count() > BRIEF_MAX_CHARS {
        let cut: String = compact.chars().take(BRIEF_MAX_CHARS - 1).collect();
        return format!("{}…", cut.trim());
    }
    compact.to_string()
}
