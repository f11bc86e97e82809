//! System instruction assembly.

use crate::resolver::{EffectiveConfig, OutputMode};

/// Build the system instruction for one call from the base prompt and the
/// caller's effective settings.
pub fn build_instruction(system_prompt: &str, config: &EffectiveConfig) -> String {
    let mode_rule = match config.output_mode() {
        OutputMode::Brief => "Keep response under 45 words in one short paragraph.",
        OutputMode::Deep => {
            "Provide a detailed but concise answer in under 220 words with short sections."
        }
        OutputMode::Standard => {
            "Format as: \"Answer: ...\" then \"Details:\" with 1-3 short bullets. \
             Limit to about 80 words unless the user explicitly asks for detail."
        }
    };

    let source_rule = if config.show_sources() {
        "If useful, add a final \"Sources:\" line with up to 3 URLs. Avoid numeric citation markers."
    } else {
        "Do not include citation markers like [1], and do not include a Sources section."
    };

    let memory_rule = memory_rule(config);

    [system_prompt.trim(), mode_rule, source_rule, memory_rule.as_str()]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn memory_rule(config: &EffectiveConfig) -> String {
    if !config.memory_enabled() {
        return String::new();
    }
    let notes = config.memory_notes();
    let turns = config.memory_turns();
    if notes.is_empty() && turns.is_empty() {
        return String::new();
    }

    let mut parts = Vec::new();
    if !notes.is_empty() {
        let list: Vec<String> = notes.iter().map(|note| format!("- {}", note)).collect();
        parts.push(format!("Memory notes: {}", list.join(" ")));
    }
    if !turns.is_empty() {
        let list: Vec<String> = turns
            .iter()
            .map(|turn| format!("Q:{} A:{}", turn.q, turn.a))
            .collect();
        parts.push(format!("Recent turns: {}", list.join(" | ")));
    }
    parts.push("Use this context only when relevant.".to_string());
    parts.join(" ")
}

/// Prompt for the `code` command.
pub fn code_prompt(task: &str) -> String {
    format!(
        "Write clean code for: {}. Include only one short explanation and one code block.",
        task
    )
}

/// Prompt for the `summarize-url` command.
pub fn summarize_prompt(text: &str) -> String {
    format!(
        "Summarize this page in a compact terminal-friendly format:\n\n{}",
        text
    )
}
