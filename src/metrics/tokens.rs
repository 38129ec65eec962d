//! Token accounting.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

/// Session export written by the agent inside the workspace
pub const SESSION_FILE: &str = "opencode_session.json";

/// Categories summed from a session export
pub const SESSION_CATEGORIES: [&str; 6] =
    ["total", "input", "output", "reasoning", "cache_read", "cache_write"];

pub type TokenUsage = BTreeMap<String, u64>;

/// Sum token counts across every message of the session export in `workspace`.
///
/// Returns `None` when the file is missing or unreadable as JSON. Accepts both
/// `{"messages": [...]}` and a bare message array. Messages without token data
/// are skipped; every category is present (zero when nothing contributed).
pub fn usage_from_session(workspace: &Path) -> Option<TokenUsage> {
    let path = workspace.join(SESSION_FILE);
    let content = std::fs::read_to_string(&path).ok()?;
    let session: Value = match serde_json::from_str(&content) {
        Ok(value) => value,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Unreadable session export");
            return None;
        }
    };

    let messages = match &session {
        Value::Array(messages) => messages.as_slice(),
        Value::Object(map) => map
            .get("messages")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default(),
        _ => return None,
    };

    let mut totals: TokenUsage = SESSION_CATEGORIES
        .iter()
        .map(|category| (category.to_string(), 0))
        .collect();

    for message in messages {
        let Some(tokens) = message.pointer("/info/tokens").filter(|t| t.is_object()) else {
            continue;
        };

        let count = |pointer: &str| tokens.pointer(pointer).and_then(Value::as_u64).unwrap_or(0);
        for (category, pointer) in [
            ("total", "/total"),
            ("input", "/input"),
            ("output", "/output"),
            ("reasoning", "/reasoning"),
            ("cache_read", "/cache/read"),
            ("cache_write", "/cache/write"),
        ] {
            if let Some(total) = totals.get_mut(category) {
                *total += count(pointer);
            }
        }
    }

    Some(totals)
}

fn output_markers() -> &'static [(Regex, &'static str); 3] {
    static MARKERS: OnceLock<[(Regex, &'static str); 3]> = OnceLock::new();
    MARKERS.get_or_init(|| {
        [
            (r"(?i)input[_\s]tokens?[:\s]+(\d+)", "input_tokens"),
            (r"(?i)output[_\s]tokens?[:\s]+(\d+)", "output_tokens"),
            (r"(?i)total[_\s]tokens?[:\s]+(\d+)", "total_tokens"),
        ]
        .map(|(pattern, key)| (Regex::new(pattern).expect("valid token regex"), key))
    })
}

/// Token counts printed in captured output. First match per category wins;
/// categories that never appear are absent.
pub fn usage_from_output(output: &str) -> TokenUsage {
    output_markers()
        .iter()
        .filter_map(|(regex, key)| {
            let value = regex.captures(output)?.get(1)?.as_str().parse().ok()?;
            Some((key.to_string(), value))
        })
        .collect()
}
