//! Tool-activity recognition for streamed agent output.

use std::sync::OnceLock;

use regex::Regex;

/// Prefixes the agent prints in front of tool calls
pub const TOOL_PREFIXES: [&str; 6] = ["→ ", "← ", "✱ ", "$ ", "⚙ ", "• "];

fn ansi_escape() -> &'static Regex {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    ANSI.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*[a-zA-Z]").expect("valid ANSI regex"))
}

/// Strip ANSI escape sequences
pub fn strip_ansi(line: &str) -> String {
    ansi_escape().replace_all(line, "").into_owned()
}

/// Activity description carried by `raw_line`, if it starts with a tool prefix
/// once escape sequences and surrounding whitespace are removed.
pub fn parse_activity_line(raw_line: &str) -> Option<String> {
    let cleaned = strip_ansi(raw_line);
    let cleaned = cleaned.trim();

    TOOL_PREFIXES
        .iter()
        .any(|prefix| cleaned.starts_with(prefix))
        .then(|| cleaned.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_with_ansi() {
        assert_eq!(
            parse_activity_line("\x1b[32m✱ Glob\x1b[0m found 3 files").as_deref(),
            Some("✱ Glob found 3 files")
        );
    }

    #[test]
    fn test_read_and_write() {
        assert_eq!(
            parse_activity_line("\x1b[34m→ Read\x1b[0m src/main.py").as_deref(),
            Some("→ Read src/main.py")
        );
        assert_eq!(
            parse_activity_line("\x1b[34m← Write\x1b[0m src/output.py").as_deref(),
            Some("← Write src/output.py")
        );
    }

    #[test]
    fn test_shell_and_settings() {
        assert_eq!(
            parse_activity_line("\x1b[33m$ git status\x1b[0m").as_deref(),
            Some("$ git status")
        );
        assert_eq!(
            parse_activity_line("⚙ Settings updated").as_deref(),
            Some("⚙ Settings updated")
        );
    }

    #[test]
    fn test_nested_codes_and_whitespace() {
        assert_eq!(
            parse_activity_line("\x1b[1m\x1b[34m→ Read\x1b[0m\x1b[0m /workspace/src/main.py")
                .as_deref(),
            Some("→ Read /workspace/src/main.py")
        );
        assert_eq!(
            parse_activity_line("  \x1b[32m✱ Glob\x1b[0m results  \n").as_deref(),
            Some("✱ Glob results")
        );
        assert_eq!(
            parse_activity_line("\x1b[0m• \x1b[0mCreate Speckit plan\x1b[90m General Agent\x1b[0m")
                .as_deref(),
            Some("• Create Speckit plan General Agent")
        );
    }

    #[test]
    fn test_non_activity_lines() {
        assert_eq!(parse_activity_line("Starting benchmark run..."), None);
        assert_eq!(parse_activity_line(""), None);
        assert_eq!(parse_activity_line("\x1b[32m\x1b[0m"), None);
        assert_eq!(
            parse_activity_line("\x1b[32mINFO\x1b[0m: Container started successfully"),
            None
        );
    }
}
