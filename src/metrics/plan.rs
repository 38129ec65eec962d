//! Plan-quality signals from generated text files.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// File patterns treated as plans, relative to the repository root
pub const PLAN_PATTERNS: [&str; 4] = ["*.md", "plan.txt", "PLAN.md", "PLAN.txt"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanMetrics {
    pub total_lines: u64,
    pub sections: u64,
    pub tasks: u64,
    /// Backticked file names, deduplicated and sorted
    pub files_referenced: Vec<String>,
}

struct PlanPatterns {
    section: Regex,
    task: Regex,
    file_ref: Regex,
}

fn patterns() -> &'static PlanPatterns {
    static PATTERNS: OnceLock<PlanPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| PlanPatterns {
        section: Regex::new(r"(?m)^#+\s").expect("valid section regex"),
        task: Regex::new(r"(?m)^[-*]\s\[[ x]\]").expect("valid task regex"),
        file_ref: Regex::new(r"`([^`]+\.[a-z]+)`").expect("valid file reference regex"),
    })
}

/// Plan files directly under `repo`, each listed once
pub fn find_plan_files(repo: &Path) -> Vec<PathBuf> {
    let base = glob::Pattern::escape(&repo.to_string_lossy());
    let mut files = BTreeSet::new();

    for pattern in PLAN_PATTERNS {
        let Ok(paths) = glob::glob(&format!("{}/{}", base, pattern)) else {
            continue;
        };
        files.extend(paths.flatten().filter(|p| p.is_file()));
    }

    files.into_iter().collect()
}

/// Count lines, sections, tasks and file references in one plan
fn scan(content: &str, metrics: &mut PlanMetrics, referenced: &mut BTreeSet<String>) {
    let patterns = patterns();
    metrics.total_lines += content.split('\n').count() as u64;
    metrics.sections += patterns.section.find_iter(content).count() as u64;
    metrics.tasks += patterns.task.find_iter(content).count() as u64;
    referenced.extend(
        patterns
            .file_ref
            .captures_iter(content)
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str().to_string()),
    );
}

/// Aggregate plan metrics over `<workspace>/repo`. Unreadable files are skipped.
pub fn collect_plan_metrics(workspace: &Path) -> PlanMetrics {
    let mut metrics = PlanMetrics::default();
    let mut referenced = BTreeSet::new();

    for file in find_plan_files(&workspace.join("repo")) {
        match std::fs::read_to_string(&file) {
            Ok(content) => scan(&content, &mut metrics, &mut referenced),
            Err(e) => debug!(path = %file.display(), error = %e, "Skipping plan file"),
        }
    }

    metrics.files_referenced = referenced.into_iter().collect();
    metrics
}
