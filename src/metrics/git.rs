//! Commit and diff statistics of the checked-out repository.

use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

const GIT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitDiffStats {
    pub files_changed: u64,
    pub insertions: u64,
    pub deletions: u64,
}

async fn git(repo: &Path, args: &[&str]) -> Option<String> {
    let mut cmd = Command::new("git");
    cmd.args(args).current_dir(repo).stdin(Stdio::null());

    match timeout(GIT_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) if output.status.success() => {
            Some(String::from_utf8_lossy(&output.stdout).into_owned())
        }
        Ok(Ok(_)) => None,
        Ok(Err(e)) => {
            debug!(repo = %repo.display(), error = %e, "git unavailable");
            None
        }
        Err(_) => None,
    }
}

/// Whether `repo` has a commit, and the stat of the last commit's diff.
/// Anything that goes wrong reads as "no commits".
pub async fn collect_git_metrics(repo: &Path) -> (bool, GitDiffStats) {
    if !repo.is_dir() {
        return (false, GitDiffStats::default());
    }

    if git(repo, &["rev-parse", "HEAD"]).await.is_none() {
        return (false, GitDiffStats::default());
    }

    let stats = git(repo, &["diff", "--stat", "HEAD~1"])
        .await
        .map(|stdout| parse_diff_stat(&stdout))
        .unwrap_or_default();

    (true, stats)
}

fn summary_regex() -> &'static Regex {
    static SUMMARY: OnceLock<Regex> = OnceLock::new();
    SUMMARY.get_or_init(|| {
        Regex::new(
            r"(\d+) files? changed(?:, (\d+) insertions?\(\+\))?(?:, (\d+) deletions?\(-\))?",
        )
        .expect("valid diff summary regex")
    })
}

/// Parse the summary line of `git diff --stat`
pub fn parse_diff_stat(output: &str) -> GitDiffStats {
    let Some(summary) = output.trim().lines().last() else {
        return GitDiffStats::default();
    };
    let Some(caps) = summary_regex().captures(summary) else {
        return GitDiffStats::default();
    };

    let number = |i: usize| {
        caps.get(i)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0)
    };

    GitDiffStats {
        files_changed: number(1),
        insertions: number(2),
        deletions: number(3),
    }
}
