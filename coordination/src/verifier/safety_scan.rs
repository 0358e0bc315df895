//! Pre-gate safety scan — a cheap regex sweep over the agent's diff for
//! patterns that are dangerous enough to flag before spending gate time,
//! even though none of them block the pipeline on their own.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Command;
use std::sync::LazyLock;

use regex::Regex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyWarning {
    pub category: String,
    pub file: String,
    pub reason: String,
}

static RM_RF: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"rm\s+-rf\s").unwrap());
static CURL_PIPE_SH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"curl[^\n]*\|\s*(sh|bash)").unwrap());
static HARDCODED_SECRET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(api[_-]?key|secret|password|token)\s*[:=]\s*["'][A-Za-z0-9_\-]{12,}["']"#).unwrap()
});
static UNSAFE_BLOCK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bunsafe\b").unwrap());

fn patterns() -> [(&'static str, &'static Regex, &'static str); 4] {
    [
        ("destructive-shell", &RM_RF, "recursive force-delete in an added line"),
        ("remote-code-exec", &CURL_PIPE_SH, "pipes a remote download into a shell"),
        ("hardcoded-secret", &HARDCODED_SECRET, "looks like a hardcoded credential"),
        ("unsafe-block", &UNSAFE_BLOCK, "introduces an `unsafe` block"),
    ]
}

/// Scan the working tree's uncommitted diff for dangerous patterns.
/// Best-effort: returns no warnings outside a git repo or on subprocess failure.
pub fn scan_diff(working_dir: impl AsRef<Path>) -> Vec<SafetyWarning> {
    let output = Command::new("git")
        .args(["diff", "HEAD", "--unified=0"])
        .current_dir(working_dir.as_ref())
        .output();

    let diff = match output {
        Ok(o) if o.status.success() => String::from_utf8_lossy(&o.stdout).into_owned(),
        _ => return Vec::new(),
    };

    let mut warnings = Vec::new();
    let mut current_file = String::new();

    for line in diff.lines() {
        if let Some(path) = line.strip_prefix("+++ b/") {
            current_file = path.to_string();
            continue;
        }
        if !line.starts_with('+') || line.starts_with("+++") {
            continue;
        }
        for (category, regex, reason) in patterns() {
            if regex.is_match(line) {
                warnings.push(SafetyWarning {
                    category: category.to_string(),
                    file: current_file.clone(),
                    reason: reason.to_string(),
                });
            }
        }
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_outside_git_repo_returns_no_warnings() {
        let dir = tempfile::tempdir().unwrap();
        assert!(scan_diff(dir.path()).is_empty());
    }

    #[test]
    fn rm_rf_pattern_matches() {
        assert!(RM_RF.is_match("rm -rf /tmp/build"));
        assert!(!RM_RF.is_match("rm -f file.txt"));
    }

    #[test]
    fn unsafe_pattern_matches() {
        assert!(UNSAFE_BLOCK.is_match("unsafe { ptr.read() }"));
        assert!(!UNSAFE_BLOCK.is_match("// this function is safe"));
    }
}
