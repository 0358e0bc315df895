//! Diff risk profile — cheap static analysis over `git diff` used to
//! auto-enable adaptive gates (deny/doc/nextest) in [`super::pipeline`].

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Command;

/// Coarse signals extracted from the working tree's uncommitted diff.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiffRiskProfile {
    pub files_changed: usize,
    pub lines_added: usize,
    pub has_unsafe: bool,
    pub has_cargo_toml_change: bool,
    pub has_public_api_change: bool,
    pub has_doc_change: bool,
}

impl DiffRiskProfile {
    /// Changing `Cargo.toml` (new/bumped dependencies) warrants an advisory scan.
    pub fn should_run_deny(&self) -> bool {
        self.has_cargo_toml_change
    }

    /// A changed public surface warrants a doc-build/doctest pass.
    pub fn should_run_doc(&self) -> bool {
        self.has_public_api_change || self.has_doc_change
    }

    /// Large changesets are worth the faster, more parallel nextest runner.
    pub fn should_prefer_nextest(&self) -> bool {
        self.files_changed >= 5 || self.lines_added >= 200
    }

    /// Compute a profile from `git diff` against the working tree's `HEAD`.
    /// Falls back to an all-false profile outside a git repo or on any
    /// subprocess failure — adaptive mode then simply enables nothing extra.
    pub fn from_working_dir(working_dir: impl AsRef<Path>) -> Self {
        let working_dir = working_dir.as_ref();

        let diff = Command::new("git")
            .args(["diff", "HEAD", "--unified=0"])
            .current_dir(working_dir)
            .output()
            .ok()
            .filter(|o| o.status.success())
            .map(|o| String::from_utf8_lossy(&o.stdout).into_owned())
            .unwrap_or_default();

        let name_status = Command::new("git")
            .args(["diff", "HEAD", "--name-only"])
            .current_dir(working_dir)
            .output()
            .ok()
            .filter(|o| o.status.success())
            .map(|o| String::from_utf8_lossy(&o.stdout).into_owned())
            .unwrap_or_default();

        let changed_files: Vec<&str> = name_status.lines().filter(|l| !l.is_empty()).collect();
        let added_lines: Vec<&str> = diff
            .lines()
            .filter(|l| l.starts_with('+') && !l.starts_with("+++"))
            .collect();

        Self {
            files_changed: changed_files.len(),
            lines_added: added_lines.len(),
            has_unsafe: added_lines.iter().any(|l| l.contains("unsafe")),
            has_cargo_toml_change: changed_files.iter().any(|f| f.ends_with("Cargo.toml")),
            has_public_api_change: added_lines
                .iter()
                .any(|l| l.trim_start_matches('+').trim_start().starts_with("pub ")),
            has_doc_change: changed_files.iter().any(|f| f.ends_with(".md"))
                || added_lines.iter().any(|l| l.trim_start_matches('+').trim_start().starts_with("///")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_profile_runs_nothing_extra() {
        let profile = DiffRiskProfile::default();
        assert!(!profile.should_run_deny());
        assert!(!profile.should_run_doc());
        assert!(!profile.should_prefer_nextest());
    }

    #[test]
    fn cargo_toml_change_flips_deny() {
        let profile = DiffRiskProfile {
            has_cargo_toml_change: true,
            ..Default::default()
        };
        assert!(profile.should_run_deny());
    }

    #[test]
    fn large_changeset_prefers_nextest() {
        let profile = DiffRiskProfile {
            files_changed: 6,
            ..Default::default()
        };
        assert!(profile.should_prefer_nextest());
    }

    #[test]
    fn from_working_dir_outside_git_repo_is_all_false() {
        let dir = tempfile::tempdir().unwrap();
        let profile = DiffRiskProfile::from_working_dir(dir.path());
        assert_eq!(profile.files_changed, 0);
        assert!(!profile.has_cargo_toml_change);
    }
}
