//! Validation battery
//!
//! Runs the configured subset of {type-check, tests, lint, build} in order,
//! each under its own timeout, and folds the results into a
//! [`ValidationReport`]. Lint failing with warnings-only output counts as a
//! pass with warnings.

use crate::pipeline::commit::CommitRecord;
use crate::process::{run_command, truncate_output, CommandSpec, ProcessError};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Characters of captured output kept per check.
const OUTPUT_LIMIT: usize = 8_000;

static ESLINT_SUMMARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\((\d+)\s+errors?,\s*(\d+)\s+warnings?\)").expect("valid summary pattern")
});
static ERROR_WORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\berror\b").expect("valid error pattern"));
static WARNING_WORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bwarning\b").expect("valid warning pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckKind {
    TypeCheck,
    Tests,
    Lint,
    Build,
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CheckKind::TypeCheck => "type-check",
            CheckKind::Tests => "tests",
            CheckKind::Lint => "lint",
            CheckKind::Build => "build",
        })
    }
}

/// One configured check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckConfig {
    pub kind: CheckKind,
    /// argv, e.g. `["npx", "tsc", "--noEmit"]`
    pub command: Vec<String>,
    #[serde(default = "default_check_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_check_timeout() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

pub fn default_checks() -> Vec<CheckConfig> {
    vec![
        CheckConfig {
            kind: CheckKind::TypeCheck,
            command: argv(&["npx", "tsc", "--noEmit"]),
            timeout_secs: 300,
            enabled: true,
        },
        CheckConfig {
            kind: CheckKind::Tests,
            command: argv(&["npm", "test", "--", "--run"]),
            timeout_secs: 600,
            enabled: false,
        },
        CheckConfig {
            kind: CheckKind::Lint,
            command: argv(&["npm", "run", "lint"]),
            timeout_secs: 300,
            enabled: true,
        },
        CheckConfig {
            kind: CheckKind::Build,
            command: argv(&["npm", "run", "build"]),
            timeout_secs: 900,
            enabled: false,
        },
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Passed,
    PassedWithWarnings,
    Failed,
    TimedOut,
    /// The command could not be started.
    Error,
}

impl CheckStatus {
    pub fn is_pass(self) -> bool {
        matches!(self, CheckStatus::Passed | CheckStatus::PassedWithWarnings)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub kind: CheckKind,
    pub command: String,
    pub status: CheckStatus,
    pub passed: bool,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub results: Vec<CheckResult>,
    pub overall: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<CommitRecord>,
}

impl ValidationReport {
    pub fn failures(&self) -> impl Iterator<Item = &CheckResult> {
        self.results.iter().filter(|r| !r.passed)
    }

    /// One line per check, for commit messages and notifications.
    pub fn summary_lines(&self) -> Vec<String> {
        self.results
            .iter()
            .map(|r| {
                let status = match r.status {
                    CheckStatus::Passed => "passed".to_string(),
                    CheckStatus::PassedWithWarnings => "passed with warnings".to_string(),
                    CheckStatus::Failed => format!("failed (exit {})", r.exit_code.unwrap_or(-1)),
                    CheckStatus::TimedOut => "timed out".to_string(),
                    CheckStatus::Error => "could not run".to_string(),
                };
                format!("{}: {}", r.kind, status)
            })
            .collect()
    }
}

/// Whether failing lint output contains warnings but no errors.
pub fn classify_lint_output(output: &str) -> bool {
    if let Some(caps) = ESLINT_SUMMARY.captures_iter(output).last() {
        let errors: u64 = caps[1].parse().unwrap_or(u64::MAX);
        let warnings: u64 = caps[2].parse().unwrap_or(0);
        return errors == 0 && warnings > 0;
    }
    let has_error = output.lines().any(|l| ERROR_WORD.is_match(l));
    let has_warning = output.lines().any(|l| WARNING_WORD.is_match(l));
    !has_error && has_warning
}

pub struct ValidationGate {
    project_root: PathBuf,
}

impl ValidationGate {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
        }
    }

    /// Run every enabled check, sequentially.
    pub async fn run(&self, checks: &[CheckConfig]) -> ValidationReport {
        let started_at = Utc::now();
        let enabled: Vec<&CheckConfig> = checks.iter().filter(|c| c.enabled).collect();
        if enabled.is_empty() {
            warn!("No validation checks enabled; validation passes vacuously");
        }

        let mut results = Vec::with_capacity(enabled.len());
        for check in enabled {
            let result = self.run_check(check).await;
            info!(
                "🔎 {} {} in {} ms",
                result.kind,
                if result.passed { "passed" } else { "failed" },
                result.duration_ms
            );
            results.push(result);
        }

        let overall = results.iter().all(|r| r.passed);
        ValidationReport {
            results,
            overall,
            started_at,
            finished_at: Utc::now(),
            commit: None,
        }
    }

    async fn run_check(&self, check: &CheckConfig) -> CheckResult {
        let spec = match CommandSpec::from_argv(&check.command) {
            Ok(spec) => spec
                .cwd(&self.project_root)
                .env("CI", "1")
                .timeout(Duration::from_secs(check.timeout_secs)),
            Err(e) => return Self::errored(check, String::new(), e),
        };

        match run_command(&spec).await {
            Ok(output) => {
                let combined = output.combined();
                let status = if output.success() {
                    CheckStatus::Passed
                } else if check.kind == CheckKind::Lint && classify_lint_output(&combined) {
                    CheckStatus::PassedWithWarnings
                } else {
                    CheckStatus::Failed
                };
                CheckResult {
                    kind: check.kind,
                    command: spec.display(),
                    status,
                    passed: status.is_pass(),
                    exit_code: Some(output.exit_code),
                    duration_ms: output.duration_ms,
                    output: truncate_output(&combined, OUTPUT_LIMIT),
                }
            }
            Err(ProcessError::Timeout { elapsed_ms, .. }) => CheckResult {
                kind: check.kind,
                command: spec.display(),
                status: CheckStatus::TimedOut,
                passed: false,
                exit_code: None,
                duration_ms: elapsed_ms,
                output: format!("timed out after {} s", check.timeout_secs),
            },
            Err(e) => Self::errored(check, spec.display(), e),
        }
    }

    fn errored(check: &CheckConfig, command: String, err: ProcessError) -> CheckResult {
        CheckResult {
            kind: check.kind,
            command,
            status: CheckStatus::Error,
            passed: false,
            exit_code: None,
            duration_ms: 0,
            output: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eslint_summary_decides_lint_outcome() {
        assert!(classify_lint_output(
            "src/a.ts\n  3:1  warning  Unexpected console statement\n\n✖ 1 problem (0 errors, 1 warning)"
        ));
        assert!(!classify_lint_output(
            "src/a.ts\n  3:1  error  'x' is not defined\n\n✖ 2 problems (1 error, 1 warning)"
        ));
    }

    #[test]
    fn word_heuristic_without_summary() {
        assert!(classify_lint_output("Warning: React version not specified"));
        assert!(!classify_lint_output("Error: Cannot find module 'eslint'"));
        assert!(!classify_lint_output("command failed"));
        // "errors" is not the word "error".
        assert!(classify_lint_output("0 errors\nwarning: unused import"));
    }

    #[test]
    fn check_config_uses_kebab_case_kinds() {
        let check: CheckConfig =
            serde_json::from_str(r#"{ "kind": "type-check", "command": ["tsc"] }"#).unwrap();
        assert_eq!(check.kind, CheckKind::TypeCheck);
        assert!(check.enabled);
        assert_eq!(check.timeout_secs, 300);
    }

    #[tokio::test]
    async fn no_enabled_checks_passes_vacuously() {
        let gate = ValidationGate::new(".");
        let report = gate.run(&[]).await;
        assert!(report.overall);
        assert!(report.results.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn lint_with_only_warnings_passes_overall() {
        let dir = tempfile::tempdir().unwrap();
        let gate = ValidationGate::new(dir.path());
        let checks = vec![
            CheckConfig {
                kind: CheckKind::TypeCheck,
                command: argv(&["true"]),
                timeout_secs: 10,
                enabled: true,
            },
            CheckConfig {
                kind: CheckKind::Lint,
                command: argv(&["sh", "-c", "echo '(0 errors, 3 warnings)'; exit 1"]),
                timeout_secs: 10,
                enabled: true,
            },
        ];

        let report = gate.run(&checks).await;
        assert!(report.overall);
        assert_eq!(report.results[1].status, CheckStatus::PassedWithWarnings);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_and_timed_out_checks_fail_overall() {
        let dir = tempfile::tempdir().unwrap();
        let gate = ValidationGate::new(dir.path());
        let checks = vec![
            CheckConfig {
                kind: CheckKind::TypeCheck,
                command: argv(&["sh", "-c", "echo 'TS2304: error' >&2; exit 2"]),
                timeout_secs: 10,
                enabled: true,
            },
            CheckConfig {
                kind: CheckKind::Build,
                command: argv(&["sleep", "5"]),
                timeout_secs: 0,
                enabled: true,
            },
            CheckConfig {
                kind: CheckKind::Tests,
                command: argv(&["false"]),
                timeout_secs: 10,
                enabled: false,
            },
        ];

        let report = gate.run(&checks).await;
        assert!(!report.overall);
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.results[0].status, CheckStatus::Failed);
        assert!(report.results[0].output.contains("TS2304"));
        assert_eq!(report.results[1].status, CheckStatus::TimedOut);
        assert_eq!(report.failures().count(), 2);
    }
}
