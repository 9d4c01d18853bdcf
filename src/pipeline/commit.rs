//! Commit gate
//!
//! Stages and commits only files matched by the allow-list. Anything else the
//! working tree holds is left alone.

use crate::config::CommitConfig;
use crate::error::AppError;
use crate::pipeline::validation::ValidationReport;
use crate::process::{run_command, truncate_output, CommandOutput, CommandSpec};
use crate::snapshot::ChangeSet;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

const GIT_TIMEOUT: Duration = Duration::from_secs(60);

/// A commit made by the gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRecord {
    pub hash: String,
    pub message: String,
    pub files: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

// ==================== Allow-list ====================

/// Project-relative glob patterns (`*`, `**`, `?`) that may be committed
#[derive(Debug, Clone)]
pub struct AllowList {
    patterns: Vec<Regex>,
}

impl AllowList {
    pub fn new<I, S>(patterns: I) -> Result<Self, AppError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| {
                let p = p.as_ref().trim_start_matches("./").to_string();
                Regex::new(&glob_to_regex(&p))
                    .map_err(|e| AppError::Commit(format!("invalid allow-list pattern {}: {}", p, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_allowed(&self, path: &str) -> bool {
        let path = path.trim_start_matches("./");
        self.patterns.iter().any(|re| re.is_match(path))
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut re = String::from("^");
    let chars: Vec<char> = glob.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    re.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    re.push_str(".*");
                    i += 2;
                }
                continue;
            }
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    re.push('$');
    re
}

/// Paths reported by `git status --porcelain -z`.
pub fn parse_porcelain(output: &str) -> Vec<String> {
    let mut files = Vec::new();
    let mut entries = output.split('\0').filter(|e| !e.is_empty());
    while let Some(entry) = entries.next() {
        if entry.len() < 4 {
            continue;
        }
        let (status, path) = entry.split_at(3);
        files.push(path.to_string());
        // Renames and copies carry the original path as the next entry.
        if status.contains('R') || status.contains('C') {
            entries.next();
        }
    }
    files
}

/// Structured commit message from the change and the validation outcome.
pub fn compose_message(prefix: &str, change: &ChangeSet, report: &ValidationReport) -> String {
    let mut subject = format!(
        "{}: sync schema ({} new tables, {} new columns, {} new indexes)",
        prefix,
        change.new_tables.len(),
        change.new_column_count(),
        change.new_indexes.len()
    );
    if change.new_tables.is_empty() && change.new_columns.is_empty() && change.new_indexes.is_empty()
    {
        subject = format!("{}: sync schema", prefix);
    }

    let mut body = vec![
        subject,
        String::new(),
        change.summary.clone(),
        String::new(),
        format!("Confidence: {:?}", change.confidence).to_lowercase(),
        format!(
            "Fingerprint: {} -> {}",
            short(&change.from_fingerprint),
            short(&change.to_fingerprint)
        ),
        String::new(),
        "Validation:".to_string(),
    ];
    let lines = report.summary_lines();
    if lines.is_empty() {
        body.push("- no checks enabled".to_string());
    } else {
        body.extend(lines.into_iter().map(|l| format!("- {}", l)));
    }
    body.join("\n")
}

fn short(fingerprint: &str) -> &str {
    &fingerprint[..fingerprint.len().min(12)]
}

// ==================== Gate ====================

pub struct CommitGate {
    project_root: PathBuf,
    settings: CommitConfig,
}

impl CommitGate {
    pub fn new(project_root: impl Into<PathBuf>, settings: CommitConfig) -> Self {
        Self {
            project_root: project_root.into(),
            settings,
        }
    }

    pub fn allow_list(&self) -> Result<AllowList, AppError> {
        AllowList::new(&self.settings.allow_list)
    }

    fn git<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new("git")
            .args(args)
            .cwd(&self.project_root)
            .timeout(GIT_TIMEOUT)
    }

    async fn run_git(&self, spec: CommandSpec) -> Result<CommandOutput, AppError> {
        let output = run_command(&spec)
            .await
            .map_err(|e| AppError::Commit(e.to_string()))?;
        if !output.success() {
            return Err(AppError::Commit(format!(
                "`{}` exited with {}: {}",
                spec.display(),
                output.exit_code,
                truncate_output(output.combined().trim(), 500)
            )));
        }
        Ok(output)
    }

    /// Changed or untracked files that the allow-list admits.
    pub async fn candidate_files(&self) -> Result<Vec<String>, AppError> {
        let allow = self.allow_list()?;
        let status = self
            .run_git(self.git(["status", "--porcelain", "-z", "--untracked-files=all"]))
            .await?;
        let all = parse_porcelain(&status.stdout);
        let (allowed, skipped): (Vec<String>, Vec<String>) =
            all.into_iter().partition(|f| allow.is_allowed(f));
        if !skipped.is_empty() {
            debug!("Leaving {} non allow-listed paths unstaged", skipped.len());
        }
        Ok(allowed)
    }

    /// Stage and commit allow-listed changes. `Ok(None)` when there is
    /// nothing to commit.
    pub async fn commit(&self, message: &str) -> Result<Option<CommitRecord>, AppError> {
        let files = self.candidate_files().await?;
        if files.is_empty() {
            info!("No allow-listed changes to commit");
            return Ok(None);
        }

        let mut add = vec!["add".to_string(), "-A".to_string(), "--".to_string()];
        add.extend(files.iter().cloned());
        self.run_git(self.git(add)).await?;

        let mut commit = vec![
            "-c".to_string(),
            format!("user.name={}", self.settings.author_name),
            "-c".to_string(),
            format!("user.email={}", self.settings.author_email),
            "commit".to_string(),
            "--no-verify".to_string(),
            "-m".to_string(),
            message.to_string(),
            "--".to_string(),
        ];
        commit.extend(files.iter().cloned());
        self.run_git(self.git(commit)).await?;

        let head = self.run_git(self.git(["rev-parse", "HEAD"])).await?;
        let record = CommitRecord {
            hash: head.stdout.trim().to_string(),
            message: message.to_string(),
            files,
            timestamp: Utc::now(),
        };
        info!(
            "✅ Committed {} file(s) as {}",
            record.files.len(),
            short(&record.hash)
        );
        Ok(Some(record))
    }
}
