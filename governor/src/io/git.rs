//! Git adapter for the governor.
//!
//! Every repository query and mutation goes through this small, explicit
//! wrapper around `git` subprocess calls. No shell is involved.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// One `git diff --name-status` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameStatus {
    /// Single-letter status (`A`, `M`, `D`, `T`, ...).
    pub status: char,
    pub path: String,
}

/// One `git diff --numstat` entry. Binary files count as zero lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumStat {
    pub added: u64,
    pub deleted: u64,
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Full SHA of HEAD.
    pub fn head_sha(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--verify", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        out.lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_status_line)
            .collect()
    }

    /// Ensure the worktree is fully clean (including untracked files).
    #[instrument(skip_all)]
    pub fn ensure_clean(&self) -> Result<()> {
        let entries = self.status_porcelain()?;
        if entries.is_empty() {
            debug!("worktree is clean");
            return Ok(());
        }
        warn!(dirty_count = entries.len(), "worktree not clean");
        let mut msg = String::from("working tree not clean:\n");
        for entry in entries {
            msg.push_str(&format!("{} {}\n", entry.code, entry.path));
        }
        Err(anyhow!(msg.trim_end().to_string()))
    }

    /// Tracked changes relative to `base`, renames split into delete + add.
    pub fn diff_name_status(&self, base: &str) -> Result<Vec<NameStatus>> {
        let out = self.run_capture(&["diff", "--name-status", "--no-renames", "-z", base, "--"])?;
        parse_name_status_z(&out)
    }

    pub fn diff_numstat(&self, base: &str) -> Result<Vec<NumStat>> {
        let out = self.run_capture(&["diff", "--numstat", "--no-renames", "-z", base, "--"])?;
        parse_numstat_z(&out)
    }

    /// Untracked files that are not ignored.
    pub fn untracked_files(&self) -> Result<Vec<String>> {
        let out = self.run_capture(&["ls-files", "--others", "--exclude-standard", "-z"])?;
        Ok(split_z(&out).map(str::to_string).collect())
    }

    /// Reset index and tracked files to `commit`.
    #[instrument(skip_all, fields(commit))]
    pub fn reset_hard(&self, commit: &str) -> Result<()> {
        debug!(commit, "resetting worktree");
        self.run_checked(&["reset", "--hard", "--quiet", commit])?;
        Ok(())
    }

    /// Remove the given untracked paths. Ignored files are left alone.
    pub fn clean_paths(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["clean", "-f", "-q", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run_checked(&args)?;
        Ok(())
    }

    /// Apply a patch file to the worktree. The patch is checked first so a
    /// failing patch leaves nothing half-applied.
    #[instrument(skip_all, fields(patch = %patch.display()))]
    pub fn apply(&self, patch: &Path) -> Result<()> {
        let patch = patch
            .to_str()
            .with_context(|| format!("patch path is not UTF-8 {}", patch.display()))?;
        self.run_checked(&["apply", "--check", "--whitespace=nowarn", patch])?;
        self.run_checked(&["apply", "--whitespace=nowarn", patch])?;
        Ok(())
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Create and checkout a new branch at current HEAD.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_new_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "creating and checking out new branch");
        self.run_checked(&["checkout", "-q", "-b", branch])?;
        Ok(())
    }

    /// Checkout an existing branch.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "checking out branch");
        self.run_checked(&["checkout", "-q", branch])?;
        Ok(())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-q", "-m", message])?;
        Ok(true)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn split_z(out: &str) -> impl Iterator<Item = &str> {
    out.split('\0').filter(|field| !field.is_empty())
}

fn parse_name_status_z(out: &str) -> Result<Vec<NameStatus>> {
    let mut fields = split_z(out);
    let mut entries = Vec::new();
    while let Some(code) = fields.next() {
        let status = code
            .chars()
            .next()
            .ok_or_else(|| anyhow!("empty name-status code"))?;
        let path = fields
            .next()
            .ok_or_else(|| anyhow!("name-status entry {code} missing path"))?;
        entries.push(NameStatus {
            status,
            path: path.to_string(),
        });
    }
    Ok(entries)
}

fn parse_numstat_z(out: &str) -> Result<Vec<NumStat>> {
    split_z(out)
        .map(|record| {
            let mut parts = record.splitn(3, '\t');
            let (Some(added), Some(deleted), Some(path)) = (parts.next(), parts.next(), parts.next())
            else {
                return Err(anyhow!("unexpected numstat record: '{record}'"));
            };
            Ok(NumStat {
                added: added.parse().unwrap_or(0),
                deleted: deleted.parse().unwrap_or(0),
                path: path.to_string(),
            })
        })
        .collect()
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
