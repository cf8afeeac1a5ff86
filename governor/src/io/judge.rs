//! Git-backed judge queries, run after the builder.

use std::fs;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::core::blast::{BlastRadius, TouchedFiles};
use crate::io::git::Git;

/// Outcome of the HEAD-moved check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeadCheck {
    pub ok: bool,
    pub reason: Option<String>,
}

/// Paths changed since `base_commit`, tracked and untracked.
#[instrument(skip_all, fields(base_commit))]
pub fn get_touched_files(git: &Git, base_commit: &str) -> Result<TouchedFiles> {
    let name_status = git.diff_name_status(base_commit)?;
    let added = name_status
        .iter()
        .filter(|entry| entry.status == 'A')
        .map(|entry| entry.path.clone())
        .collect();
    let tracked = name_status.into_iter().map(|entry| entry.path).collect();
    let untracked = git.untracked_files()?;
    let touched = TouchedFiles::new(tracked, untracked, added);
    debug!(
        tracked = touched.tracked.len(),
        untracked = touched.untracked.len(),
        "touched files"
    );
    Ok(touched)
}

/// Size of the change. Untracked files count every line as added.
#[instrument(skip_all, fields(base_commit))]
pub fn compute_blast_radius(
    git: &Git,
    base_commit: &str,
    touched: &TouchedFiles,
) -> Result<BlastRadius> {
    let mut blast = BlastRadius {
        files_touched: to_u32(touched.all.len()),
        new_files: to_u32(touched.new_files.len()),
        ..BlastRadius::default()
    };
    for stat in git.diff_numstat(base_commit)? {
        blast.lines_added += stat.added;
        blast.lines_deleted += stat.deleted;
    }
    for path in &touched.untracked {
        blast.lines_added += count_lines(git, path);
    }
    Ok(blast)
}

/// HEAD must still be `expected`; otherwise the diff baseline is meaningless.
pub fn check_head_moved(git: &Git, expected: &str) -> Result<HeadCheck> {
    let head = git.head_sha()?;
    if head == expected {
        return Ok(HeadCheck {
            ok: true,
            reason: None,
        });
    }
    warn!(expected, actual = %head, "HEAD moved during tick");
    Ok(HeadCheck {
        ok: false,
        reason: Some(format!("HEAD moved from {expected} to {head} during the tick")),
    })
}

fn count_lines(git: &Git, path: &str) -> u64 {
    match fs::read(git.workdir().join(path)) {
        Ok(bytes) if bytes.contains(&0) => 0,
        Ok(bytes) => {
            let newlines = bytes.iter().filter(|b| **b == b'\n').count() as u64;
            let unterminated = u64::from(bytes.last().is_some_and(|b| *b != b'\n'));
            newlines + unterminated
        }
        Err(err) => {
            debug!(path, err = %err, "unreadable untracked file counts as zero lines");
            0
        }
    }
}

fn to_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}
