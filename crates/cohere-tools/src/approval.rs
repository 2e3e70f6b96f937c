//! Interactive review of proposed file changes.
//!
//! A mutation that rewrites file content is described as a `ChangeProposal`
//! and handed to a `ChangeApprover` before anything touches disk. Rejection
//! is an ordinary outcome, not an error.

use anyhow::Result;
use std::io::Write;
use std::ops::Range;
use tempfile::NamedTempFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

/// A proposed full-content change to one workspace file. `old` is `None` for
/// a new file.
#[derive(Debug, Clone)]
pub struct ChangeProposal {
    pub path: String,
    pub old: Option<String>,
    pub new: String,
}

impl ChangeProposal {
    pub fn new(path: impl Into<String>, old: Option<&str>, new: &str) -> Self {
        Self {
            path: path.into(),
            old: old.map(ToString::to_string),
            new: new.to_string(),
        }
    }

    /// Build a proposal for a range-scoped edit by reconstructing the full
    /// proposed content. `range` is a byte range into `current`.
    pub fn splice(
        path: impl Into<String>,
        current: &str,
        range: Range<usize>,
        replacement: &str,
    ) -> Self {
        let mut new = String::with_capacity(current.len() + replacement.len());
        new.push_str(&current[..range.start]);
        new.push_str(replacement);
        new.push_str(&current[range.end..]);
        Self {
            path: path.into(),
            old: Some(current.to_string()),
            new,
        }
    }

    /// Render a unified-style line diff of the proposal. Unchanged leading and
    /// trailing lines collapse to at most `context` lines on each side.
    pub fn render_diff(&self) -> String {
        const CONTEXT: usize = 3;
        let old_lines: Vec<&str> = self.old.as_deref().unwrap_or("").lines().collect();
        let new_lines: Vec<&str> = self.new.lines().collect();

        if self.old.is_none() {
            let mut out = format!("--- /dev/null\n+++ {}\n", self.path);
            for line in &new_lines {
                out.push('+');
                out.push_str(line);
                out.push('\n');
            }
            return out;
        }

        let prefix = old_lines
            .iter()
            .zip(new_lines.iter())
            .take_while(|(a, b)| a == b)
            .count();
        let suffix = old_lines[prefix..]
            .iter()
            .rev()
            .zip(new_lines[prefix..].iter().rev())
            .take_while(|(a, b)| a == b)
            .count();

        let mut out = format!("--- {path}\n+++ {path}\n", path = self.path);
        let context_start = prefix.saturating_sub(CONTEXT);
        for line in &old_lines[context_start..prefix] {
            out.push(' ');
            out.push_str(line);
            out.push('\n');
        }
        for line in &old_lines[prefix..old_lines.len() - suffix] {
            out.push('-');
            out.push_str(line);
            out.push('\n');
        }
        for line in &new_lines[prefix..new_lines.len() - suffix] {
            out.push('+');
            out.push_str(line);
            out.push('\n');
        }
        let context_end = (old_lines.len() - suffix + CONTEXT).min(old_lines.len());
        for line in &old_lines[old_lines.len() - suffix..context_end] {
            out.push(' ');
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    /// Materialize old/new content as temp files for an external viewer. The
    /// returned guard removes both files when dropped, on every exit path.
    pub fn preview_files(&self) -> Result<PreviewFiles> {
        let old = match &self.old {
            Some(content) => {
                let mut file = NamedTempFile::new()?;
                file.write_all(content.as_bytes())?;
                Some(file)
            }
            None => None,
        };
        let mut new = NamedTempFile::new()?;
        new.write_all(self.new.as_bytes())?;
        Ok(PreviewFiles { old, new })
    }
}

/// Temp-file pair backing a diff preview. Files live only as long as the guard.
pub struct PreviewFiles {
    old: Option<NamedTempFile>,
    new: NamedTempFile,
}

impl PreviewFiles {
    pub fn old_path(&self) -> Option<&std::path::Path> {
        self.old.as_ref().map(|f| f.path())
    }

    pub fn new_path(&self) -> &std::path::Path {
        self.new.path()
    }
}

pub trait ChangeApprover {
    fn review(&self, proposal: &ChangeProposal) -> Result<ApprovalDecision>;
}

/// Approves every proposal. Used by non-interactive runs.
pub struct AutoApprover;

impl ChangeApprover for AutoApprover {
    fn review(&self, _proposal: &ChangeProposal) -> Result<ApprovalDecision> {
        Ok(ApprovalDecision::Approved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_file_diff_shows_all_lines_as_added() {
        let proposal = ChangeProposal::new("notes.txt", None, "first\nsecond\n");
        let diff = proposal.render_diff();
        assert!(diff.starts_with("--- /dev/null\n+++ notes.txt\n"));
        assert!(diff.contains("+first\n"));
        assert!(diff.contains("+second\n"));
        assert!(
            !diff
                .lines()
                .any(|l| l.starts_with('-') && !l.starts_with("---"))
        );
    }

    #[test]
    fn edit_diff_collapses_unchanged_lines_to_context() {
        let old: String = (1..=20).map(|i| format!("line {i}\n")).collect();
        let new = old.replace("line 10", "line ten");
        let proposal = ChangeProposal::new("big.txt", Some(&old), &new);
        let diff = proposal.render_diff();
        assert!(diff.contains("-line 10\n"));
        assert!(diff.contains("+line ten\n"));
        assert!(diff.contains(" line 9\n"));
        assert!(diff.contains(" line 11\n"));
        // Far-away lines are not part of the hunk.
        assert!(!diff.contains("line 2\n"));
        assert!(!diff.contains("line 17\n"));
    }

    #[test]
    fn splice_reconstructs_full_proposed_content() {
        let current = "fn old_name() {}\n";
        let start = current.find("old_name").expect("target");
        let proposal =
            ChangeProposal::splice("src/main.rs", current, start..start + "old_name".len(), "new_name");
        assert_eq!(proposal.new, "fn new_name() {}\n");
        assert_eq!(proposal.old.as_deref(), Some(current));
    }

    #[test]
    fn preview_files_are_removed_when_guard_drops() {
        let proposal = ChangeProposal::new("a.txt", Some("before"), "after");
        let (old_path, new_path) = {
            let preview = proposal.preview_files().expect("preview");
            let old_path = preview.old_path().expect("old").to_path_buf();
            let new_path = preview.new_path().to_path_buf();
            assert_eq!(std::fs::read_to_string(&old_path).expect("old"), "before");
            assert_eq!(std::fs::read_to_string(&new_path).expect("new"), "after");
            (old_path, new_path)
        };
        assert!(!old_path.exists());
        assert!(!new_path.exists());
    }
}
