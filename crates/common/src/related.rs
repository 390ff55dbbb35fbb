//! Ranking of system processes that may belong to a task command.

use crate::command::{basename, is_unqualified_python, matches_tokens, resolve_argv};
use crate::process_utils::ProcessSnapshot;
use crate::RelatedProcess;
use path_clean::PathClean;
use std::cmp::Reverse;
use std::path::PathBuf;

pub const SCORE_EXACT: u8 = 3;
pub const SCORE_SUBSEQUENCE: u8 = 2;
pub const SCORE_BASENAME: u8 = 1;

/// Target command prepared once for scoring many candidates.
pub struct RelatedTarget {
    tokens: Vec<String>,
    exe: String,
    exe_name: String,
    has_path: bool,
}

impl RelatedTarget {
    /// `python_exec` replaces a bare `python` before path checks.
    pub fn new(command: &str, python_exec: Option<&str>) -> Option<Self> {
        let tokens = resolve_argv(command);
        let first = tokens.first()?;
        let exe = match python_exec {
            Some(exec) if is_unqualified_python(first) && !exec.is_empty() => exec.to_string(),
            _ => first.clone(),
        };
        let mut exe_lower = exe.to_ascii_lowercase();
        if cfg!(windows) && !exe_lower.ends_with(".exe") {
            exe_lower.push_str(".exe");
        }
        let has_path = exe.contains(['/', '\\']);
        Some(Self {
            exe_name: basename(&exe_lower).to_string(),
            exe: exe_lower,
            has_path,
            tokens,
        })
    }

    pub fn score(&self, candidate: &ProcessSnapshot) -> Option<u8> {
        if matches_tokens(&self.tokens, &candidate.cmdline) {
            let exact = candidate.cmdline.len() == self.tokens.len()
                && candidate
                    .cmdline
                    .iter()
                    .zip(&self.tokens)
                    .all(|(a, b)| a.trim() == b.trim());
            return Some(if exact { SCORE_EXACT } else { SCORE_SUBSEQUENCE });
        }

        if self.exe_name.is_empty() || !candidate.name.to_ascii_lowercase().contains(&self.exe_name) {
            return None;
        }
        if self.has_path && !self.path_consistent(candidate) {
            return None;
        }
        Some(SCORE_BASENAME)
    }

    /// A directory-qualified target only matches a process whose first
    /// argument or resolved executable points at the same file.
    fn path_consistent(&self, candidate: &ProcessSnapshot) -> bool {
        let target = normalized(&self.exe);

        if let Some(first) = candidate.cmdline.first() {
            let first = first.to_ascii_lowercase();
            if first.contains(['/', '\\']) {
                let first = normalized(&first);
                if first == target || first.ends_with(&target) || target.ends_with(&first) {
                    return true;
                }
            }
        }

        candidate
            .exe
            .as_deref()
            .map(|exe| normalized(&exe.to_ascii_lowercase()).ends_with(&target))
            .unwrap_or(false)
    }
}

fn normalized(path: &str) -> String {
    PathBuf::from(path).clean().to_string_lossy().into_owned()
}

/// Score every candidate and rank by score, then newest first.
pub fn rank_related(target: &RelatedTarget, candidates: &[ProcessSnapshot]) -> Vec<RelatedProcess> {
    let mut scored: Vec<(u8, &ProcessSnapshot)> = candidates
        .iter()
        .filter_map(|candidate| target.score(candidate).map(|score| (score, candidate)))
        .collect();
    scored.sort_by_key(|(score, candidate)| (Reverse(*score), Reverse(candidate.start_time)));

    scored
        .into_iter()
        .map(|(score, candidate)| RelatedProcess {
            pid: candidate.pid,
            name: candidate.name.clone(),
            exe: candidate.exe.clone().unwrap_or_default(),
            cmdline: candidate.cmdline.join(" "),
            cmd_args: candidate.cmdline.get(1..).map(|rest| rest.join(" ")).unwrap_or_default(),
            started_at: candidate.started_at(),
            memory_rss: candidate.memory_rss,
            score,
        })
        .collect()
}
