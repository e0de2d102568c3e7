//! Ignore-file patterns for COPY and ADD.
//!
//! The ignore file (`.rockerignore` in the context directory) lists one
//! pattern per line. `*` and `?` match within a path segment, `**` matches
//! across segments, and a leading `!` re-includes paths excluded by an
//! earlier pattern. A pattern that matches a directory excludes everything
//! under it.

use anyhow::{Context, Result};
use std::path::Path;

pub(crate) const IGNORE_FILE: &str = ".rockerignore";

#[derive(Debug, Default, Clone)]
pub(crate) struct IgnorePatterns {
    patterns: Vec<(bool, String)>,
}

impl IgnorePatterns {
    /// Load the ignore file from the context directory, if present.
    pub(crate) fn load(context_dir: &Path) -> Result<Self> {
        let path = context_dir.join(IGNORE_FILE);
        if !path.is_file() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read '{}'", path.display()))?;
        Ok(Self::parse(&content))
    }

    pub(crate) fn parse(content: &str) -> Self {
        let patterns = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| match line.strip_prefix('!') {
                Some(rest) => (true, rest.trim_start_matches('/').to_string()),
                None => (false, line.trim_start_matches('/').to_string()),
            })
            .collect();
        Self { patterns }
    }

    /// Whether a context-relative path is excluded. The last matching
    /// pattern wins, so exceptions can follow the patterns they carve out.
    pub(crate) fn excluded(&self, rel: &str) -> bool {
        let mut excluded = false;
        for (negated, pattern) in &self.patterns {
            if matches_pattern(pattern, rel) {
                excluded = !negated;
            }
        }
        excluded
    }
}

/// Match a slash-separated glob against a context-relative path. Matching a
/// parent directory matches everything below it.
pub(crate) fn matches_pattern(pattern: &str, path: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let path: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match_segments(&pattern, &path)
}

fn match_segments(pattern: &[&str], path: &[&str]) -> bool {
    match (pattern.first(), path.first()) {
        (None, _) => true,
        (Some(&"**"), _) => {
            match_segments(&pattern[1..], path)
                || (!path.is_empty() && match_segments(pattern, &path[1..]))
        }
        (Some(seg), Some(name)) => {
            match_glob(seg.as_bytes(), name.as_bytes())
                && match_segments(&pattern[1..], &path[1..])
        }
        (Some(_), None) => false,
    }
}

fn match_glob(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (None, Some(_)) => false,
        (Some(b'*'), _) => {
            match_glob(&pattern[1..], text) || (!text.is_empty() && match_glob(pattern, &text[1..]))
        }
        (Some(b'?'), Some(_)) => match_glob(&pattern[1..], &text[1..]),
        (Some(p), Some(t)) => p == t && match_glob(&pattern[1..], &text[1..]),
        (Some(_), None) => false,
    }
}
