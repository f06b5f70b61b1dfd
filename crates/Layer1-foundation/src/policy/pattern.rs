//! Compiled rule patterns
//!
//! Raw strings from `SecurityPolicy` are compiled once, when a policy is
//! loaded or reloaded. A pattern that fails to compile rejects the whole
//! policy.

use super::command::{normalize_path, CommandSegment};
use crate::{Error, Result};
use regex::Regex;

const REGEX_PREFIX: &str = "regex:";

// ============================================================
// 차단 패턴 (blocklist)
// ============================================================

/// A blocklist entry
#[derive(Debug, Clone)]
pub enum BlockPattern {
    /// Case-insensitive substring of the full command
    Contains { raw: String, lowered: String },
    /// Regular expression over the full command
    Regex { raw: String, regex: Regex },
}

impl BlockPattern {
    pub fn compile(raw: &str) -> Result<Self> {
        if let Some(expr) = raw.strip_prefix(REGEX_PREFIX) {
            let regex = Regex::new(expr).map_err(|e| {
                Error::Config(format!("Invalid blocklist regex '{}': {}", expr, e))
            })?;
            return Ok(Self::Regex {
                raw: raw.to_string(),
                regex,
            });
        }

        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::Config("Empty blocklist pattern".to_string()));
        }

        Ok(Self::Contains {
            raw: raw.to_string(),
            lowered: trimmed.to_lowercase(),
        })
    }

    /// Substring hit anywhere in the command, or an exact match against
    /// any segment's base command.
    pub fn matches(&self, command: &str, segments: &[CommandSegment]) -> bool {
        match self {
            Self::Contains { lowered, .. } => {
                command.to_lowercase().contains(lowered.as_str())
                    || segments
                        .iter()
                        .any(|s| s.base.eq_ignore_ascii_case(lowered))
            }
            Self::Regex { regex, .. } => regex.is_match(command),
        }
    }

    pub fn source(&self) -> &str {
        match self {
            Self::Contains { raw, .. } | Self::Regex { raw, .. } => raw,
        }
    }
}

// ============================================================
// 허용 패턴 (allowlist)
// ============================================================

/// An allowlist entry, matched per command segment
#[derive(Debug, Clone)]
pub enum AllowPattern {
    /// `cargo` matches base `cargo`; `cargo build` matches segments whose
    /// leading words are `cargo build`
    Words(Vec<String>),
    Regex { raw: String, regex: Regex },
}

impl AllowPattern {
    pub fn compile(raw: &str) -> Result<Self> {
        if let Some(expr) = raw.strip_prefix(REGEX_PREFIX) {
            let regex = Regex::new(expr).map_err(|e| {
                Error::Config(format!("Invalid allowlist regex '{}': {}", expr, e))
            })?;
            return Ok(Self::Regex {
                raw: raw.to_string(),
                regex,
            });
        }

        let words: Vec<String> = raw.split_whitespace().map(str::to_string).collect();
        if words.is_empty() {
            return Err(Error::Config("Empty allowlist pattern".to_string()));
        }
        Ok(Self::Words(words))
    }

    pub fn matches(&self, segment: &CommandSegment) -> bool {
        match self {
            Self::Words(words) => {
                words[0] == segment.base
                    && segment.args.len() >= words.len() - 1
                    && words[1..].iter().zip(&segment.args).all(|(w, a)| w == a)
            }
            Self::Regex { regex, .. } => regex.is_match(&segment.text),
        }
    }
}

// ============================================================
// 경로 패턴
// ============================================================

/// A path whitelist/blacklist entry
#[derive(Debug, Clone)]
pub enum PathPattern {
    /// Shell-style glob over the normalized absolute path
    Glob { raw: String, pattern: glob::Pattern },
    /// Absolute directory or file, matching itself and everything below
    Prefix(String),
    /// Bare name such as `.ssh`, matching any path containing that component
    Component(String),
}

impl PathPattern {
    pub fn compile(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::Config("Empty path pattern".to_string()));
        }

        if trimmed.contains(&['*', '?', '['][..]) {
            let pattern = glob::Pattern::new(trimmed).map_err(|e| {
                Error::Config(format!("Invalid path glob '{}': {}", trimmed, e))
            })?;
            return Ok(Self::Glob {
                raw: trimmed.to_string(),
                pattern,
            });
        }

        if trimmed.starts_with('/') {
            let normalized = normalize_path(trimmed, "/");
            return Ok(Self::Prefix(normalized));
        }

        Ok(Self::Component(trimmed.trim_end_matches('/').to_string()))
    }

    /// `path` must already be normalized and absolute
    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::Glob { pattern, .. } => pattern.matches(path),
            Self::Prefix(prefix) => {
                prefix == "/"
                    || path == prefix
                    || path
                        .strip_prefix(prefix.as_str())
                        .map(|rest| rest.starts_with('/'))
                        .unwrap_or(false)
            }
            Self::Component(name) => {
                if name.contains('/') {
                    path.contains(&format!("/{}", name))
                } else {
                    path.split('/').any(|part| part == name)
                }
            }
        }
    }

    pub fn source(&self) -> &str {
        match self {
            Self::Glob { raw, .. } => raw,
            Self::Prefix(p) | Self::Component(p) => p,
        }
    }
}
