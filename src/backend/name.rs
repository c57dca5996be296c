//! Server-name normalization and wildcard route patterns.
//!
//! Server names arrive from TLS SNI and from route configuration. Matching
//! and cache keying are case-insensitive, so every name is normalized once
//! at the edges: lowercased, trailing dot trimmed.

use thiserror::Error;

/// Normalize a server name for matching and cache keying.
pub fn normalize(name: &str) -> String {
    name.to_lowercase().trim_end_matches('.').to_string()
}

/// Error produced when a route pattern fails validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("empty pattern")]
    Empty,
    #[error("invalid label '{0}' in pattern")]
    InvalidLabel(String),
    #[error("wildcard label must be the first or last label")]
    WildcardPosition,
    #[error("pattern may contain at most one wildcard label")]
    MultipleWildcards,
}

/// A route pattern: an exact DNS name, or a name with a single wildcard
/// label at either end (`foo.*`, `*.example.com`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    /// Matches the name exactly.
    Exact(String),
    /// `foo.*`, stored as the literal head including the trailing dot.
    Prefix(String),
    /// `*.example.com`, stored as the literal tail including the leading dot.
    Suffix(String),
}

impl Pattern {
    /// Parse and validate a pattern. The input is normalized first.
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        let pattern = normalize(pattern);
        if pattern.is_empty() {
            return Err(PatternError::Empty);
        }

        let labels: Vec<&str> = pattern.split('.').collect();
        let wildcards = labels.iter().filter(|l| **l == "*").count();
        if wildcards > 1 {
            return Err(PatternError::MultipleWildcards);
        }

        for (i, label) in labels.iter().enumerate() {
            if *label == "*" {
                if i != 0 && i != labels.len() - 1 {
                    return Err(PatternError::WildcardPosition);
                }
                continue;
            }
            if label.is_empty()
                || !label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
            {
                return Err(PatternError::InvalidLabel(label.to_string()));
            }
        }

        if labels.last() == Some(&"*") {
            let head = &pattern[..pattern.len() - 1];
            Ok(Pattern::Prefix(head.to_string()))
        } else if labels.first() == Some(&"*") {
            let tail = &pattern[1..];
            Ok(Pattern::Suffix(tail.to_string()))
        } else {
            Ok(Pattern::Exact(pattern))
        }
    }

    /// Whether a normalized server name matches this pattern.
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Pattern::Exact(expected) => name == expected,
            Pattern::Prefix(head) => name.strip_prefix(head.as_str()).is_some_and(is_label_run),
            Pattern::Suffix(tail) => {
                if tail.is_empty() || tail == "." {
                    // Bare `*` matches any non-empty name.
                    return is_label_run(name);
                }
                name.strip_suffix(tail.as_str()).is_some_and(is_label_run)
            }
        }
    }

    /// Match specificity: exact patterns beat any wildcard, and among
    /// wildcards a longer literal part wins.
    pub fn specificity(&self) -> usize {
        match self {
            Pattern::Exact(_) => usize::MAX,
            Pattern::Prefix(head) => head.len(),
            Pattern::Suffix(tail) => tail.len(),
        }
    }
}

/// Whether the wildcard-covered portion of a name is one or more valid labels.
fn is_label_run(part: &str) -> bool {
    !part.is_empty()
        && part.split('.').all(|label| {
            !label.is_empty() && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
        })
}
