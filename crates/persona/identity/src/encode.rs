//! Derived encodings of an [`Id`].

use crate::escape::escape_with;
use crate::Id;
use std::path::PathBuf;

/// Total length budget of [`Id::to_safe_name`].
///
/// Fits PostgreSQL identifiers (63), Docker service/volume names and
/// environment variable names with room to spare for prefixes.
pub const SAFE_NAME_BUDGET: usize = 48;

/// Number of hex characters of the content hash kept in a safe name.
pub const SAFE_NAME_HASH_LEN: usize = 8;

const SAFE_NAME_LEAD: char = 'i';

impl Id {
    /// Relative filesystem path: one directory level per segment.
    pub fn to_file_path(&self) -> PathBuf {
        self.parts()
            .iter()
            .map(|part| file_segment(part, false))
            .collect()
    }

    /// Flat filename: segments joined by `.`, periods inside segments escaped.
    pub fn to_filename(&self) -> String {
        self.parts()
            .iter()
            .map(|part| file_segment(part, true))
            .collect::<Vec<_>>()
            .join(".")
    }

    /// URI path: percent-encoded segments joined by `/`.
    pub fn to_uri_path(&self) -> String {
        self.parts()
            .iter()
            .map(|part| urlencoding::encode(part).into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Bounded `[a-z0-9_]` name for env vars, service names and SQL tables.
    ///
    /// Layout: `i` + hash prefix, then as many trailing segments as fit.
    pub fn to_safe_name(&self) -> String {
        let hash = blake3::hash(self.value().as_bytes());
        let hex = hash.to_hex();

        let mut name = String::with_capacity(SAFE_NAME_BUDGET);
        name.push(SAFE_NAME_LEAD);
        name.push_str(&hex.as_str()[..SAFE_NAME_HASH_LEN]);

        let mut budget = SAFE_NAME_BUDGET - name.len();
        let mut suffix = Vec::new();
        for part in self.parts().iter().rev() {
            // one joiner plus at least one character
            if budget < 2 {
                break;
            }
            let clean = sanitize(part);
            let room = budget - 1;
            if clean.len() <= room {
                budget -= clean.len() + 1;
                suffix.push(clean);
            } else {
                suffix.push(clean[..room].to_string());
                break;
            }
        }

        for segment in suffix.iter().rev() {
            name.push('_');
            name.push_str(segment);
        }
        name
    }
}

fn file_segment(segment: &str, escape_period: bool) -> String {
    match segment {
        "" => "[]".to_string(),
        "." | ".." => escape_with(segment, |_| true),
        _ => escape_with(segment, |c| {
            is_file_unsafe(c) || (escape_period && c == '.')
        }),
    }
}

fn is_file_unsafe(c: char) -> bool {
    matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') || c.is_control()
}

fn sanitize(segment: &str) -> String {
    segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}
