//! Ingested requirements documents

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::OnceLock;
use vts_audit::Checksum;

/// Opaque document identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Properties derived from content at ingestion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub byte_len: usize,
    pub line_count: usize,
    /// Markdown-style headings (`#` through `######`)
    pub section_count: usize,
    /// Identifiers such as `URS-12` found anywhere in the text
    pub requirement_ids: BTreeSet<String>,
    pub content_checksum: Checksum,
}

/// Immutable requirements document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    content: String,
    metadata: DocumentMetadata,
}

impl Document {
    /// Ingest content, deriving metadata once
    #[must_use]
    pub fn new(id: impl Into<DocumentId>, content: impl Into<String>) -> Self {
        let content = content.into();
        let metadata = derive_metadata(&content);
        Self {
            id: id.into(),
            content,
            metadata,
        }
    }

    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    #[must_use]
    pub fn metadata(&self) -> &DocumentMetadata {
        &self.metadata
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty()
    }
}

impl From<String> for DocumentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

fn requirement_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\b[A-Z]{2,}-\d+\b").unwrap_or_else(|e| unreachable!("static pattern: {e}"))
    })
}

fn is_heading(line: &str) -> bool {
    let trimmed = line.trim_start();
    let hashes = trimmed.chars().take_while(|c| *c == '#').count();
    (1..=6).contains(&hashes) && trimmed[hashes..].starts_with(' ')
}

fn derive_metadata(content: &str) -> DocumentMetadata {
    DocumentMetadata {
        byte_len: content.len(),
        line_count: content.lines().count(),
        section_count: content.lines().filter(|l| is_heading(l)).count(),
        requirement_ids: requirement_pattern()
            .find_iter(content)
            .map(|m| m.as_str().to_string())
            .collect(),
        content_checksum: Checksum::compute(content.as_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "# Purpose\nThe system shall log in users (URS-001).\n\n## Audit\nURS-002 and SEC-14 apply. urs-3 does not.\n#not a heading\n";

    #[test]
    fn metadata_is_derived() {
        let doc = Document::new("doc-1", SAMPLE);
        let meta = doc.metadata();
        assert_eq!(meta.byte_len, SAMPLE.len());
        assert_eq!(meta.line_count, 6);
        assert_eq!(meta.section_count, 2);
        let ids: Vec<_> = meta.requirement_ids.iter().map(String::as_str).collect();
        assert_eq!(ids, vec!["SEC-14", "URS-001", "URS-002"]);
    }

    #[test]
    fn checksum_tracks_content() {
        let a = Document::new("a", "URS-1");
        let b = Document::new("b", "URS-1");
        let c = Document::new("a", "URS-2");
        assert_eq!(a.metadata().content_checksum, b.metadata().content_checksum);
        assert_ne!(a.metadata().content_checksum, c.metadata().content_checksum);
    }

    #[test]
    fn whitespace_only_is_empty() {
        assert!(Document::new("blank", " \n\t").is_empty());
        assert!(!Document::new("x", "text").is_empty());
    }
}
