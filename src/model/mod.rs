// model/mod.rs
// Core data model shared by every pipeline phase

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;

/// Structural kind of a span
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    FunctionDefinition,
    ClassDefinition,
    MarkdownSection,
    /// A standalone logging statement
    LoggingCall,
    /// A module-level constant assignment
    ModuleConstant,
}

impl SpanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanKind::FunctionDefinition => "function_definition",
            SpanKind::ClassDefinition => "class_definition",
            SpanKind::MarkdownSection => "markdown_section",
            SpanKind::LoggingCall => "logging_call",
            SpanKind::ModuleConstant => "module_constant",
        }
    }
}

impl fmt::Display for SpanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable span metadata. Only the tagger writes to `tags`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SpanMetadata {
    /// Declared symbol name for code spans
    pub name: Option<String>,
    /// Heading text for documentation sections
    pub title: Option<String>,
    /// Heading breadcrumb, e.g. "Install > Linux"
    pub section_path: Option<String>,
    /// Ontology tags in assignment order
    pub tags: Vec<String>,
}

/// A contiguous excerpt of one source file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Span {
    /// Repository-relative path with forward slashes
    pub path: String,
    pub kind: SpanKind,
    pub content: String,
    /// 1-based, inclusive
    pub line_start: usize,
    /// 1-based, inclusive
    pub line_end: usize,
    pub metadata: SpanMetadata,
}

impl Span {
    pub fn new(
        path: impl Into<String>,
        kind: SpanKind,
        content: impl Into<String>,
        line_start: usize,
        line_end: usize,
    ) -> Self {
        debug_assert!(line_start <= line_end, "span lines out of order");
        Self {
            path: path.into(),
            kind,
            content: content.into(),
            line_start,
            line_end,
            metadata: SpanMetadata::default(),
        }
    }

    pub fn tags(&self) -> &[String] {
        &self.metadata.tags
    }

    /// Append a tag unless already present. Returns true if the tag was new.
    pub fn add_tag(&mut self, tag: &str) -> bool {
        if self.metadata.tags.iter().any(|t| t == tag) {
            return false;
        }
        self.metadata.tags.push(tag.to_string());
        true
    }

    /// Line range formatted as "start-end"
    pub fn line_range(&self) -> String {
        format!("{}-{}", self.line_start, self.line_end)
    }
}

/// All spans extracted from one file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParsedDocument {
    pub path: String,
    pub spans: Vec<Span>,
}

impl ParsedDocument {
    pub fn new(path: impl Into<String>, spans: Vec<Span>) -> Self {
        Self {
            path: path.into(),
            spans,
        }
    }

    /// Document for a file that could not be read or decoded
    pub fn empty(path: impl Into<String>) -> Self {
        Self::new(path, Vec::new())
    }
}

/// A group of semantically related spans. Borrows its members from the run's span collection.
#[derive(Debug, Clone)]
pub struct Cluster<'a> {
    pub id: String,
    pub spans: Vec<&'a Span>,
    pub ontology_tags: Vec<String>,
    pub centroid: Option<Vec<f32>>,
}

impl<'a> Cluster<'a> {
    pub fn is_singleton(&self) -> bool {
        self.id.starts_with(SINGLETON_PREFIX)
    }

    /// Sorted, de-duplicated member file paths
    pub fn source_files(&self) -> Vec<String> {
        self.spans
            .iter()
            .map(|s| s.path.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

pub const SINGLETON_PREFIX: &str = "singleton-";

/// A claim's provenance: file plus line range ("start-end")
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Evidence {
    pub path: String,
    pub lines: String,
}

/// One message of a synthesized conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationTurn {
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub evidence: Vec<Evidence>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Synthesis output for one cluster; one JSONL line in the dataset
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationRecord {
    pub conversation_id: String,
    pub source_files: Vec<String>,
    pub ontology_tags: Vec<String>,
    pub turns: Vec<ConversationTurn>,
    pub summary: Map<String, Value>,
    pub critique: Option<String>,
}

impl ConversationRecord {
    /// Serialize as a single JSONL line (no trailing newline)
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
