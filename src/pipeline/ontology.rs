// ontology.rs
// Phase 2: Keyword-driven ontology tagging of spans

use crate::error::PipelineError;
use crate::model::{Span, SpanKind};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::debug;

/// Assigns domain tags to spans from a keyword → tag mapping
#[derive(Debug, Clone)]
pub struct OntologyTagger {
    /// tag -> lowercase keywords
    keyword_map: BTreeMap<String, Vec<String>>,
}

impl Default for OntologyTagger {
    fn default() -> Self {
        let mapping: [(&str, &[&str]); 6] = [
            ("factor", &["factor", "alpha", "exposure", "top20"]),
            ("regime", &["regime", "volatility", "dispersion", "momentum"]),
            ("optimizer", &["optimization", "target", "constraint", "solver"]),
            ("logging", &["logging.", "info(", "warning(", "error("]),
            ("validation", &["raise ", "ValueError", "assert "]),
            ("report", &["heatmap", "quilt", "chart", "report"]),
        ];

        Self::new(mapping.iter().map(|(tag, keywords)| {
            (
                tag.to_string(),
                keywords.iter().map(|k| k.to_string()).collect(),
            )
        }))
    }
}

impl OntologyTagger {
    pub fn new(mapping: impl IntoIterator<Item = (String, Vec<String>)>) -> Self {
        let keyword_map = mapping
            .into_iter()
            .map(|(tag, keywords)| {
                let keywords = keywords.into_iter().map(|k| k.to_lowercase()).collect();
                (tag, keywords)
            })
            .collect();
        Self { keyword_map }
    }

    /// Load a `{"tag": ["keyword", ...]}` mapping
    pub fn from_json_file(path: &Path) -> Result<Self, PipelineError> {
        let err = |reason: String| PipelineError::Ontology {
            path: path.to_path_buf(),
            reason,
        };
        let json = std::fs::read_to_string(path).map_err(|e| err(e.to_string()))?;
        let mapping: BTreeMap<String, Vec<String>> =
            serde_json::from_str(&json).map_err(|e| err(e.to_string()))?;
        Ok(Self::new(mapping))
    }

    /// Tags that apply to a span, sorted
    pub fn resolve(&self, span: &Span) -> Vec<String> {
        let content = span.content.to_lowercase();
        let mut tags: BTreeSet<&str> = self
            .keyword_map
            .iter()
            .filter(|(_, keywords)| keywords.iter().any(|k| content.contains(k.as_str())))
            .map(|(tag, _)| tag.as_str())
            .collect();

        match span.kind {
            SpanKind::LoggingCall => {
                tags.insert("logging");
            }
            SpanKind::ModuleConstant => {
                tags.insert("config");
            }
            _ => {}
        }

        tags.into_iter().map(str::to_string).collect()
    }

    /// Append resolved tags to each span's metadata. Idempotent: tags already
    /// present are neither duplicated nor moved. Returns the tags resolved
    /// for each span in this pass.
    pub fn tag(&self, spans: &mut [Span]) -> Vec<Vec<String>> {
        let mut added = 0;
        let resolved: Vec<Vec<String>> = spans
            .iter_mut()
            .map(|span| {
                let tags = self.resolve(span);
                for tag in &tags {
                    if span.add_tag(tag) {
                        added += 1;
                    }
                }
                tags
            })
            .collect();

        debug!(spans = spans.len(), new_tags = added, "tagged spans");
        resolved
    }
}
