// Pipeline Phase 5: Conversation synthesis
// One generation call plus one critique call per cluster, folded into a report

use crate::error::SynthesisError;
use crate::model::{Cluster, ConversationRecord, ConversationTurn, Evidence, Span};
use crate::providers::{GenerationRequest, TextGenerator};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

const SYSTEM_PROMPT: &str = "You are a technical documentation expert. \
Given source excerpts, produce a multi-turn conversation that explains the code, \
highlights validation and logging behaviour, and summarizes the key insights. \
Always cite evidence using file paths and line ranges. Respond with a single JSON object.";

const CRITIQUE_SYSTEM_PROMPT: &str =
    "You review synthesized documentation conversations against their source evidence.";

/// Configuration for synthesis
#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    /// Clusters in flight at once
    pub concurrency: usize,

    /// Stop after attempting this many clusters
    pub max_records: Option<usize>,

    pub max_tokens: u32,
    pub temperature: f32,
    pub critique_max_tokens: u32,

    /// Set to stop issuing new clusters; in-flight ones finish
    pub stop: Arc<AtomicBool>,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_records: None,
            max_tokens: 1800,
            temperature: 0.2,
            critique_max_tokens: 400,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// A cluster that produced no record, and why
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterFailure {
    pub cluster_id: String,
    pub error: String,
}

/// Result of a synthesis batch
#[derive(Debug, Default)]
pub struct SynthesisReport {
    /// Records in cluster order
    pub records: Vec<ConversationRecord>,
    pub failures: Vec<ClusterFailure>,
    /// Clusters actually sent to the generator
    pub attempted: usize,
}

pub struct Synthesizer {
    generator: Arc<dyn TextGenerator>,
    critic: Arc<dyn TextGenerator>,
    config: SynthesisConfig,
}

impl Synthesizer {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        critic: Arc<dyn TextGenerator>,
        config: SynthesisConfig,
    ) -> Self {
        Self {
            generator,
            critic,
            config,
        }
    }

    /// Attempt one record per cluster. Individual failures are collected,
    /// never propagated.
    pub async fn generate(&self, clusters: &[Cluster<'_>]) -> SynthesisReport {
        let limit = self.config.max_records.unwrap_or(clusters.len());
        info!(
            clusters = clusters.len(),
            limit,
            concurrency = self.config.concurrency,
            generator = self.generator.model(),
            critic = self.critic.model(),
            "synthesizing conversations"
        );

        let results: Vec<Option<(&Cluster<'_>, Result<ConversationRecord, SynthesisError>)>> =
            stream::iter(clusters.iter().take(limit))
                .map(|cluster| async move {
                    if self.config.stop.load(Ordering::SeqCst) {
                        return None;
                    }
                    Some((cluster, self.synthesize_cluster(cluster).await))
                })
                .buffered(self.config.concurrency.max(1))
                .collect()
                .await;

        let mut report = SynthesisReport::default();
        let mut seen_ids = HashSet::new();

        for (cluster, result) in results.into_iter().flatten() {
            report.attempted += 1;
            match result {
                Ok(mut record) => {
                    if !seen_ids.insert(record.conversation_id.clone()) {
                        record.conversation_id =
                            unique_id(&record.conversation_id, &cluster.id, &seen_ids);
                        seen_ids.insert(record.conversation_id.clone());
                    }
                    report.records.push(record);
                }
                Err(e) => {
                    warn!(cluster = %cluster.id, error = %e, "cluster produced no record");
                    report.failures.push(ClusterFailure {
                        cluster_id: cluster.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if self.config.stop.load(Ordering::SeqCst) {
            warn!(attempted = report.attempted, "synthesis stopped early");
        }
        info!(
            attempted = report.attempted,
            produced = report.records.len(),
            failed = report.failures.len(),
            "synthesis complete"
        );
        report
    }

    async fn synthesize_cluster(
        &self,
        cluster: &Cluster<'_>,
    ) -> Result<ConversationRecord, SynthesisError> {
        let context = build_context(&cluster.spans);
        let request = GenerationRequest {
            system: SYSTEM_PROMPT.to_string(),
            prompt: format!(
                "Create a JSON object with keys: conversation_id, turns (list of {{role, content, \
                 evidence: [{{path, lines}}], metadata}}), summary (with keys bullet_points, \
                 data_quality, risk_notes). Use the provided context strictly.\n\nContext:\n{}",
                context
            ),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            json_mode: true,
        };

        let response = self.generator.complete(&request).await?;
        let (json_text, value) = parse_json_response(&response)?;
        let payload = validate_payload(value)?;

        let critique = self.critique(&cluster.id, json_text).await;

        Ok(ConversationRecord {
            conversation_id: payload
                .conversation_id
                .unwrap_or_else(|| format!("conversation-{}", cluster.id)),
            source_files: cluster.source_files(),
            ontology_tags: cluster.ontology_tags.clone(),
            turns: payload.turns,
            summary: payload.summary,
            critique,
        })
    }

    /// Second-opinion review. Any failure just leaves the record without one.
    async fn critique(&self, cluster_id: &str, conversation_json: &str) -> Option<String> {
        let request = GenerationRequest {
            system: CRITIQUE_SYSTEM_PROMPT.to_string(),
            prompt: format!(
                "Review the following JSON conversation for factual accuracy and clarity. \
                 Respond with concise critique (or 'OK' if solid).\n\n{}",
                conversation_json
            ),
            max_tokens: self.config.critique_max_tokens,
            temperature: 0.0,
            json_mode: false,
        };

        match self.critic.complete(&request).await {
            Ok(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
            Ok(_) => None,
            Err(e) => {
                warn!(cluster = %cluster_id, error = %e, "critique failed");
                None
            }
        }
    }
}

/// Render member spans as the generation context
pub fn build_context(spans: &[&Span]) -> String {
    spans
        .iter()
        .enumerate()
        .map(|(i, span)| {
            let tags = if span.tags().is_empty() {
                "none".to_string()
            } else {
                span.tags().join(", ")
            };
            format!(
                "Span {}:\nPath: {}\nLines: {}\nTags: {}\nContent:\n{}\n",
                i + 1,
                span.path,
                span.line_range(),
                tags,
                span.content.trim()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parse a model response as JSON, falling back to the outermost `{...}`.
/// Returns the text that parsed alongside the value.
pub fn parse_json_response(text: &str) -> Result<(&str, Value), SynthesisError> {
    if let Ok(value) = serde_json::from_str(text) {
        return Ok((text, value));
    }

    let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) else {
        return Err(SynthesisError::MalformedJson(
            "no JSON object in response".to_string(),
        ));
    };
    if end < start {
        return Err(SynthesisError::MalformedJson(
            "no JSON object in response".to_string(),
        ));
    }

    let candidate = &text[start..=end];
    serde_json::from_str(candidate)
        .map(|value| (candidate, value))
        .map_err(|e| SynthesisError::MalformedJson(e.to_string()))
}

#[derive(Debug, Deserialize)]
struct RawConversation {
    #[serde(default)]
    conversation_id: Option<Value>,
    turns: Vec<RawTurn>,
    summary: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RawTurn {
    role: String,
    content: String,
    #[serde(default)]
    evidence: Vec<RawEvidence>,
    #[serde(default)]
    metadata: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RawEvidence {
    path: String,
    lines: LineRange,
}

/// Line ranges as models actually emit them
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LineRange {
    Text(String),
    Single(u64),
    Pair([u64; 2]),
}

impl LineRange {
    fn normalize(&self) -> Option<String> {
        match self {
            LineRange::Single(n) => Some(format!("{}-{}", n, n)),
            LineRange::Pair([a, b]) => Some(format!("{}-{}", a, b)),
            LineRange::Text(s) => {
                let s = s.trim().trim_start_matches(['L', 'l']);
                match s.split_once('-') {
                    Some((a, b)) => {
                        let a: u64 = a.trim().parse().ok()?;
                        let b: u64 = b.trim().trim_start_matches(['L', 'l']).parse().ok()?;
                        Some(format!("{}-{}", a, b))
                    }
                    None => {
                        let n: u64 = s.parse().ok()?;
                        Some(format!("{}-{}", n, n))
                    }
                }
            }
        }
    }
}

/// Schema-checked conversation body
struct ConversationPayload {
    conversation_id: Option<String>,
    turns: Vec<ConversationTurn>,
    summary: Map<String, Value>,
}

/// `<id>-<cluster>`, or `<id>-<cluster>-<n>` when that is taken too
fn unique_id(id: &str, cluster_id: &str, seen: &HashSet<String>) -> String {
    let base = format!("{}-{}", id, cluster_id);
    if !seen.contains(&base) {
        return base;
    }
    (2..)
        .map(|n| format!("{}-{}", base, n))
        .find(|candidate| !seen.contains(candidate))
        .unwrap_or(base)
}

fn validate_payload(value: Value) -> Result<ConversationPayload, SynthesisError> {
    let raw: RawConversation =
        serde_json::from_value(value).map_err(|e| SynthesisError::Schema(e.to_string()))?;

    if raw.turns.is_empty() {
        return Err(SynthesisError::Schema("turns is empty".to_string()));
    }

    let mut turns = Vec::with_capacity(raw.turns.len());
    for (i, turn) in raw.turns.into_iter().enumerate() {
        if turn.role.trim().is_empty() || turn.content.trim().is_empty() {
            return Err(SynthesisError::Schema(format!(
                "turn {} has an empty role or content",
                i
            )));
        }

        let evidence = turn
            .evidence
            .iter()
            .map(|e| {
                let lines = e.lines.normalize().ok_or_else(|| {
                    SynthesisError::Schema(format!("turn {} has unreadable evidence lines", i))
                })?;
                Ok(Evidence {
                    path: e.path.clone(),
                    lines,
                })
            })
            .collect::<Result<Vec<_>, SynthesisError>>()?;

        turns.push(ConversationTurn {
            role: turn.role,
            content: turn.content,
            evidence,
            metadata: turn.metadata,
        });
    }

    let conversation_id = match raw.conversation_id {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };

    Ok(ConversationPayload {
        conversation_id,
        turns,
        summary: raw.summary,
    })
}
