// pipeline/cluster.rs
// Phase 4: Semantic clustering of embedded spans (HDBSCAN + singleton fallback)

use crate::error::ClusterError;
use crate::model::{Cluster, Span, SINGLETON_PREFIX};
use hdbscan::{DistanceMetric, Hdbscan, HdbscanHyperParams};
use ndarray::Array2;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

/// Distance used by the density estimate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Metric {
    #[default]
    Euclidean,
    Manhattan,
    Chebyshev,
}

impl From<Metric> for DistanceMetric {
    fn from(metric: Metric) -> Self {
        match metric {
            Metric::Euclidean => DistanceMetric::Euclidean,
            Metric::Manhattan => DistanceMetric::Manhattan,
            Metric::Chebyshev => DistanceMetric::Chebyshev,
        }
    }
}

/// Configuration for clustering
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Minimum cluster size for HDBSCAN
    pub min_cluster_size: usize,

    /// Neighbourhood size for core distances
    pub min_samples: usize,

    pub metric: Metric,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            min_cluster_size: 5,
            min_samples: 3,
            metric: Metric::Euclidean,
        }
    }
}

/// HDBSCAN noise label
const NOISE: i32 = -1;

/// Group spans by their embeddings.
///
/// Row `i` of `embeddings` belongs to `spans[i]`. Noise points become
/// singletons numbered from 1 in span order; clusters appear in order of
/// their first member.
pub fn cluster_spans<'a>(
    spans: &'a [Span],
    embeddings: &Array2<f32>,
    config: &ClusterConfig,
) -> Result<Vec<Cluster<'a>>, ClusterError> {
    if embeddings.nrows() != spans.len() {
        return Err(ClusterError::RowMismatch {
            spans: spans.len(),
            rows: embeddings.nrows(),
        });
    }
    if spans.is_empty() {
        return Ok(Vec::new());
    }
    validate_config(config)?;

    let data = normalize_rows(embeddings);

    let labels = if data.len() < config.min_cluster_size {
        debug!(
            points = data.len(),
            min_cluster_size = config.min_cluster_size,
            "too few points to cluster, emitting singletons"
        );
        vec![NOISE; data.len()]
    } else {
        run_hdbscan(&data, config)?
    };

    let clusters = assemble_clusters(spans, &data, &labels);
    info!(
        spans = spans.len(),
        clusters = clusters.iter().filter(|c| !c.is_singleton()).count(),
        singletons = clusters.iter().filter(|c| c.is_singleton()).count(),
        "clustering complete"
    );
    Ok(clusters)
}

fn validate_config(config: &ClusterConfig) -> Result<(), ClusterError> {
    if config.min_cluster_size < 2 {
        return Err(ClusterError::InvalidConfig(format!(
            "min_cluster_size must be at least 2, got {}",
            config.min_cluster_size
        )));
    }
    if config.min_samples == 0 {
        return Err(ClusterError::InvalidConfig(
            "min_samples must be at least 1".to_string(),
        ));
    }
    Ok(())
}

/// Unit-length copies of each row. Zero rows stay zero.
pub fn normalize_rows(embeddings: &Array2<f32>) -> Vec<Vec<f32>> {
    embeddings
        .rows()
        .into_iter()
        .map(|row| {
            let magnitude: f32 = row.iter().map(|x| x * x).sum::<f32>().sqrt();
            if magnitude > 0.0 {
                row.iter().map(|x| x / magnitude).collect()
            } else {
                row.to_vec()
            }
        })
        .collect()
}

/// Run HDBSCAN clustering on normalized rows
fn run_hdbscan(data: &[Vec<f32>], config: &ClusterConfig) -> Result<Vec<i32>, ClusterError> {
    // Core distances need min_samples neighbours besides the point itself
    let min_samples = config.min_samples.min(data.len() - 1).max(1);

    let params = HdbscanHyperParams::builder()
        .min_cluster_size(config.min_cluster_size)
        .min_samples(min_samples)
        .dist_metric(config.metric.into())
        .build();

    let clusterer = Hdbscan::new(data, params);
    clusterer
        .cluster()
        .map_err(|e| ClusterError::Density(e.to_string()))
}

enum Slot {
    Singleton(usize),
    Group(i32),
}

fn assemble_clusters<'a>(spans: &'a [Span], data: &[Vec<f32>], labels: &[i32]) -> Vec<Cluster<'a>> {
    let mut order = Vec::new();
    let mut groups: HashMap<i32, Vec<usize>> = HashMap::new();

    for (i, &label) in labels.iter().enumerate() {
        if label == NOISE {
            order.push(Slot::Singleton(i));
        } else {
            let members = groups.entry(label).or_default();
            if members.is_empty() {
                order.push(Slot::Group(label));
            }
            members.push(i);
        }
    }

    let mut singleton_count = 0;
    order
        .into_iter()
        .map(|slot| match slot {
            Slot::Singleton(i) => {
                singleton_count += 1;
                let id = format!("{}{}", SINGLETON_PREFIX, singleton_count);
                Cluster {
                    id,
                    spans: vec![&spans[i]],
                    ontology_tags: union_tags(&[&spans[i]]),
                    centroid: None,
                }
            }
            Slot::Group(label) => {
                let members = groups.remove(&label).unwrap_or_default();
                let member_spans: Vec<&Span> = members.iter().map(|&i| &spans[i]).collect();
                Cluster {
                    id: format!("cluster-{}", label),
                    ontology_tags: union_tags(&member_spans),
                    centroid: Some(compute_centroid(&members, data)),
                    spans: member_spans,
                }
            }
        })
        .collect()
}

fn union_tags(spans: &[&Span]) -> Vec<String> {
    spans
        .iter()
        .flat_map(|s| s.tags().iter().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Compute centroid of member rows
fn compute_centroid(members: &[usize], data: &[Vec<f32>]) -> Vec<f32> {
    let Some(&first) = members.first() else {
        return vec![];
    };

    let dim = data[first].len();
    let mut centroid = vec![0.0; dim];

    // Sum all vectors
    for &i in members {
        for (c, &val) in centroid.iter_mut().zip(&data[i]) {
            *c += val;
        }
    }

    // Average
    let count = members.len() as f32;
    for val in &mut centroid {
        *val /= count;
    }

    centroid
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SpanKind;
    use ndarray::array;

    fn spans(n: usize) -> Vec<Span> {
        (0..n)
            .map(|i| {
                let mut s = Span::new(
                    format!("f{}.py", i % 3),
                    SpanKind::FunctionDefinition,
                    format!("def f{}(): pass", i),
                    i * 10 + 1,
                    i * 10 + 5,
                );
                s.add_tag(if i % 2 == 0 { "regime" } else { "factor" });
                s
            })
            .collect()
    }

    fn matrix(rows: &[Vec<f32>]) -> Array2<f32> {
        let dim = rows[0].len();
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        Array2::from_shape_vec((rows.len(), dim), flat).unwrap()
    }

    #[test]
    fn row_count_mismatch_is_fatal() {
        let spans = spans(3);
        let embeddings = array![[1.0f32, 0.0], [0.0, 1.0]];
        let err = cluster_spans(&spans, &embeddings, &ClusterConfig::default()).unwrap_err();
        assert!(matches!(err, ClusterError::RowMismatch { spans: 3, rows: 2 }));
    }

    #[test]
    fn empty_input_yields_no_clusters() {
        let embeddings = Array2::<f32>::zeros((0, 0));
        let clusters = cluster_spans(&[], &embeddings, &ClusterConfig::default()).unwrap();
        assert!(clusters.is_empty());
    }

    #[test]
    fn too_few_points_become_ordered_singletons() {
        let spans = spans(3);
        let embeddings = array![[1.0f32, 0.0], [0.0, 1.0], [0.0, 0.0]];
        let clusters = cluster_spans(&spans, &embeddings, &ClusterConfig::default()).unwrap();

        let ids: Vec<_> = clusters.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["singleton-1", "singleton-2", "singleton-3"]);
        assert!(clusters.iter().all(|c| c.spans.len() == 1 && c.is_singleton()));
        assert_eq!(clusters[1].spans[0].line_start, 11);
        assert_eq!(clusters[0].ontology_tags, vec!["regime"]);
    }

    #[test]
    fn invalid_min_cluster_size_is_rejected() {
        let spans = spans(2);
        let embeddings = array![[1.0f32, 0.0], [0.0, 1.0]];
        let config = ClusterConfig {
            min_cluster_size: 1,
            ..ClusterConfig::default()
        };
        assert!(matches!(
            cluster_spans(&spans, &embeddings, &config),
            Err(ClusterError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rows_are_normalized_and_zero_rows_survive() {
        let rows = normalize_rows(&array![[3.0f32, 4.0], [0.0, 0.0]]);
        assert_eq!(rows[0], vec![0.6, 0.8]);
        assert_eq!(rows[1], vec![0.0, 0.0]);
    }

    /// Two tight groups of five with one far outlier between them
    fn grouped_rows() -> Vec<Vec<f32>> {
        let mut rows = Vec::new();
        for i in 0..5 {
            rows.push(vec![1.0, 0.01 * i as f32, 0.0]);
        }
        rows.push(vec![0.0, 0.0, 1.0]);
        for i in 0..5 {
            rows.push(vec![0.9, 0.436 + 0.01 * i as f32, 0.0]);
        }
        rows
    }

    #[test]
    fn similar_vectors_share_a_cluster_and_outliers_stay_alone() {
        let spans = spans(11);
        let embeddings = matrix(&grouped_rows());
        let config = ClusterConfig {
            min_cluster_size: 3,
            min_samples: 2,
            metric: Metric::Euclidean,
        };

        let clusters = cluster_spans(&spans, &embeddings, &config).unwrap();
        assert_eq!(clusters.len(), 3);

        assert!(!clusters[0].is_singleton());
        assert_eq!(clusters[0].spans.len(), 5);
        assert_eq!(clusters[0].spans[0].line_start, 1);

        assert_eq!(clusters[1].id, "singleton-1");
        assert_eq!(clusters[1].spans[0].line_start, 51);

        assert!(!clusters[2].is_singleton());
        assert_eq!(clusters[2].spans.len(), 5);
        assert_ne!(clusters[0].id, clusters[2].id);

        // Sorted union of member tags, centroid over normalized rows
        assert_eq!(clusters[0].ontology_tags, vec!["factor", "regime"]);
        let centroid = clusters[0].centroid.as_ref().unwrap();
        assert_eq!(centroid.len(), 3);
        assert!(centroid[0] > 0.99);
        assert!(clusters[1].centroid.is_none());
    }

    #[test]
    fn clustering_is_deterministic() {
        let spans = spans(11);
        let embeddings = matrix(&grouped_rows());
        let config = ClusterConfig {
            min_cluster_size: 3,
            min_samples: 2,
            metric: Metric::Manhattan,
        };

        fn ids(clusters: Vec<Cluster<'_>>) -> Vec<(String, usize)> {
            clusters.into_iter().map(|c| (c.id, c.spans.len())).collect()
        }
        let first = ids(cluster_spans(&spans, &embeddings, &config).unwrap());
        let second = ids(cluster_spans(&spans, &embeddings, &config).unwrap());
        assert_eq!(first, second);
    }
}
