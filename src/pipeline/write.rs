// write.rs
// Phase 6: Serialize records into a positional train/valid split plus stats

use crate::error::WriteError;
use crate::model::ConversationRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

pub const TRAIN_FILE: &str = "semantic.train.jsonl";
pub const VALID_FILE: &str = "semantic.valid.jsonl";
pub const STATS_FILE: &str = "semantic.stats.json";

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub output_dir: PathBuf,
    /// Fraction of records, taken from the front, used for validation
    pub valid_ratio: f64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            valid_ratio: 0.1,
        }
    }
}

/// Contents of `semantic.stats.json`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetStats {
    pub total: usize,
    pub train: usize,
    pub valid: usize,
    /// Clusters sent to synthesis
    pub attempted: usize,
    /// Clusters that produced no record
    pub failed: usize,
    /// Records dropped by dedupe. `attempted == total + failed + duplicates`
    pub duplicates: usize,
    pub generated_at: DateTime<Utc>,
}

/// Counts from synthesis and post-processing recorded alongside the split
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SynthesisCounts {
    pub attempted: usize,
    pub failed: usize,
    pub duplicates: usize,
}

/// Paths written by one `write` call
#[derive(Debug, Clone)]
pub struct DatasetPaths {
    pub train: PathBuf,
    pub valid: PathBuf,
    pub stats: PathBuf,
}

pub struct Writer {
    config: WriterConfig,
}

impl Writer {
    pub fn new(config: WriterConfig) -> Self {
        Self { config }
    }

    pub fn paths(&self) -> DatasetPaths {
        let dir = &self.config.output_dir;
        DatasetPaths {
            train: dir.join(TRAIN_FILE),
            valid: dir.join(VALID_FILE),
            stats: dir.join(STATS_FILE),
        }
    }

    /// Write the split and stats, replacing any previous output
    pub fn write(
        &self,
        records: &[ConversationRecord],
        counts: SynthesisCounts,
    ) -> Result<DatasetStats, WriteError> {
        let dir = &self.config.output_dir;
        fs::create_dir_all(dir).map_err(|source| WriteError::Io {
            path: dir.clone(),
            source,
        })?;

        let split = valid_count(records.len(), self.config.valid_ratio);
        let (valid, train) = records.split_at(split);
        let paths = self.paths();

        write_jsonl(&paths.train, train)?;
        write_jsonl(&paths.valid, valid)?;

        let stats = DatasetStats {
            total: records.len(),
            train: train.len(),
            valid: valid.len(),
            attempted: counts.attempted,
            failed: counts.failed,
            duplicates: counts.duplicates,
            generated_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&stats)?;
        fs::write(&paths.stats, json).map_err(|source| WriteError::Io {
            path: paths.stats.clone(),
            source,
        })?;

        info!(
            total = stats.total,
            train = stats.train,
            valid = stats.valid,
            duplicates = stats.duplicates,
            dir = %dir.display(),
            "dataset written"
        );
        Ok(stats)
    }
}

/// `max(1, floor(n * ratio))` for non-empty input, never more than `n`
pub fn valid_count(n: usize, ratio: f64) -> usize {
    if n == 0 {
        return 0;
    }
    let ratio = ratio.clamp(0.0, 1.0);
    ((n as f64 * ratio).floor() as usize).clamp(1, n)
}

fn write_jsonl(path: &Path, records: &[ConversationRecord]) -> Result<(), WriteError> {
    let io_err = |source| WriteError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut out = BufWriter::new(File::create(path).map_err(io_err)?);
    for record in records {
        let line = record.to_json_line()?;
        writeln!(out, "{}", line).map_err(io_err)?;
    }
    out.flush().map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConversationTurn;
    use serde_json::Map;
    use tempfile::tempdir;

    fn records(n: usize) -> Vec<ConversationRecord> {
        (0..n)
            .map(|i| ConversationRecord {
                conversation_id: format!("conv-{}", i),
                source_files: vec!["a.py".to_string()],
                ontology_tags: vec!["factor".to_string()],
                turns: vec![ConversationTurn {
                    role: "assistant".to_string(),
                    content: format!("answer {}\nwith a newline", i),
                    evidence: vec![],
                    metadata: Map::new(),
                }],
                summary: Map::new(),
                critique: None,
            })
            .collect()
    }

    fn read_ids(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| ConversationRecord::from_json(l).unwrap().conversation_id)
            .collect()
    }

    #[test]
    fn split_sizes() {
        assert_eq!(valid_count(0, 0.1), 0);
        assert_eq!(valid_count(1, 0.1), 1);
        assert_eq!(valid_count(9, 0.1), 1);
        assert_eq!(valid_count(25, 0.1), 2);
        assert_eq!(valid_count(4, 1.5), 4);
        for n in 1..200 {
            let v = valid_count(n, 0.1);
            assert!(v >= 1 && v <= n);
        }
    }

    #[test]
    fn validation_takes_the_leading_records() {
        let dir = tempdir().unwrap();
        let writer = Writer::new(WriterConfig {
            output_dir: dir.path().join("out"),
            valid_ratio: 0.1,
        });

        let counts = SynthesisCounts {
            attempted: 25,
            failed: 3,
            duplicates: 2,
        };
        let stats = writer.write(&records(20), counts).unwrap();
        assert_eq!((stats.total, stats.train, stats.valid), (20, 18, 2));
        assert_eq!((stats.attempted, stats.failed, stats.duplicates), (25, 3, 2));
        assert_eq!(stats.attempted, stats.total + stats.failed + stats.duplicates);

        let paths = writer.paths();
        assert_eq!(read_ids(&paths.valid), vec!["conv-0", "conv-1"]);
        let train = read_ids(&paths.train);
        assert_eq!(train.len(), 18);
        assert_eq!(train[0], "conv-2");

        let stats_json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths.stats).unwrap()).unwrap();
        assert_eq!(stats_json["total"], 20);
        assert_eq!(stats_json["duplicates"], 2);
        assert!(stats_json["generated_at"].is_string());
    }

    #[test]
    fn rerun_overwrites_and_empty_input_writes_empty_files() {
        let dir = tempdir().unwrap();
        let writer = Writer::new(WriterConfig {
            output_dir: dir.path().to_path_buf(),
            valid_ratio: 0.1,
        });

        let counts = SynthesisCounts {
            attempted: 5,
            ..SynthesisCounts::default()
        };
        writer.write(&records(5), counts).unwrap();
        let stats = writer.write(&[], SynthesisCounts::default()).unwrap();

        assert_eq!((stats.total, stats.train, stats.valid), (0, 0, 0));
        let paths = writer.paths();
        assert_eq!(fs::read_to_string(&paths.train).unwrap(), "");
        assert_eq!(fs::read_to_string(&paths.valid).unwrap(), "");
    }
}
