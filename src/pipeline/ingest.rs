// ingest.rs
// Phase 0: Discover parseable files under a repository root

use crate::error::PipelineError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// How a discovered file will be parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileClass {
    /// Indentation-scanned source code
    Source,
    /// Heading-segmented documentation
    Documentation,
}

#[derive(Debug, Clone)]
pub struct DiscoveredFile {
    /// Repository-relative path with forward slashes
    pub relative: String,
    pub absolute: PathBuf,
    pub class: FileClass,
}

const SKIP_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "build",
    "dist",
    "__pycache__",
    ".venv",
    "venv",
    ".idea",
    ".vscode",
];

const SOURCE_EXTENSIONS: &[&str] = &["py"];
const DOC_EXTENSIONS: &[&str] = &["md", "markdown"];

/// Walk `root` recursively and return recognized files sorted by relative path.
///
/// Only an unreadable root fails discovery. Entries and subdirectories that
/// cannot be read are logged and skipped.
pub fn discover(root: &Path) -> Result<Vec<DiscoveredFile>, PipelineError> {
    let entries = fs::read_dir(root).map_err(|source| PipelineError::Discover {
        path: root.to_path_buf(),
        source,
    })?;

    let mut files = Vec::new();
    visit_entries(root, entries, &mut files);
    files.sort_by(|a, b| a.relative.cmp(&b.relative));

    debug!(count = files.len(), root = %root.display(), "discovered files");
    Ok(files)
}

fn visit_dir(base: &Path, dir: &Path, files: &mut Vec<DiscoveredFile>) {
    match fs::read_dir(dir) {
        Ok(entries) => visit_entries(base, entries, files),
        Err(e) => warn!(dir = %dir.display(), error = %e, "skipping unreadable directory"),
    }
}

fn visit_entries(base: &Path, entries: fs::ReadDir, files: &mut Vec<DiscoveredFile>) {
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "skipping unreadable directory entry");
                continue;
            }
        };
        let path = entry.path();
        let file_type = match entry.file_type() {
            Ok(file_type) => file_type,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping entry with unknown type");
                continue;
            }
        };

        if file_type.is_dir() {
            let name = path.file_name().and_then(|s| s.to_str()).unwrap_or("");
            if SKIP_DIRS.contains(&name) {
                debug!(dir = %path.display(), "skipping directory");
                continue;
            }
            visit_dir(base, &path, files);
        } else if file_type.is_file() {
            let Some(class) = classify(&path) else {
                continue;
            };
            if let Ok(rel) = path.strip_prefix(base) {
                files.push(DiscoveredFile {
                    relative: normalize_path(rel),
                    absolute: path.clone(),
                    class,
                });
            }
        }
    }
}

/// Decide the parser for a path from its extension
pub fn classify(path: &Path) -> Option<FileClass> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    if SOURCE_EXTENSIONS.contains(&ext.as_str()) {
        Some(FileClass::Source)
    } else if DOC_EXTENSIONS.contains(&ext.as_str()) {
        Some(FileClass::Documentation)
    } else {
        None
    }
}

/// Forward-slash form of a path, used for provenance and cache keys
pub fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
