//! Per-process trace file naming and discovery
//!
//! Each capturing process writes its own trace, named after a shared base
//! path plus its process id (`trace.log` becomes `trace_4242.log`). Split
//! captures come as `log_<id>.log` / `index_<id>.log` pairs.

use super::reader::TraceReader;
use super::source::RecordSource;
use super::split::SplitReader;
use crate::error::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const TRACE_EXTENSION: &str = "log";
const SPLIT_LOG_PREFIX: &str = "log_";
const SPLIT_INDEX_PREFIX: &str = "index_";

/// Derive the trace path for process `pid` from a shared base path
pub fn process_trace_path(base: impl AsRef<Path>, pid: u32) -> PathBuf {
    let base = base.as_ref();
    let name = base
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = name.strip_suffix(".log").unwrap_or(&name);
    base.with_file_name(format!("{stem}_{pid}.{TRACE_EXTENSION}"))
}

/// Where one trace lives on disk
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum TraceLocation {
    /// Canonical framed trace
    Framed(PathBuf),
    /// Split log/index pair
    Split { log: PathBuf, index: PathBuf },
}

impl TraceLocation {
    /// Open the matching reader
    pub fn open(&self) -> Result<Box<dyn RecordSource>> {
        Ok(match self {
            TraceLocation::Framed(path) => Box::new(TraceReader::open(path)?),
            TraceLocation::Split { log, index } => Box::new(SplitReader::open(log, index)?),
        })
    }

    /// Path of the record stream
    pub fn path(&self) -> &Path {
        match self {
            TraceLocation::Framed(path) => path,
            TraceLocation::Split { log, .. } => log,
        }
    }
}

impl std::fmt::Display for TraceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceLocation::Framed(path) => write!(f, "{}", path.display()),
            TraceLocation::Split { log, index } => {
                write!(f, "{} (index {})", log.display(), index.display())
            }
        }
    }
}

/// List the traces in `dir`, in a stable order
///
/// `exclude` names a file to skip, typically the merge output.
pub fn discover_traces(dir: impl AsRef<Path>, exclude: Option<&Path>) -> Result<Vec<TraceLocation>> {
    let dir = dir.as_ref();
    let exclude = exclude.map(|p| p.file_name().map(|n| n.to_os_string()));

    let mut framed = Vec::new();
    let mut split_logs = BTreeMap::new();
    let mut split_indexes = BTreeMap::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        if exclude
            .as_ref()
            .is_some_and(|ex| ex.as_deref() == path.file_name())
        {
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some(TRACE_EXTENSION) {
            continue;
        }

        let name = entry.file_name().to_string_lossy().into_owned();
        let id = name.strip_suffix(".log").unwrap_or(&name);
        if let Some(id) = id.strip_prefix(SPLIT_INDEX_PREFIX) {
            split_indexes.insert(id.to_string(), path);
        } else if let Some(id) = id.strip_prefix(SPLIT_LOG_PREFIX) {
            split_logs.insert(id.to_string(), path);
        } else {
            framed.push(path);
        }
    }

    let mut traces: Vec<_> = framed.into_iter().map(TraceLocation::Framed).collect();
    for (id, log) in split_logs {
        match split_indexes.remove(&id) {
            Some(index) => traces.push(TraceLocation::Split { log, index }),
            // A lone log_ file is a framed capture that happens to share the prefix
            None => traces.push(TraceLocation::Framed(log)),
        }
    }
    for (id, index) in split_indexes {
        tracing::warn!(id = %id, index = %index.display(), "Index file without a matching log file, skipping");
    }

    traces.sort();
    Ok(traces)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_trace_path() {
        assert_eq!(
            process_trace_path("/tmp/trace.log", 42),
            PathBuf::from("/tmp/trace_42.log")
        );
        assert_eq!(
            process_trace_path("/tmp/trace", 7),
            PathBuf::from("/tmp/trace_7.log")
        );
    }

    #[test]
    fn test_discover_pairs_split_files() {
        let dir = tempfile::TempDir::new().unwrap();
        for name in [
            "b_2.log",
            "a_1.log",
            "log_9.log",
            "index_9.log",
            "index_5.log",
            "merged.log",
            "notes.txt",
        ] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }

        let exclude = dir.path().join("merged.log");
        let traces = discover_traces(dir.path(), Some(&exclude)).unwrap();
        assert_eq!(
            traces,
            vec![
                TraceLocation::Framed(dir.path().join("a_1.log")),
                TraceLocation::Framed(dir.path().join("b_2.log")),
                TraceLocation::Split {
                    log: dir.path().join("log_9.log"),
                    index: dir.path().join("index_9.log"),
                },
            ]
        );
    }
}
