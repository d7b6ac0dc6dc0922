//! Resume support: rebuild the set of completed fingerprints from a result log.

use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use crate::fingerprint::{fingerprint, Fingerprint};
use crate::task::{for_each_json_line, TaskRecord};

/// Field stamped on records written under a non-empty fingerprint suffix.
pub const SUFFIX_FIELD: &str = "fingerprint_suffix";

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("io error reading checkpoint {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result of scanning an existing output log.
#[derive(Debug, Default)]
pub struct CheckpointScan {
    pub completed: HashSet<Fingerprint>,
    /// Records that parsed; may exceed `completed.len()` if the log has duplicates.
    pub records: usize,
    /// Lines skipped because they did not parse as a task record.
    pub skipped_lines: usize,
    /// Records written under a different suffix; they do not count as done.
    pub other_variants: usize,
}

/// Fingerprints of the records in `output_path` that were written under
/// `suffix`.
///
/// A record without a [`SUFFIX_FIELD`] belongs to the empty suffix. A missing
/// log is the first-run case and yields an empty set.
pub fn load_completed(
    output_path: impl AsRef<Path>,
    suffix: &str,
) -> Result<HashSet<Fingerprint>, CheckpointError> {
    scan_completed(output_path, suffix).map(|scan| scan.completed)
}

/// Like [`load_completed`] but also reports what was skipped.
///
/// Fingerprints are recomputed from each record's identity fields rather than
/// read from a stored digest.
pub fn scan_completed(
    output_path: impl AsRef<Path>,
    suffix: &str,
) -> Result<CheckpointScan, CheckpointError> {
    let path = output_path.as_ref();
    let io_err = |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    };

    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(CheckpointScan::default());
        }
        Err(e) => return Err(io_err(e)),
    };

    let mut scan = CheckpointScan::default();
    for_each_json_line(BufReader::new(file), |parsed| {
        match parsed.map(TaskRecord::try_from) {
            Some(Ok(record)) => {
                scan.records += 1;
                let written_under = record
                    .get(SUFFIX_FIELD)
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                if written_under == suffix {
                    scan.completed.insert(fingerprint(&record, suffix));
                } else {
                    scan.other_variants += 1;
                }
            }
            _ => scan.skipped_lines += 1,
        }
    })
    .map_err(io_err)?;

    tracing::info!(
        path = %path.display(),
        completed = scan.completed.len(),
        skipped_lines = scan.skipped_lines,
        other_variants = scan.other_variants,
        "Loaded checkpoint"
    );
    Ok(scan)
}
