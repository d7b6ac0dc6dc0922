//! Append-only JSONL result log.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs2::FileExt;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("output log {0} is locked by another run")]
    Locked(PathBuf),
    #[error("result sink lock poisoned")]
    Poisoned,
    #[error("sink worker failed: {0}")]
    Join(String),
}

/// Destination for completed records.
pub trait ResultSink: Send + Sync {
    /// Append one record as a single line. Concurrent callers never interleave.
    fn append(&self, record: &Value) -> Result<(), SinkError>;
}

/// Appends newline-delimited JSON to one file, serialized by a mutex.
///
/// The file is opened in append mode on first use (or by [`prepare`]), and
/// its parent directory is created if missing. A log that does not end in a
/// newline (a record torn by a crash) gets one before anything is appended,
/// so the next record always starts on its own line. A failed write drops
/// the handle and the next append reopens and repairs the tail the same way.
///
/// [`prepare`]: JsonlResultSink::prepare
#[derive(Debug)]
pub struct JsonlResultSink {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl JsonlResultSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the parent directory and open the log now instead of on the
    /// first append, so an unwritable destination fails before any work.
    pub fn prepare(&self) -> Result<(), SinkError> {
        let mut guard = self.file.lock().map_err(|_| SinkError::Poisoned)?;
        if guard.is_none() {
            *guard = Some(self.open()?);
        }
        Ok(())
    }

    /// Take an exclusive advisory lock on `<output>.lock`.
    ///
    /// Fails immediately with [`SinkError::Locked`] if another process holds it.
    pub fn lock_exclusive(&self) -> Result<OutputLock, SinkError> {
        OutputLock::acquire(&self.path)
    }

    fn open(&self) -> Result<File, SinkError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| SinkError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| self.io_err(source))?;
        self.terminate_last_line(&mut file)
            .map_err(|source| self.io_err(source))?;
        Ok(file)
    }

    fn terminate_last_line(&self, file: &mut File) -> std::io::Result<()> {
        if file.metadata()?.len() == 0 {
            return Ok(());
        }
        let mut last = [0u8; 1];
        file.seek(SeekFrom::End(-1))?;
        file.read_exact(&mut last)?;
        if last[0] != b'\n' {
            tracing::warn!(path = %self.path.display(), "Output log ends mid-record; starting a new line");
            file.write_all(b"\n")?;
            file.flush()?;
        }
        Ok(())
    }

    fn io_err(&self, source: std::io::Error) -> SinkError {
        SinkError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl ResultSink for JsonlResultSink {
    fn append(&self, record: &Value) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut guard = self.file.lock().map_err(|_| SinkError::Poisoned)?;
        let mut file = match guard.take() {
            Some(file) => file,
            None => self.open()?,
        };
        file.write_all(&line)
            .and_then(|()| file.flush())
            .map_err(|e| self.io_err(e))?;
        *guard = Some(file);
        Ok(())
    }
}

/// Held for the duration of a run; released on drop.
///
/// The `.lock` file itself stays on disk. Deleting it on release would let a
/// waiting run and a fresh run lock two different files for the same output.
#[derive(Debug)]
pub struct OutputLock {
    path: PathBuf,
    file: File,
}

impl OutputLock {
    fn acquire(output_path: &Path) -> Result<Self, SinkError> {
        let mut name = output_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        let path = output_path.with_file_name(name);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| SinkError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| SinkError::Io {
                path: path.clone(),
                source,
            })?;
        file.try_lock_exclusive()
            .map_err(|_| SinkError::Locked(output_path.to_path_buf()))?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for OutputLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
