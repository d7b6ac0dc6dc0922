//! Task records and JSONL task loading.
//!
//! A task is an arbitrary JSON object carrying at least `instruction` and
//! `input`. Every other field passes through untouched to the output log.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const INSTRUCTION_FIELD: &str = "instruction";
pub const INPUT_FIELD: &str = "input";
pub const GROUND_TRUTH_FIELD: &str = "ground_truth";
const LEGACY_GROUND_TRUTH_FIELD: &str = "gt";

#[derive(Debug, thiserror::Error)]
pub enum TaskLoadError {
    #[error("input file not found: {0}")]
    NotFound(PathBuf),
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TaskValidationError {
    #[error("task record must be a JSON object")]
    NotAnObject,
    #[error("field `{0}` must be a string")]
    NotAString(&'static str),
}

/// One task, immutable while it is processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct TaskRecord {
    fields: Map<String, Value>,
}

impl TryFrom<Value> for TaskRecord {
    type Error = TaskValidationError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Object(fields) = value else {
            return Err(TaskValidationError::NotAnObject);
        };
        for field in [INSTRUCTION_FIELD, INPUT_FIELD] {
            match fields.get(field) {
                None | Some(Value::Null) | Some(Value::String(_)) => {}
                Some(_) => return Err(TaskValidationError::NotAString(field)),
            }
        }
        Ok(Self { fields })
    }
}

impl From<TaskRecord> for Value {
    fn from(task: TaskRecord) -> Self {
        Value::Object(task.fields)
    }
}

impl TaskRecord {
    /// Build a record from the two identity fields.
    pub fn new(instruction: impl Into<String>, input: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert(INSTRUCTION_FIELD.into(), Value::String(instruction.into()));
        fields.insert(INPUT_FIELD.into(), Value::String(input.into()));
        Self { fields }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn without_field(mut self, key: &str) -> Self {
        self.fields.remove(key);
        self
    }

    pub fn instruction(&self) -> &str {
        self.str_field(INSTRUCTION_FIELD)
    }

    pub fn input(&self) -> &str {
        self.str_field(INPUT_FIELD)
    }

    /// Reference answer, if the record carries one. Never sent to the model.
    pub fn ground_truth(&self) -> Option<&Value> {
        self.fields
            .get(GROUND_TRUTH_FIELD)
            .or_else(|| self.fields.get(LEGACY_GROUND_TRUTH_FIELD))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Tasks with neither instruction nor input are never dispatched.
    pub fn is_dispatchable(&self) -> bool {
        !self.instruction().trim().is_empty() || !self.input().trim().is_empty()
    }

    /// The record plus output fields, ready for the result sink.
    pub fn into_output<I, K>(self, outputs: I) -> Value
    where
        I: IntoIterator<Item = (K, String)>,
        K: Into<String>,
    {
        let mut fields = self.fields;
        for (key, text) in outputs {
            fields.insert(key.into(), Value::String(text));
        }
        Value::Object(fields)
    }

    fn str_field(&self, key: &str) -> &str {
        self.fields.get(key).and_then(Value::as_str).unwrap_or("")
    }
}

/// Tasks read from one input file.
#[derive(Debug, Default)]
pub struct LoadedTasks {
    pub tasks: Vec<TaskRecord>,
    /// Lines that were not valid JSON (or not UTF-8).
    pub malformed_lines: usize,
    /// Lines that parsed but failed record validation.
    pub invalid_records: usize,
}

/// Read newline-delimited task records. Bad lines are skipped, not fatal.
pub fn load_tasks(path: impl AsRef<Path>) -> Result<LoadedTasks, TaskLoadError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => TaskLoadError::NotFound(path.to_path_buf()),
        _ => TaskLoadError::Io {
            path: path.to_path_buf(),
            source: e,
        },
    })?;

    let mut loaded = LoadedTasks::default();
    for_each_json_line(BufReader::new(file), |parsed| match parsed {
        Some(value) => match TaskRecord::try_from(value) {
            Ok(task) => loaded.tasks.push(task),
            Err(e) => {
                loaded.invalid_records += 1;
                tracing::debug!(error = %e, "Skipping invalid task record");
            }
        },
        None => loaded.malformed_lines += 1,
    })
    .map_err(|source| TaskLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    if loaded.malformed_lines > 0 || loaded.invalid_records > 0 {
        tracing::warn!(
            path = %path.display(),
            malformed_lines = loaded.malformed_lines,
            invalid_records = loaded.invalid_records,
            "Skipped unreadable task lines"
        );
    }
    Ok(loaded)
}

/// Feed every non-blank line to `f` as parsed JSON, or `None` if unparsable.
///
/// Shared by task loading and checkpoint scanning: neither may abort on a
/// single bad line, including a truncated final line.
pub(crate) fn for_each_json_line<R: BufRead>(
    mut reader: R,
    mut f: impl FnMut(Option<Value>),
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            return Ok(());
        }
        let Ok(line) = std::str::from_utf8(&buf) else {
            f(None);
            continue;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        f(serde_json::from_str::<Value>(line).ok());
    }
}
