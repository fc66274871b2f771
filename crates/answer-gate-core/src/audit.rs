use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::trace::DecisionTrace;
use crate::GateError;

/// Append-only destination for decision traces. The caller owns the sink and passes it
/// into each run.
pub trait AuditSink: Send + Sync {
    /// # Errors
    /// Returns [`GateError::Audit`] when the trace could not be stored.
    fn record(&self, trace: &DecisionTrace) -> Result<(), GateError>;
}

/// Sink that keeps traces in memory, in recording order.
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    traces: Mutex<Vec<DecisionTrace>>,
}

impl InMemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn traces(&self) -> Vec<DecisionTrace> {
        self.traces.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.traces.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.traces.lock().is_empty()
    }

    pub fn clear(&self) {
        self.traces.lock().clear();
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&self, trace: &DecisionTrace) -> Result<(), GateError> {
        self.traces.lock().push(trace.clone());
        Ok(())
    }
}

/// Sink that appends one JSON object per line to a file.
#[derive(Debug)]
pub struct JsonLinesAuditSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonLinesAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), lock: Mutex::new(()) }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_error(&self, err: &std::io::Error) -> GateError {
        GateError::Audit(format!("failed to open {}: {err}", self.path.display()))
    }

    /// Read back every recorded trace. A missing file reads as empty.
    ///
    /// # Errors
    /// Returns [`GateError::Audit`] on I/O failure or a malformed line.
    pub fn read_all(&self) -> Result<Vec<DecisionTrace>, GateError> {
        let _guard = self.lock.lock();
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path).map_err(|err| self.open_error(&err))?;
        let mut traces = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|err| {
                GateError::Audit(format!("failed to read line {}: {err}", index + 1))
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let trace = serde_json::from_str(&line).map_err(|err| {
                GateError::Audit(format!("invalid trace on line {}: {err}", index + 1))
            })?;
            traces.push(trace);
        }
        Ok(traces)
    }
}

impl AuditSink for JsonLinesAuditSink {
    fn record(&self, trace: &DecisionTrace) -> Result<(), GateError> {
        let line = serde_json::to_string(trace)
            .map_err(|err| GateError::Audit(format!("failed to encode trace: {err}")))?;
        let _guard = self.lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| self.open_error(&err))?;
        writeln!(file, "{line}")
            .map_err(|err| GateError::Audit(format!("failed to append trace: {err}")))
    }
}
