//! Runtime errors

use thiserror::Error;

use crate::path::Path;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors that abort composite construction or a run.
///
/// Build-time variants leave no partially constructed composite behind.
/// Adapter failures during a run do not surface here; they are recorded as
/// [`UnitFault`](crate::scheduler::UnitFault)s instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown type: {name}")]
    UnknownType { name: String },

    #[error("invalid type expression `{expr}`: {message}")]
    InvalidTypeExpression { expr: String, message: String },

    #[error("schema mismatch at {path}: expected {expected}, found {found}")]
    SchemaMismatch {
        path: Path,
        expected: String,
        found: String,
    },

    #[error("path not found: {0}")]
    PathNotFound(Path),

    #[error("unresolved wire for port `{port}` of unit {unit}")]
    UnresolvedWire { unit: Path, port: String },

    #[error("unknown unit address `{address}` for unit {unit}")]
    UnknownAddress { unit: Path, address: String },

    #[error("invalid unit declaration at {path}: {message}")]
    InvalidDeclaration { path: Path, message: String },

    #[error("cycle detected in step graph: {steps:?}")]
    CyclicStepGraph { steps: Vec<Path> },

    #[error("adapter error in unit {unit}: {source}")]
    Adapter {
        unit: Path,
        #[source]
        source: AdapterError,
    },

    #[error("steps did not reach a fixpoint after {passes} passes (still firing: {unstable:?})")]
    StepConvergence { passes: u32, unstable: Vec<Path> },

    #[error("emit sink error: {0}")]
    Sink(#[from] SinkError),
}

impl Error {
    pub(crate) fn mismatch(path: &Path, expected: impl ToString, found: impl ToString) -> Self {
        Error::SchemaMismatch {
            path: path.clone(),
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }
}

/// Failure reported by a process or step adapter.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct AdapterError {
    pub message: String,
}

impl AdapterError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for AdapterError {
    fn from(err: serde_json::Error) -> Self {
        AdapterError::new(format!("invalid config: {err}"))
    }
}

/// Errors from emit sinks.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("sink already closed")]
    AlreadyClosed,
}
