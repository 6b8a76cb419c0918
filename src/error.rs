//! Error types for query checking and evaluation.
//!
//! A query can fail in three disjoint ways, and callers handle each one
//! differently:
//!
//! - [`MalformedQuery`]: the query tree does not match the expected schema.
//!   This is a bug in the client, not in the user's query.
//! - [`BadQueryError`]: the query is well formed but fails type checking.
//!   Surfaced verbatim to the user together with a backtrace.
//! - [`RuntimeError`]: evaluation failed for a reason the type checker
//!   cannot see (storage failure, script failure, cancellation).

use std::fmt;

use thiserror::Error;

use crate::backtrace::Backtrace;

/// The query tree violates the expected schema.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("malformed query: {message}")]
pub struct MalformedQuery {
    pub message: String,
}

impl MalformedQuery {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The user's query accesses undefined variables or has mismatched types.
#[derive(Debug, Clone, PartialEq)]
pub struct BadQueryError {
    pub message: String,
    pub backtrace: Backtrace,
}

impl BadQueryError {
    pub fn new(message: impl Into<String>, backtrace: &Backtrace) -> Self {
        Self {
            message: message.into(),
            backtrace: backtrace.clone(),
        }
    }
}

/// Evaluation failed.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    pub message: String,
    pub backtrace: Backtrace,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>, backtrace: &Backtrace) -> Self {
        Self {
            message: message.into(),
            backtrace: backtrace.clone(),
        }
    }
}

// Written by hand: thiserror treats a field named `backtrace` as a
// `std::backtrace::Backtrace` provider.
impl fmt::Display for BadQueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for BadQueryError {}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RuntimeError {}

/// Category tag reported to the protocol layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    MalformedInput,
    BadQuery,
    Runtime,
}

/// Any failure of the query lifecycle.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    #[error(transparent)]
    Malformed(#[from] MalformedQuery),

    #[error(transparent)]
    BadQuery(#[from] BadQueryError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl QueryError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            QueryError::Malformed(_) => ErrorCategory::MalformedInput,
            QueryError::BadQuery(_) => ErrorCategory::BadQuery,
            QueryError::Runtime(_) => ErrorCategory::Runtime,
        }
    }

    /// Location of the failing term; malformed input has none.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self {
            QueryError::Malformed(_) => None,
            QueryError::BadQuery(e) => Some(&e.backtrace),
            QueryError::Runtime(e) => Some(&e.backtrace),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            QueryError::Malformed(e) => &e.message,
            QueryError::BadQuery(e) => &e.message,
            QueryError::Runtime(e) => &e.message,
        }
    }
}

impl serde::Serialize for QueryError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("QueryError", 3)?;
        state.serialize_field("category", &self.category())?;
        state.serialize_field("message", self.message())?;
        state.serialize_field("backtrace", &self.backtrace())?;
        state.end()
    }
}

/// Failures reported by the namespace layer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("Table '{0}' not found")]
    TableNotFound(String),

    #[error("Document with key {0} already exists")]
    DocumentConflict(String),

    #[error("Document is missing primary key '{0}'")]
    MissingPrimaryKey(String),

    #[error("Shard unavailable: {0}")]
    Unavailable(String),

    #[error("Read interrupted")]
    Interrupted,
}

/// Failures reported by the external-function pool.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScriptError {
    #[error("Script compilation failed: {0}")]
    Compile(String),

    #[error("Script execution failed: {0}")]
    Execution(String),

    #[error("Script value conversion failed: {0}")]
    Conversion(String),

    #[error("Script interrupted")]
    Interrupted,

    #[error("Script pool error: {0}")]
    Pool(String),
}

pub type QueryResult<T> = Result<T, QueryError>;
pub type CheckResult<T> = Result<T, QueryError>;
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Attach a backtrace to a collaborator error.
pub trait WithBacktrace<T> {
    fn at(self, backtrace: &Backtrace) -> RuntimeResult<T>;
}

impl<T, E: std::fmt::Display> WithBacktrace<T> for Result<T, E> {
    fn at(self, backtrace: &Backtrace) -> RuntimeResult<T> {
        self.map_err(|e| RuntimeError::new(e.to_string(), backtrace))
    }
}
