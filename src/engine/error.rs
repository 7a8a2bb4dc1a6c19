//! Engine error types
//!
//! Every failure coming out of a native driver is wrapped into one of these
//! variants with enough context (engine, statement index, table) to be
//! diagnosed without looking at session internals.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::engine::types::SessionState;

pub type EngineResult<T> = Result<T, EngineError>;

/// Outcome of a single failed table during `truncate_all_tables`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableFailure {
    pub table: String,
    pub message: String,
}

impl fmt::Display for TableFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.table, self.message)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Unsupported engine: {key}")]
    UnsupportedEngine { key: String },

    #[error("Connection to {engine} failed: {message}")]
    ConnectionError { engine: &'static str, message: String },

    #[error("Session is not connected (state: {state})")]
    NotConnected { state: SessionState },

    #[error("Statement {index} failed: {message}")]
    QueryError { index: usize, message: String },

    #[error(
        "Truncate failed for {} table(s): {}",
        failed.len(),
        failed.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
    )]
    TruncateError {
        succeeded: Vec<String>,
        failed: Vec<TableFailure>,
    },

    /// Reserved for adapters that reject an operation outright. The built-in
    /// engines answer unsupported introspection with empty lists or the
    /// create-script marker instead, so none of them return it.
    #[error("{feature} is not supported by {engine}")]
    UnsupportedFeature {
        engine: &'static str,
        feature: &'static str,
    },

    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn unsupported_engine(key: impl Into<String>) -> Self {
        Self::UnsupportedEngine { key: key.into() }
    }

    pub fn connection_failed(engine: &'static str, message: impl Into<String>) -> Self {
        Self::ConnectionError {
            engine,
            message: message.into(),
        }
    }

    pub fn not_connected(state: SessionState) -> Self {
        Self::NotConnected { state }
    }

    pub fn query_failed(index: usize, message: impl Into<String>) -> Self {
        Self::QueryError {
            index,
            message: message.into(),
        }
    }

    /// Metadata queries are single statements, so they always fail at index 0.
    pub fn metadata_failed(message: impl Into<String>) -> Self {
        Self::query_failed(0, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Shifts the statement index of a `QueryError` by `offset`.
    ///
    /// Drivers that execute statements one at a time report every failure
    /// at index 0; the executor rebases it onto the batch position.
    pub fn at_statement(self, offset: usize) -> Self {
        match self {
            Self::QueryError { index, message } => Self::QueryError {
                index: index + offset,
                message,
            },
            other => other,
        }
    }
}
