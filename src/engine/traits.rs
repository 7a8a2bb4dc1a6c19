//! DataEngine trait definition
//!
//! This is the contract every engine adapter implements. One adapter value
//! owns exactly one native connection; `ConnectionSession` serializes access
//! to it and takes care of lifecycle state, timeouts and normalization.

use async_trait::async_trait;

use crate::engine::error::EngineResult;
use crate::engine::normalize::RawResult;
use crate::engine::registry::{EngineKind, UNSUPPORTED_SCRIPT};
use crate::engine::types::{ConnectionConfig, TableColumn};

/// Result of truncating one table
#[derive(Debug)]
pub struct TableTruncation {
    pub table: String,
    pub result: EngineResult<()>,
}

/// Core trait that all engine adapters implement
///
/// Methods are only called by the owning session, one at a time, and only
/// while the session is connected (except `connect`/`disconnect`).
/// Introspection methods an engine has no concept for keep their default
/// implementations, which the registry advertises as stubs.
#[async_trait]
pub trait DataEngine: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Opens the native connection described by `config`.
    ///
    /// On error the adapter must not keep a partially opened handle.
    async fn connect(&mut self, config: &ConnectionConfig) -> EngineResult<()>;

    /// Closes the native connection. The handle is released even when the
    /// close itself fails.
    async fn disconnect(&mut self) -> EngineResult<()>;

    async fn list_databases(&mut self) -> EngineResult<Vec<String>>;

    /// Base tables of the current schema (or collections of the bucket)
    async fn list_tables(&mut self) -> EngineResult<Vec<String>>;

    async fn list_table_columns(&mut self, table: &str) -> EngineResult<Vec<TableColumn>> {
        let _ = table;
        Ok(Vec::new())
    }

    async fn list_views(&mut self) -> EngineResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn list_routines(&mut self) -> EngineResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn list_table_triggers(&mut self, table: &str) -> EngineResult<Vec<String>> {
        let _ = table;
        Ok(Vec::new())
    }

    /// Runs a batch and reports what the native client returned, in order.
    ///
    /// A failing statement aborts the batch with a `QueryError` carrying its
    /// index; results of earlier statements are discarded.
    async fn execute(&mut self, sql: &str) -> EngineResult<Vec<RawResult>>;

    async fn table_create_script(&mut self, table: &str) -> EngineResult<String> {
        let _ = table;
        Ok(UNSUPPORTED_SCRIPT.to_string())
    }

    async fn view_create_script(&mut self, view: &str) -> EngineResult<String> {
        let _ = view;
        Ok(UNSUPPORTED_SCRIPT.to_string())
    }

    async fn routine_create_script(&mut self, routine: &str) -> EngineResult<String> {
        let _ = routine;
        Ok(UNSUPPORTED_SCRIPT.to_string())
    }

    /// Schema (or bucket) unqualified names are resolved against
    async fn current_schema(&mut self) -> EngineResult<String>;

    /// Empties `tables` of `schema`, reporting every table's outcome.
    ///
    /// `concurrency` is already clamped to the engine's limit. The default
    /// runs one statement at a time on the single connection.
    async fn truncate_tables(
        &mut self,
        schema: &str,
        tables: &[String],
        concurrency: usize,
    ) -> EngineResult<Vec<TableTruncation>> {
        let _ = concurrency;
        Ok(truncate_sequentially(self, schema, tables).await)
    }
}

/// Truncates tables one after another through `DataEngine::execute`.
pub async fn truncate_sequentially<E>(
    engine: &mut E,
    schema: &str,
    tables: &[String],
) -> Vec<TableTruncation>
where
    E: DataEngine + ?Sized,
{
    let kind = engine.kind();
    let mut outcomes = Vec::with_capacity(tables.len());
    for table in tables {
        let statement = kind.truncate_statement(schema, table);
        let result = engine.execute(&statement).await.map(|_| ());
        if let Err(err) = &result {
            tracing::warn!(table = %table, error = %err, "Truncate failed");
        }
        outcomes.push(TableTruncation {
            table: table.clone(),
            result,
        });
    }
    outcomes
}
