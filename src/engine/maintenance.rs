//! Maintenance operations built on top of introspection and execution.

use tracing::info;

use crate::engine::error::{EngineError, EngineResult, TableFailure};
use crate::engine::traits::{DataEngine, TableTruncation};

/// Empties every base table of the engine's current schema.
///
/// Returns the truncated tables, or a `TruncateError` listing both the
/// tables that were emptied and the ones that failed. Tables already
/// emptied are not restored on failure.
pub async fn truncate_all_tables(
    engine: &mut dyn DataEngine,
    concurrency: usize,
) -> EngineResult<Vec<String>> {
    let schema = engine.current_schema().await?;
    let tables = engine.list_tables().await?;
    if tables.is_empty() {
        return Ok(Vec::new());
    }

    info!(schema = %schema, tables = tables.len(), concurrency, "Truncating tables");
    let outcomes = engine.truncate_tables(&schema, &tables, concurrency).await?;
    collect_outcomes(outcomes)
}

fn collect_outcomes(outcomes: Vec<TableTruncation>) -> EngineResult<Vec<String>> {
    let mut succeeded = Vec::new();
    let mut failed = Vec::new();

    for outcome in outcomes {
        match outcome.result {
            Ok(()) => succeeded.push(outcome.table),
            Err(err) => failed.push(TableFailure {
                table: outcome.table,
                message: err.to_string(),
            }),
        }
    }

    if failed.is_empty() {
        Ok(succeeded)
    } else {
        Err(EngineError::TruncateError { succeeded, failed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(table: &str, result: EngineResult<()>) -> TableTruncation {
        TableTruncation {
            table: table.to_string(),
            result,
        }
    }

    #[test]
    fn all_successes_return_table_names() {
        let tables = collect_outcomes(vec![outcome("roles", Ok(())), outcome("users", Ok(()))])
            .expect("no failures");
        assert_eq!(tables, vec!["roles", "users"]);
    }

    #[test]
    fn any_failure_reports_both_lists() {
        let err = collect_outcomes(vec![
            outcome("roles", Ok(())),
            outcome("users", Err(EngineError::query_failed(0, "locked"))),
        ])
        .expect_err("one table failed");

        match err {
            EngineError::TruncateError { succeeded, failed } => {
                assert_eq!(succeeded, vec!["roles"]);
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].table, "users");
                assert_eq!(failed[0].message, "Statement 0 failed: locked");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
