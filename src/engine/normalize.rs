//! Result normalization
//!
//! Drivers report what their native client returned as `RawResult`s; this
//! module turns them into the one `QueryResult` shape callers see, applying
//! the engine's documented count semantics.

use crate::engine::registry::{CountSemantics, EngineDescriptor};
use crate::engine::types::{FieldInfo, QueryResult, Row};

/// What the native client reported for one statement (or one result set)
#[derive(Debug, Clone, PartialEq)]
pub enum RawOutcome {
    /// A row-returning statement. `fields` may be empty when the client
    /// gave no column metadata.
    Rows { fields: Vec<FieldInfo>, rows: Vec<Row> },
    /// A statement that only reports a mutation count
    Mutation { affected_rows: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawResult {
    pub outcome: RawOutcome,
    pub execution_time_ms: f64,
}

impl RawResult {
    pub fn rows(fields: Vec<FieldInfo>, rows: Vec<Row>, execution_time_ms: f64) -> Self {
        Self {
            outcome: RawOutcome::Rows { fields, rows },
            execution_time_ms,
        }
    }

    pub fn mutation(affected_rows: u64, execution_time_ms: f64) -> Self {
        Self {
            outcome: RawOutcome::Mutation { affected_rows },
            execution_time_ms,
        }
    }
}

/// Normalizes raw driver output for an engine, preserving statement order.
pub fn normalize(descriptor: &EngineDescriptor, raw: Vec<RawResult>) -> Vec<QueryResult> {
    match descriptor.count_semantics {
        CountSemantics::PerStatement => raw
            .into_iter()
            .map(|result| normalize_one(descriptor, result, None))
            .collect(),
        CountSemantics::AggregatedMutations => normalize_aggregated(descriptor, raw),
    }
}

/// A batch with at least one result set reports only its result sets (the
/// native client drops counts of statements in between). A batch without any
/// collapses into one mutation result.
fn normalize_aggregated(descriptor: &EngineDescriptor, raw: Vec<RawResult>) -> Vec<QueryResult> {
    let has_result_sets = raw
        .iter()
        .any(|result| matches!(result.outcome, RawOutcome::Rows { .. }));

    if has_result_sets {
        return raw
            .into_iter()
            .filter(|result| matches!(result.outcome, RawOutcome::Rows { .. }))
            .map(|result| normalize_one(descriptor, result, Some(0)))
            .collect();
    }

    if raw.is_empty() {
        return Vec::new();
    }

    let execution_time_ms = raw
        .iter()
        .map(|result| result.execution_time_ms)
        .fold(0.0, f64::max);
    let affected_rows = raw
        .iter()
        .map(|result| match result.outcome {
            RawOutcome::Mutation { affected_rows } => affected_rows,
            RawOutcome::Rows { .. } => 0,
        })
        .sum();

    vec![normalize_one(
        descriptor,
        RawResult::mutation(affected_rows, execution_time_ms),
        Some(0),
    )]
}

/// `mutation_row_count` is the neutral `row_count` reported for non-selects
/// by engines that cannot leave it unset.
fn normalize_one(
    descriptor: &EngineDescriptor,
    result: RawResult,
    mutation_row_count: Option<u64>,
) -> QueryResult {
    match result.outcome {
        RawOutcome::Rows { fields, rows } => {
            let fields = project_fields(descriptor, fields, &rows);
            QueryResult {
                is_select: true,
                row_count: Some(rows.len() as u64),
                affected_rows: None,
                fields,
                rows,
                execution_time_ms: result.execution_time_ms,
            }
        }
        RawOutcome::Mutation { affected_rows } => QueryResult {
            is_select: false,
            rows: Vec::new(),
            fields: Vec::new(),
            row_count: mutation_row_count,
            affected_rows: Some(affected_rows),
            execution_time_ms: result.execution_time_ms,
        },
    }
}

fn project_fields(descriptor: &EngineDescriptor, fields: Vec<FieldInfo>, rows: &[Row]) -> Vec<FieldInfo> {
    if rows.is_empty() && !descriptor.fields_on_empty_result {
        return Vec::new();
    }
    if !fields.is_empty() {
        return fields;
    }
    rows.first()
        .map(|row| row.columns().map(FieldInfo::new).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::registry::find_descriptor;
    use crate::engine::types::Value;

    fn descriptor(key: &str) -> &'static EngineDescriptor {
        find_descriptor(key).expect("builtin engine")
    }

    fn user_row() -> Row {
        Row::from_cells(vec![
            ("id".into(), Value::Int(1)),
            ("username".into(), Value::Text("maxcnunes".into())),
        ])
    }

    fn user_fields() -> Vec<FieldInfo> {
        vec![FieldInfo::new("id"), FieldInfo::new("username")]
    }

    #[test]
    fn empty_select_keeps_described_fields() {
        let results = normalize(
            descriptor("postgresql"),
            vec![RawResult::rows(user_fields(), Vec::new(), 0.4)],
        );

        assert_eq!(results.len(), 1);
        let result = &results[0];
        assert!(result.is_select);
        assert!(result.rows.is_empty());
        assert_eq!(result.row_count, Some(0));
        assert_eq!(result.affected_rows, None);
        assert_eq!(result.fields, user_fields());
    }

    #[test]
    fn engines_without_empty_metadata_report_no_fields() {
        let results = normalize(
            descriptor("couchbase"),
            vec![RawResult::rows(user_fields(), Vec::new(), 1.0)],
        );
        assert!(results[0].fields.is_empty());
        assert_eq!(results[0].row_count, Some(0));
    }

    #[test]
    fn fields_fall_back_to_first_row_columns() {
        let results = normalize(
            descriptor("couchbase"),
            vec![RawResult::rows(Vec::new(), vec![user_row()], 1.0)],
        );
        assert_eq!(results[0].fields, user_fields());
        assert_eq!(results[0].row_count, Some(1));
    }

    #[test]
    fn per_statement_mutations_keep_order_and_counts() {
        let results = normalize(
            descriptor("mysql"),
            vec![
                RawResult::mutation(1, 0.1),
                RawResult::rows(user_fields(), vec![user_row()], 0.2),
                RawResult::mutation(3, 0.3),
            ],
        );

        assert_eq!(results.len(), 3);
        assert!(!results[0].is_select);
        assert_eq!(results[0].affected_rows, Some(1));
        assert_eq!(results[0].row_count, None);
        assert!(results[0].fields.is_empty());
        assert!(results[1].is_select);
        assert_eq!(results[1].rows, vec![user_row()]);
        assert_eq!(results[2].affected_rows, Some(3));
    }

    #[test]
    fn sqlserver_collapses_mutation_batches() {
        let results = normalize(
            descriptor("sqlserver"),
            vec![RawResult::mutation(1, 0.5), RawResult::mutation(1, 0.5)],
        );

        assert_eq!(results.len(), 1);
        let result = &results[0];
        assert!(!result.is_select);
        assert!(result.rows.is_empty());
        assert!(result.fields.is_empty());
        assert_eq!(result.row_count, Some(0));
        assert_eq!(result.affected_rows, Some(2));
    }

    #[test]
    fn sqlserver_single_insert_reports_neutral_row_count() {
        let results = normalize(descriptor("sqlserver"), vec![RawResult::mutation(1, 0.5)]);
        assert_eq!(results[0].affected_rows, Some(1));
        assert_eq!(results[0].row_count, Some(0));
    }

    #[test]
    fn sqlserver_batches_with_result_sets_report_only_those() {
        let results = normalize(
            descriptor("sqlserver"),
            vec![
                RawResult::rows(user_fields(), vec![user_row()], 1.0),
                RawResult::rows(vec![FieldInfo::new("name")], Vec::new(), 1.0),
            ],
        );

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_select && r.affected_rows.is_none()));
        assert_eq!(results[1].fields, vec![FieldInfo::new("name")]);
    }

    #[test]
    fn sqlserver_mixed_batches_drop_the_mutations() {
        let results = normalize(
            descriptor("sqlserver"),
            vec![
                RawResult::mutation(1, 0.2),
                RawResult::rows(user_fields(), vec![user_row()], 0.8),
            ],
        );

        assert_eq!(results.len(), 1);
        assert!(results[0].is_select);
        assert_eq!(results[0].rows, vec![user_row()]);
        assert_eq!(results[0].row_count, Some(1));
    }

    #[test]
    fn empty_batch_yields_no_results() {
        assert!(normalize(descriptor("sqlserver"), Vec::new()).is_empty());
        assert!(normalize(descriptor("postgresql"), Vec::new()).is_empty());
    }
}
