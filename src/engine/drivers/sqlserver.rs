//! SQL Server Driver
//!
//! Implements the DataEngine trait for Microsoft SQL Server using Tiberius
//! over a single TDS connection.
//!
//! ## Batches
//!
//! A batch is sent to the server as one unit, the way SQL Server tools do.
//! When every statement of the batch is known not to return rows the driver
//! runs it through `execute` to obtain one row count per statement; these are
//! summed by the normalizer. Otherwise the batch is streamed and every
//! result-set metadata token starts a new result, so empty selects still
//! report their columns. T-SQL needs no semicolons, so a span the parser
//! cannot read may hide a SELECT and is streamed too. Server errors carry a
//! batch line, which is mapped back to the failing statement.

use std::time::Instant;

use async_trait::async_trait;
use futures::TryStreamExt;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, QueryItem};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use crate::engine::classify::{
    returns_rows, split_statements, statement_returns_rows, statements_at_line, StatementSpan,
};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::normalize::RawResult;
use crate::engine::registry::EngineKind;
use crate::engine::traits::DataEngine;
use crate::engine::types::{ConnectionConfig, FieldInfo, Row as QRow, TableColumn, Value};

const ENGINE_NAME: &str = "Microsoft SQL Server";

type MssqlClient = Client<Compat<TcpStream>>;

/// Column metadata used to rebuild a table definition
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScriptColumn {
    name: String,
    data_type: String,
    /// `-1` stands for `MAX`
    max_length: Option<i32>,
    nullable: bool,
}

#[derive(Default)]
pub struct SqlServerDriver {
    client: Option<MssqlClient>,
}

impl SqlServerDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn boxed() -> Box<dyn DataEngine> {
        Box::new(Self::new())
    }

    fn client(&mut self) -> EngineResult<&mut MssqlClient> {
        self.client
            .as_mut()
            .ok_or_else(|| EngineError::internal("SQL Server connection is not open"))
    }

    /// Build a tiberius Config from a ConnectionConfig.
    fn build_config(config: &ConnectionConfig) -> Config {
        let mut tib_config = Config::new();
        tib_config.host(&config.host);
        tib_config.port(config.port);
        tib_config.authentication(AuthMethod::sql_server(&config.user, &config.password));
        if let Some(db) = config.database.as_deref().filter(|db| !db.is_empty()) {
            tib_config.database(db);
        }
        tib_config.encryption(if config.ssl.enabled {
            EncryptionLevel::Required
        } else {
            EncryptionLevel::NotSupported
        });
        if config.ssl.trust_server_certificate {
            tib_config.trust_cert();
        }
        tib_config
    }

    /// Runs a batch that only reports row counts.
    async fn execute_counts(client: &mut MssqlClient, sql: &str, statements: &[StatementSpan]) -> EngineResult<Vec<RawResult>> {
        let start = Instant::now();
        let result = client
            .execute(sql, &[])
            .await
            .map_err(|e| batch_error(statements, e))?;

        let elapsed = elapsed_ms(start);
        let counts = result.rows_affected();
        if counts.is_empty() {
            return Ok(vec![RawResult::mutation(0, elapsed)]);
        }
        Ok(counts
            .iter()
            .map(|count| RawResult::mutation(*count, elapsed))
            .collect())
    }

    /// Runs a batch with at least one result set, one raw result per set.
    async fn execute_result_sets(client: &mut MssqlClient, sql: &str, statements: &[StatementSpan]) -> EngineResult<Vec<RawResult>> {
        let start = Instant::now();
        let mut stream = client
            .simple_query(sql)
            .await
            .map_err(|e| batch_error(statements, e))?;

        let mut sets: Vec<(Vec<FieldInfo>, Vec<QRow>)> = Vec::new();
        while let Some(item) = stream.try_next().await.map_err(|e| batch_error(statements, e))? {
            match item {
                QueryItem::Metadata(meta) => {
                    let fields = meta
                        .columns()
                        .iter()
                        .map(|column| FieldInfo::new(column.name()))
                        .collect();
                    sets.push((fields, Vec::new()));
                }
                QueryItem::Row(row) => match sets.last_mut() {
                    Some((_, rows)) => rows.push(convert_row(&row)),
                    None => sets.push((Vec::new(), vec![convert_row(&row)])),
                },
            }
        }

        let elapsed = elapsed_ms(start);
        if sets.is_empty() {
            // The stream carries no row counts
            tracing::debug!("Batch produced no result set, affected rows unknown");
            return Ok(vec![RawResult::mutation(0, elapsed)]);
        }
        Ok(sets
            .into_iter()
            .map(|(fields, rows)| RawResult::rows(fields, rows, elapsed))
            .collect())
    }

    /// Runs a metadata query and returns its first result set
    async fn fetch_rows(&mut self, sql: &str) -> EngineResult<Vec<tiberius::Row>> {
        let client = self.client()?;
        let stream = client.simple_query(sql).await.map_err(metadata_error)?;
        stream.into_first_result().await.map_err(metadata_error)
    }

    async fn fetch_names(&mut self, sql: &str) -> EngineResult<Vec<String>> {
        let rows = self.fetch_rows(sql).await?;
        Ok(rows.iter().filter_map(|row| text_at(row, 0)).collect())
    }

    async fn fetch_definition(&mut self, sql: &str, name: &str, kind: &str) -> EngineResult<String> {
        let rows = self.fetch_rows(sql).await?;
        rows.first()
            .and_then(|row| text_at(row, 0))
            .ok_or_else(|| EngineError::metadata_failed(format!("{} {} not found", kind, name)))
    }
}

// ==================== Type Conversion ====================

/// Convert a tiberius ColumnData to our Value.
fn convert_column_data(data: &ColumnData<'_>) -> Value {
    match data {
        ColumnData::Bit(Some(b)) => Value::Bool(*b),
        ColumnData::U8(Some(v)) => Value::Int(*v as i64),
        ColumnData::I16(Some(v)) => Value::Int(*v as i64),
        ColumnData::I32(Some(v)) => Value::Int(*v as i64),
        ColumnData::I64(Some(v)) => Value::Int(*v),
        ColumnData::F32(Some(v)) => Value::Float(*v as f64),
        ColumnData::F64(Some(v)) => Value::Float(*v),
        ColumnData::Numeric(Some(n)) => Value::Text(format_numeric(n.value(), n.scale())),
        ColumnData::String(Some(s)) => Value::Text(s.to_string()),
        ColumnData::Guid(Some(g)) => Value::Text(g.to_string()),
        ColumnData::Binary(Some(b)) => Value::Bytes(b.to_vec()),
        ColumnData::Xml(Some(xml)) => Value::Text(xml.to_string()),
        _ => Value::Null,
    }
}

/// Convert a tiberius Row to our Row, reading date/time cells via chrono.
fn convert_row(row: &tiberius::Row) -> QRow {
    let cells = row
        .cells()
        .enumerate()
        .map(|(i, (column, data))| {
            let value = match data {
                ColumnData::DateTime(Some(_))
                | ColumnData::SmallDateTime(Some(_))
                | ColumnData::DateTime2(Some(_)) => row
                    .try_get::<chrono::NaiveDateTime, _>(i)
                    .ok()
                    .flatten()
                    .map(|dt| Value::Text(dt.format("%Y-%m-%d %H:%M:%S%.f").to_string()))
                    .unwrap_or(Value::Null),
                ColumnData::DateTimeOffset(Some(_)) => row
                    .try_get::<chrono::DateTime<chrono::Utc>, _>(i)
                    .ok()
                    .flatten()
                    .map(|dt| Value::Text(dt.to_rfc3339()))
                    .unwrap_or(Value::Null),
                ColumnData::Date(Some(_)) => row
                    .try_get::<chrono::NaiveDate, _>(i)
                    .ok()
                    .flatten()
                    .map(|d| Value::Text(d.format("%Y-%m-%d").to_string()))
                    .unwrap_or(Value::Null),
                ColumnData::Time(Some(_)) => row
                    .try_get::<chrono::NaiveTime, _>(i)
                    .ok()
                    .flatten()
                    .map(|t| Value::Text(t.format("%H:%M:%S%.f").to_string()))
                    .unwrap_or(Value::Null),
                _ => convert_column_data(data),
            };
            (column.name().to_string(), value)
        })
        .collect();

    QRow::from_cells(cells)
}

/// Renders an unscaled DECIMAL/NUMERIC value without losing digits
fn format_numeric(value: i128, scale: u8) -> String {
    let digits = value.unsigned_abs().to_string();
    let sign = if value < 0 { "-" } else { "" };
    let scale = scale as usize;
    if scale == 0 {
        return format!("{}{}", sign, digits);
    }

    let padded = format!("{:0>width$}", digits, width = scale + 1);
    let (int_part, frac_part) = padded.split_at(padded.len() - scale);
    format!("{}{}.{}", sign, int_part, frac_part)
}

fn text_at(row: &tiberius::Row, idx: usize) -> Option<String> {
    row.try_get::<&str, _>(idx)
        .ok()
        .flatten()
        .map(str::to_string)
}

/// Escapes a value as an N'...' literal for metadata queries
fn quote_literal(value: &str) -> String {
    format!("N'{}'", value.replace('\'', "''"))
}

/// Builds a `CREATE TABLE` script from column metadata and the primary key
fn build_table_script(table: &str, columns: &[ScriptColumn], primary_key: &[String]) -> String {
    let kind = EngineKind::SqlServer;
    let mut lines: Vec<String> = columns
        .iter()
        .map(|column| {
            let data_type = match column.max_length {
                Some(-1) => format!("{}(max)", column.data_type),
                Some(length) => format!("{}({})", column.data_type, length),
                None => column.data_type.clone(),
            };
            format!(
                "  {} {} {}",
                kind.wrap_identifier(&column.name),
                data_type,
                if column.nullable { "NULL" } else { "NOT NULL" }
            )
        })
        .collect();

    if !primary_key.is_empty() {
        let keys: Vec<String> = primary_key.iter().map(|key| kind.wrap_identifier(key)).collect();
        lines.push(format!("  PRIMARY KEY ({})", keys.join(", ")));
    }

    format!(
        "CREATE TABLE {} (\n{}\n)",
        kind.wrap_identifier(table),
        lines.join(",\n")
    )
}

/// Whether the batch has to be streamed as result sets
fn needs_result_sets(statements: &[StatementSpan]) -> bool {
    statements.iter().any(|statement| {
        statement_returns_rows(EngineKind::SqlServer, &statement.text)
            || returns_rows(EngineKind::SqlServer, &statement.text).is_err()
    })
}

/// Maps a batch failure onto the statement it happened in
fn batch_error(statements: &[StatementSpan], err: tiberius::error::Error) -> EngineError {
    match &err {
        tiberius::error::Error::Server(token) => {
            failure_at_line(statements, token.line() as u64, token.message())
        }
        _ => EngineError::query_failed(0, err.to_string()),
    }
}

/// Builds the error for a failure the server located at batch `line`.
///
/// When several statements share that line the first one is reported and
/// the message names the others.
fn failure_at_line(statements: &[StatementSpan], line: u64, message: &str) -> EngineError {
    let candidates = statements_at_line(statements, line);
    if candidates.len() > 1 {
        return EngineError::query_failed(
            candidates.start,
            format!(
                "{} (line {} holds statements {} to {})",
                message,
                line,
                candidates.start,
                candidates.end - 1
            ),
        );
    }
    EngineError::query_failed(candidates.start, message)
}

fn metadata_error(err: tiberius::error::Error) -> EngineError {
    match &err {
        tiberius::error::Error::Server(token) => EngineError::metadata_failed(token.message()),
        _ => EngineError::metadata_failed(err.to_string()),
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_micros() as f64 / 1000.0
}

// ==================== DataEngine Implementation ====================

#[async_trait]
impl DataEngine for SqlServerDriver {
    fn kind(&self) -> EngineKind {
        EngineKind::SqlServer
    }

    async fn connect(&mut self, config: &ConnectionConfig) -> EngineResult<()> {
        let tib_config = Self::build_config(config);
        let tcp = TcpStream::connect(tib_config.get_addr())
            .await
            .map_err(|e| {
                EngineError::connection_failed(
                    ENGINE_NAME,
                    format!("Failed to connect to {}:{} - {}", config.host, config.port, e),
                )
            })?;
        tcp.set_nodelay(true).ok();

        let client = Client::connect(tib_config, tcp.compat_write())
            .await
            .map_err(|e| EngineError::connection_failed(ENGINE_NAME, e.to_string()))?;

        self.client = Some(client);
        Ok(())
    }

    async fn disconnect(&mut self) -> EngineResult<()> {
        if let Some(client) = self.client.take() {
            client
                .close()
                .await
                .map_err(|e| EngineError::internal(format!("Failed to close connection: {}", e)))?;
        }
        Ok(())
    }

    async fn list_databases(&mut self) -> EngineResult<Vec<String>> {
        self.fetch_names("SELECT name FROM sys.databases ORDER BY name").await
    }

    async fn list_tables(&mut self) -> EngineResult<Vec<String>> {
        self.fetch_names(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = schema_name() AND table_type = 'BASE TABLE' \
             ORDER BY table_name",
        )
        .await
    }

    async fn list_table_columns(&mut self, table: &str) -> EngineResult<Vec<TableColumn>> {
        let sql = format!(
            "SELECT column_name, data_type FROM information_schema.columns \
             WHERE table_schema = schema_name() AND table_name = {} \
             ORDER BY ordinal_position",
            quote_literal(table)
        );
        let rows = self.fetch_rows(&sql).await?;

        Ok(rows
            .iter()
            .filter_map(|row| Some(TableColumn::new(text_at(row, 0)?, text_at(row, 1)?)))
            .collect())
    }

    async fn list_views(&mut self) -> EngineResult<Vec<String>> {
        self.fetch_names(
            "SELECT table_name FROM information_schema.views \
             WHERE table_schema = schema_name() \
             ORDER BY table_name",
        )
        .await
    }

    async fn list_routines(&mut self) -> EngineResult<Vec<String>> {
        self.fetch_names(
            "SELECT DISTINCT routine_name FROM information_schema.routines \
             WHERE routine_schema = schema_name() \
             ORDER BY routine_name",
        )
        .await
    }

    async fn list_table_triggers(&mut self, table: &str) -> EngineResult<Vec<String>> {
        let sql = format!(
            "SELECT tr.name FROM sys.triggers tr \
             JOIN sys.tables tb ON tb.object_id = tr.parent_id \
             WHERE SCHEMA_NAME(tb.schema_id) = schema_name() AND tb.name = {} \
             ORDER BY tr.name",
            quote_literal(table)
        );
        self.fetch_names(&sql).await
    }

    async fn execute(&mut self, sql: &str) -> EngineResult<Vec<RawResult>> {
        let client = self.client()?;
        let statements = split_statements(EngineKind::SqlServer, sql);
        if statements.is_empty() {
            return Ok(Vec::new());
        }

        if needs_result_sets(&statements) {
            Self::execute_result_sets(client, sql, &statements).await
        } else {
            Self::execute_counts(client, sql, &statements).await
        }
    }

    async fn table_create_script(&mut self, table: &str) -> EngineResult<String> {
        let columns_sql = format!(
            "SELECT column_name, data_type, character_maximum_length, is_nullable \
             FROM information_schema.columns \
             WHERE table_schema = schema_name() AND table_name = {} \
             ORDER BY ordinal_position",
            quote_literal(table)
        );
        let rows = self.fetch_rows(&columns_sql).await?;
        if rows.is_empty() {
            return Err(EngineError::metadata_failed(format!("Table {} not found", table)));
        }

        let columns: Vec<ScriptColumn> = rows
            .iter()
            .filter_map(|row| {
                Some(ScriptColumn {
                    name: text_at(row, 0)?,
                    data_type: text_at(row, 1)?,
                    max_length: row.try_get::<i32, _>(2).ok().flatten(),
                    nullable: text_at(row, 3).as_deref() == Some("YES"),
                })
            })
            .collect();

        let pk_sql = format!(
            "SELECT kcu.column_name \
             FROM information_schema.table_constraints tc \
             JOIN information_schema.key_column_usage kcu \
               ON kcu.constraint_name = tc.constraint_name AND kcu.table_schema = tc.table_schema \
             WHERE tc.constraint_type = 'PRIMARY KEY' \
               AND tc.table_schema = schema_name() AND tc.table_name = {} \
             ORDER BY kcu.ordinal_position",
            quote_literal(table)
        );
        let primary_key = self.fetch_names(&pk_sql).await?;

        Ok(build_table_script(table, &columns, &primary_key))
    }

    async fn view_create_script(&mut self, view: &str) -> EngineResult<String> {
        let sql = format!(
            "SELECT m.definition FROM sys.sql_modules m \
             JOIN sys.views v ON v.object_id = m.object_id \
             WHERE SCHEMA_NAME(v.schema_id) = schema_name() AND v.name = {}",
            quote_literal(view)
        );
        self.fetch_definition(&sql, view, "View").await
    }

    async fn routine_create_script(&mut self, routine: &str) -> EngineResult<String> {
        let sql = format!(
            "SELECT m.definition FROM sys.sql_modules m \
             JOIN sys.objects o ON o.object_id = m.object_id \
             WHERE SCHEMA_NAME(o.schema_id) = schema_name() AND o.name = {} \
               AND o.type IN ('P', 'FN', 'IF', 'TF')",
            quote_literal(routine)
        );
        self.fetch_definition(&sql, routine, "Routine").await
    }

    async fn current_schema(&mut self) -> EngineResult<String> {
        let rows = self.fetch_rows("SELECT schema_name()").await?;
        rows.first()
            .and_then(|row| text_at(row, 0))
            .ok_or_else(|| EngineError::metadata_failed("No default schema for this login"))
    }
}

// ==================== Tests ====================
