//! MySQL Driver
//!
//! Implements the DataEngine trait for MySQL and MariaDB using a single SQLx
//! connection. Statements that the binary protocol cannot prepare (some
//! SHOW/SET variants, routine DDL) fall back to the text protocol and the
//! parser-based classification.

use std::time::Instant;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlRow, MySqlSslMode};
use sqlx::{Column, ConnectOptions, Connection, Executor, Row, Statement};
use tracing::warn;

use crate::engine::classify::{split_statements, statement_returns_rows};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::normalize::RawResult;
use crate::engine::registry::EngineKind;
use crate::engine::traits::{truncate_sequentially, DataEngine, TableTruncation};
use crate::engine::types::{ConnectionConfig, FieldInfo, Row as QRow, TableColumn, Value};

const ENGINE_NAME: &str = "MySQL";

/// MySQL driver implementation
#[derive(Default)]
pub struct MySqlDriver {
    conn: Option<MySqlConnection>,
}

impl MySqlDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn boxed() -> Box<dyn DataEngine> {
        Box::new(Self::new())
    }

    fn conn(&mut self) -> EngineResult<&mut MySqlConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| EngineError::internal("MySQL connection is not open"))
    }

    fn connect_options(config: &ConnectionConfig) -> MySqlConnectOptions {
        let ssl_mode = if config.ssl.enabled {
            MySqlSslMode::Required
        } else {
            MySqlSslMode::Disabled
        };

        let options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .ssl_mode(ssl_mode);

        match config.database.as_deref() {
            Some(database) => options.database(database),
            None => options,
        }
    }

    async fn run_statement(conn: &mut MySqlConnection, sql: &str) -> EngineResult<RawResult> {
        let start = Instant::now();

        let described = match Executor::prepare(&mut *conn, sql).await {
            Ok(statement) => Some(
                statement
                    .columns()
                    .iter()
                    .map(|column| FieldInfo::new(column.name()))
                    .collect::<Vec<_>>(),
            ),
            Err(sqlx::Error::Database(err)) => {
                tracing::debug!(error = %err.message(), "Statement not preparable, using text protocol");
                None
            }
            Err(err) => return Err(query_error(err)),
        };

        match described {
            Some(fields) if fields.is_empty() => {
                let done = sqlx::query(sql).execute(&mut *conn).await.map_err(query_error)?;
                Ok(RawResult::mutation(done.rows_affected(), elapsed_ms(start)))
            }
            Some(fields) => {
                let rows: Vec<MySqlRow> =
                    sqlx::query(sql).fetch_all(&mut *conn).await.map_err(query_error)?;
                let rows = rows.iter().map(Self::convert_row).collect();
                Ok(RawResult::rows(fields, rows, elapsed_ms(start)))
            }
            None if statement_returns_rows(EngineKind::MySql, sql) => {
                let rows: Vec<MySqlRow> =
                    Executor::fetch_all(&mut *conn, sqlx::raw_sql(sql)).await.map_err(query_error)?;
                let rows = rows.iter().map(Self::convert_row).collect();
                Ok(RawResult::rows(Vec::new(), rows, elapsed_ms(start)))
            }
            None => {
                let done = Executor::execute(&mut *conn, sqlx::raw_sql(sql)).await.map_err(query_error)?;
                Ok(RawResult::mutation(done.rows_affected(), elapsed_ms(start)))
            }
        }
    }

    /// Converts a SQLx row to our universal Row type
    fn convert_row(mysql_row: &MySqlRow) -> QRow {
        QRow::from_cells(
            mysql_row
                .columns()
                .iter()
                .map(|col| (col.name().to_string(), Self::extract_value(mysql_row, col.ordinal())))
                .collect(),
        )
    }

    /// Extracts a value from a MySqlRow at the given index
    fn extract_value(row: &MySqlRow, idx: usize) -> Value {
        // u64 first for BIGINT UNSIGNED columns
        if let Ok(v) = row.try_get::<Option<u64>, _>(idx) {
            return v.map(unsigned_value).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(Value::Int).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<u32>, _>(idx) {
            return v.map(|u| Value::Int(u as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<u16>, _>(idx) {
            return v.map(|u| Value::Int(u as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i8>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<u8>, _>(idx) {
            return v.map(|u| Value::Int(u as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
            return v.map(Value::Bool).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
            return v.map(Value::Float).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
            return v.map(|f| Value::Float(f as f64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<Decimal>, _>(idx) {
            return v.map(|d| Value::Text(d.to_string())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            return v.map(Value::Text).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx) {
            return v.map(|dt| Value::Text(dt.to_rfc3339())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
            return v
                .map(|dt| Value::Text(dt.format("%Y-%m-%d %H:%M:%S").to_string()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(idx) {
            return v
                .map(|d| Value::Text(d.format("%Y-%m-%d").to_string()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveTime>, _>(idx) {
            return v
                .map(|t| Value::Text(t.format("%H:%M:%S").to_string()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return v.map(Value::Bytes).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<serde_json::Value>, _>(idx) {
            return v.map(Value::Json).unwrap_or(Value::Null);
        }

        Value::Null
    }

    async fn fetch_names(&mut self, sql: &str, bind: Option<&str>) -> EngineResult<Vec<String>> {
        let conn = self.conn()?;
        let mut query = sqlx::query_scalar::<_, String>(sql);
        if let Some(value) = bind {
            query = query.bind(value.to_string());
        }
        query.fetch_all(conn).await.map_err(query_error)
    }

    /// Runs a `SHOW CREATE ...` statement and reads the named script column
    async fn show_create(&mut self, object: &str, name: &str, column: &str) -> EngineResult<String> {
        let sql = format!(
            "SHOW CREATE {} {}",
            object,
            EngineKind::MySql.wrap_identifier(name)
        );
        let conn = self.conn()?;
        let row: MySqlRow = Executor::fetch_one(conn, sqlx::raw_sql(&sql))
            .await
            .map_err(query_error)?;

        // Some server versions report the script with a binary collation
        if let Ok(script) = row.try_get::<String, _>(column) {
            return Ok(script);
        }
        row.try_get::<Vec<u8>, _>(column)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .map_err(query_error)
    }

    async fn set_foreign_key_checks(&mut self, enabled: bool) -> EngineResult<()> {
        let sql = format!("SET FOREIGN_KEY_CHECKS = {}", u8::from(enabled));
        let conn = self.conn()?;
        Executor::execute(conn, sqlx::raw_sql(&sql)).await.map_err(query_error)?;
        Ok(())
    }
}

fn query_error(err: sqlx::Error) -> EngineError {
    let message = match err.as_database_error() {
        Some(db_err) => db_err.message().to_string(),
        None => err.to_string(),
    };
    EngineError::metadata_failed(message)
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_micros() as f64 / 1000.0
}

#[async_trait]
impl DataEngine for MySqlDriver {
    fn kind(&self) -> EngineKind {
        EngineKind::MySql
    }

    async fn connect(&mut self, config: &ConnectionConfig) -> EngineResult<()> {
        let conn = Self::connect_options(config)
            .connect()
            .await
            .map_err(|e| EngineError::connection_failed(ENGINE_NAME, e.to_string()))?;

        self.conn = Some(conn);
        Ok(())
    }

    async fn disconnect(&mut self) -> EngineResult<()> {
        if let Some(conn) = self.conn.take() {
            conn.close()
                .await
                .map_err(|e| EngineError::internal(format!("Failed to close connection: {}", e)))?;
        }
        Ok(())
    }

    async fn list_databases(&mut self) -> EngineResult<Vec<String>> {
        self.fetch_names(
            r#"
            SELECT CAST(schema_name AS CHAR)
            FROM information_schema.schemata
            ORDER BY schema_name
            "#,
            None,
        )
        .await
    }

    async fn list_tables(&mut self) -> EngineResult<Vec<String>> {
        // Cast to CHAR to avoid BINARY type mismatch with Rust String
        self.fetch_names(
            r#"
            SELECT CAST(table_name AS CHAR)
            FROM information_schema.tables
            WHERE table_schema = database()
              AND table_type = 'BASE TABLE'
            ORDER BY table_name
            "#,
            None,
        )
        .await
    }

    async fn list_table_columns(&mut self, table: &str) -> EngineResult<Vec<TableColumn>> {
        let conn = self.conn()?;
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT
                CAST(column_name AS CHAR) AS column_name,
                CAST(data_type AS CHAR) AS data_type
            FROM information_schema.columns
            WHERE table_schema = database()
              AND table_name = ?
            ORDER BY ordinal_position
            "#,
        )
        .bind(table)
        .fetch_all(conn)
        .await
        .map_err(query_error)?;

        Ok(rows
            .into_iter()
            .map(|(name, data_type)| TableColumn::new(name, data_type))
            .collect())
    }

    async fn list_views(&mut self) -> EngineResult<Vec<String>> {
        self.fetch_names(
            r#"
            SELECT CAST(table_name AS CHAR)
            FROM information_schema.views
            WHERE table_schema = database()
            ORDER BY table_name
            "#,
            None,
        )
        .await
    }

    async fn list_routines(&mut self) -> EngineResult<Vec<String>> {
        self.fetch_names(
            r#"
            SELECT DISTINCT CAST(routine_name AS CHAR)
            FROM information_schema.routines
            WHERE routine_schema = database()
            ORDER BY 1
            "#,
            None,
        )
        .await
    }

    async fn list_table_triggers(&mut self, table: &str) -> EngineResult<Vec<String>> {
        self.fetch_names(
            r#"
            SELECT DISTINCT CAST(trigger_name AS CHAR)
            FROM information_schema.triggers
            WHERE event_object_schema = database()
              AND event_object_table = ?
            ORDER BY 1
            "#,
            Some(table),
        )
        .await
    }

    async fn execute(&mut self, sql: &str) -> EngineResult<Vec<RawResult>> {
        let conn = self.conn()?;
        let statements = split_statements(EngineKind::MySql, sql);

        let mut results = Vec::with_capacity(statements.len());
        for (index, statement) in statements.iter().enumerate() {
            let result = Self::run_statement(conn, &statement.text)
                .await
                .map_err(|e| e.at_statement(index))?;
            results.push(result);
        }
        Ok(results)
    }

    async fn table_create_script(&mut self, table: &str) -> EngineResult<String> {
        self.show_create("TABLE", table, "Create Table").await
    }

    async fn view_create_script(&mut self, view: &str) -> EngineResult<String> {
        self.show_create("VIEW", view, "Create View").await
    }

    async fn routine_create_script(&mut self, routine: &str) -> EngineResult<String> {
        let conn = self.conn()?;
        let routine_type: Option<String> = sqlx::query_scalar(
            r#"
            SELECT CAST(routine_type AS CHAR)
            FROM information_schema.routines
            WHERE routine_schema = database()
              AND routine_name = ?
            LIMIT 1
            "#,
        )
        .bind(routine)
        .fetch_optional(conn)
        .await
        .map_err(query_error)?;

        match routine_type.as_deref() {
            Some("FUNCTION") => self.show_create("FUNCTION", routine, "Create Function").await,
            Some(_) => self.show_create("PROCEDURE", routine, "Create Procedure").await,
            None => Err(EngineError::metadata_failed(format!("Routine {} not found", routine))),
        }
    }

    async fn current_schema(&mut self) -> EngineResult<String> {
        let conn = self.conn()?;
        let schema: Option<String> = sqlx::query_scalar("SELECT CAST(database() AS CHAR)")
            .fetch_one(conn)
            .await
            .map_err(query_error)?;

        schema.ok_or_else(|| EngineError::metadata_failed("No database selected"))
    }

    /// Foreign-key checks are off while tables are emptied, so referenced
    /// tables can be truncated in any order.
    async fn truncate_tables(
        &mut self,
        schema: &str,
        tables: &[String],
        _concurrency: usize,
    ) -> EngineResult<Vec<TableTruncation>> {
        self.set_foreign_key_checks(false).await?;
        let outcomes = truncate_sequentially(self, schema, tables).await;
        if let Err(err) = self.set_foreign_key_checks(true).await {
            warn!(error = %err, "Failed to re-enable foreign key checks");
        }
        Ok(outcomes)
    }
}

/// BIGINT UNSIGNED values above `i64::MAX` keep their digits as text
fn unsigned_value(value: u64) -> Value {
    i64::try_from(value)
        .map(Value::Int)
        .unwrap_or_else(|_| Value::Text(value.to_string()))
}
