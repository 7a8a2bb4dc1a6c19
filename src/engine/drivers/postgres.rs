//! PostgreSQL Driver
//!
//! Implements the DataEngine trait for PostgreSQL using a single SQLx
//! connection. Statements are prepared before they run, so the described
//! column list (not the returned rows) decides whether a statement is a
//! select and an empty result still carries its fields.

use std::time::Instant;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow, PgSslMode};
use sqlx::{Column, ConnectOptions, Connection, Executor, Row, Statement};

use crate::engine::classify::split_statements;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::normalize::RawResult;
use crate::engine::registry::EngineKind;
use crate::engine::traits::DataEngine;
use crate::engine::types::{ConnectionConfig, FieldInfo, Row as QRow, TableColumn, Value};

const ENGINE_NAME: &str = "PostgreSQL";

const TABLE_SCRIPT_SQL: &str = r#"
    SELECT 'CREATE TABLE ' || quote_ident(c.relname) || ' (' || E'\n' ||
        array_to_string(
            array(
                SELECT '  ' || quote_ident(a.attname) || ' ' || format_type(a.atttypid, a.atttypmod)
                    || CASE WHEN a.attnotnull THEN ' NOT NULL' ELSE '' END
                    || COALESCE(' DEFAULT ' || pg_get_expr(d.adbin, d.adrelid), '')
                FROM pg_attribute a
                LEFT JOIN pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
                WHERE a.attrelid = c.oid AND a.attnum > 0 AND NOT a.attisdropped
                ORDER BY a.attnum
            ) || array(
                SELECT '  CONSTRAINT ' || quote_ident(con.conname) || ' ' || pg_get_constraintdef(con.oid)
                FROM pg_constraint con
                WHERE con.conrelid = c.oid
                ORDER BY con.conname
            ),
            ',' || E'\n'
        ) || E'\n);'
    FROM pg_class c
    JOIN pg_namespace n ON n.oid = c.relnamespace
    WHERE n.nspname = current_schema() AND c.relname = $1 AND c.relkind IN ('r', 'p')
"#;

/// PostgreSQL driver implementation
#[derive(Default)]
pub struct PostgresDriver {
    conn: Option<PgConnection>,
}

impl PostgresDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn boxed() -> Box<dyn DataEngine> {
        Box::new(Self::new())
    }

    fn conn(&mut self) -> EngineResult<&mut PgConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| EngineError::internal("PostgreSQL connection is not open"))
    }

    fn connect_options(config: &ConnectionConfig) -> PgConnectOptions {
        let ssl_mode = if config.ssl.enabled {
            PgSslMode::Require
        } else {
            PgSslMode::Disable
        };

        PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(config.database.as_deref().unwrap_or("postgres"))
            .ssl_mode(ssl_mode)
    }

    /// Runs one statement, described first so its columns are known
    async fn run_statement(conn: &mut PgConnection, sql: &str) -> EngineResult<RawResult> {
        let start = Instant::now();

        let fields: Vec<FieldInfo> = Executor::prepare(&mut *conn, sql)
            .await
            .map_err(query_error)?
            .columns()
            .iter()
            .map(|column| FieldInfo::new(column.name()))
            .collect();

        if fields.is_empty() {
            let done = sqlx::query(sql).execute(&mut *conn).await.map_err(query_error)?;
            return Ok(RawResult::mutation(done.rows_affected(), elapsed_ms(start)));
        }

        let rows: Vec<PgRow> = sqlx::query(sql).fetch_all(&mut *conn).await.map_err(query_error)?;
        let rows = rows.iter().map(Self::convert_row).collect();
        Ok(RawResult::rows(fields, rows, elapsed_ms(start)))
    }

    /// Converts a SQLx row to our universal Row type
    fn convert_row(pg_row: &PgRow) -> QRow {
        QRow::from_cells(
            pg_row
                .columns()
                .iter()
                .map(|col| (col.name().to_string(), Self::extract_value(pg_row, col.ordinal())))
                .collect(),
        )
    }

    /// Extracts a value from a PgRow at the given index
    fn extract_value(row: &PgRow, idx: usize) -> Value {
        // Integers before bool so int columns are never read as flags
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(Value::Int).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
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
        // NUMERIC keeps its exact digits
        if let Ok(v) = row.try_get::<Option<Decimal>, _>(idx) {
            return v.map(|d| Value::Text(d.to_string())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            return v.map(Value::Text).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<uuid::Uuid>, _>(idx) {
            return v.map(|u| Value::Text(u.to_string())).unwrap_or(Value::Null);
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

    async fn fetch_script(&mut self, sql: &str, name: &str, kind: &str) -> EngineResult<String> {
        let conn = self.conn()?;
        let script: Option<Option<String>> = sqlx::query_scalar(sql)
            .bind(name)
            .fetch_optional(conn)
            .await
            .map_err(query_error)?;

        script
            .flatten()
            .ok_or_else(|| EngineError::metadata_failed(format!("{} {} not found", kind, name)))
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
impl DataEngine for PostgresDriver {
    fn kind(&self) -> EngineKind {
        EngineKind::Postgres
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
            SELECT datname::text
            FROM pg_database
            WHERE datistemplate = false
            ORDER BY datname
            "#,
            None,
        )
        .await
    }

    async fn list_tables(&mut self) -> EngineResult<Vec<String>> {
        self.fetch_names(
            r#"
            SELECT table_name::text
            FROM information_schema.tables
            WHERE table_schema = current_schema()
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
            SELECT column_name::text, data_type::text
            FROM information_schema.columns
            WHERE table_schema = current_schema()
              AND table_name = $1
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
            SELECT table_name::text
            FROM information_schema.views
            WHERE table_schema = current_schema()
            ORDER BY table_name
            "#,
            None,
        )
        .await
    }

    async fn list_routines(&mut self) -> EngineResult<Vec<String>> {
        self.fetch_names(
            r#"
            SELECT DISTINCT routine_name::text
            FROM information_schema.routines
            WHERE routine_schema = current_schema()
            ORDER BY 1
            "#,
            None,
        )
        .await
    }

    async fn list_table_triggers(&mut self, table: &str) -> EngineResult<Vec<String>> {
        self.fetch_names(
            r#"
            SELECT DISTINCT trigger_name::text
            FROM information_schema.triggers
            WHERE event_object_schema = current_schema()
              AND event_object_table = $1
            ORDER BY 1
            "#,
            Some(table),
        )
        .await
    }

    async fn execute(&mut self, sql: &str) -> EngineResult<Vec<RawResult>> {
        let conn = self.conn()?;
        let statements = split_statements(EngineKind::Postgres, sql);

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
        self.fetch_script(TABLE_SCRIPT_SQL, table, "Table").await
    }

    async fn view_create_script(&mut self, view: &str) -> EngineResult<String> {
        self.fetch_script(
            r#"
            SELECT 'CREATE OR REPLACE VIEW ' || quote_ident(table_name::text) || ' AS' || E'\n' || view_definition
            FROM information_schema.views
            WHERE table_schema = current_schema()
              AND table_name = $1
            "#,
            view,
            "View",
        )
        .await
    }

    async fn routine_create_script(&mut self, routine: &str) -> EngineResult<String> {
        self.fetch_script(
            r#"
            SELECT string_agg(pg_get_functiondef(p.oid), E'\n\n' ORDER BY p.oid)
            FROM pg_proc p
            JOIN pg_namespace n ON n.oid = p.pronamespace
            WHERE n.nspname = current_schema()
              AND p.proname = $1
              AND p.prokind IN ('f', 'p')
            "#,
            routine,
            "Routine",
        )
        .await
    }

    async fn current_schema(&mut self) -> EngineResult<String> {
        let conn = self.conn()?;
        sqlx::query_scalar::<_, String>("SELECT current_schema()::text")
            .fetch_one(conn)
            .await
            .map_err(query_error)
    }
}
