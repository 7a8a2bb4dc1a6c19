//! Connection Session
//!
//! A session owns exactly one adapter (and with it one native connection)
//! and is the only way callers reach it. Operations are serialized through
//! an async mutex and each runs in its own task holding that mutex, so a
//! caller that gives up on an operation never leaves the connection in the
//! middle of a statement.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::time::{timeout, Duration};
use tracing::{info, instrument, warn};

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::maintenance;
use crate::engine::normalize::normalize;
use crate::engine::registry::EngineDescriptor;
use crate::engine::traits::DataEngine;
use crate::engine::types::{ConnectionConfig, QueryResult, SessionId, SessionState, TableColumn};
use crate::settings::ClientSettings;

type Engine = Box<dyn DataEngine>;

pub struct ConnectionSession {
    id: SessionId,
    descriptor: &'static EngineDescriptor,
    config: ConnectionConfig,
    settings: ClientSettings,
    display_name: String,
    state: Arc<RwLock<SessionState>>,
    engine: Arc<Mutex<Engine>>,
}

impl std::fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("id", &self.id)
            .field("display_name", &self.display_name)
            .finish_non_exhaustive()
    }
}

impl ConnectionSession {
    /// Wraps an unconnected adapter. Use `DriverRegistry::create_session`
    /// unless a custom adapter is needed.
    pub fn new(
        descriptor: &'static EngineDescriptor,
        config: ConnectionConfig,
        engine: Engine,
        settings: ClientSettings,
    ) -> Self {
        let display_name = format!(
            "{}@{}:{}{}",
            config.user,
            config.host,
            config.database.as_deref().unwrap_or("default"),
            if config.tunneled { " (tunnel)" } else { "" }
        );

        Self {
            id: SessionId::new(),
            descriptor,
            config,
            settings,
            display_name,
            state: Arc::new(RwLock::new(SessionState::Unconnected)),
            engine: Arc::new(Mutex::new(engine)),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn descriptor(&self) -> &'static EngineDescriptor {
        self.descriptor
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    /// Opens the native connection.
    ///
    /// A no-op on a connected session. A disconnected session cannot be
    /// reconnected; create a new one instead.
    #[instrument(
        skip(self),
        fields(
            session_id = %self.id.0,
            engine = %self.descriptor.key,
            host = %self.config.host,
            port = self.config.port,
            database = ?self.config.database,
            tunneled = self.config.tunneled
        )
    )]
    pub async fn connect(&self) -> EngineResult<()> {
        let guard = Arc::clone(&self.engine).lock_owned().await;
        {
            let mut state = self.state.write().await;
            match *state {
                SessionState::Connected => return Ok(()),
                SessionState::Disconnected => {
                    return Err(EngineError::connection_failed(
                        self.descriptor.key,
                        "session has been disconnected",
                    ))
                }
                SessionState::Unconnected | SessionState::Connecting => {
                    *state = SessionState::Connecting;
                }
            }
        }

        let config = self.config.clone();
        let state = Arc::clone(&self.state);
        let timeout_ms = self.settings.connect_timeout_ms;

        let result = run_locked(guard, move |engine| {
            Box::pin(async move {
                let result = match timeout(Duration::from_millis(timeout_ms), engine.connect(&config)).await {
                    Ok(result) => result,
                    Err(_) => Err(EngineError::Timeout { timeout_ms }),
                };

                let next = if result.is_ok() {
                    SessionState::Connected
                } else {
                    SessionState::Unconnected
                };
                *state.write().await = next;
                result
            })
        })
        .await;

        match &result {
            Ok(()) => info!(name = %self.display_name, "Session connected"),
            Err(err) => {
                warn!(error = %err, "Connect failed");
                // A panicked connect task never got to reset the state
                let mut state = self.state.write().await;
                if *state == SessionState::Connecting {
                    *state = SessionState::Unconnected;
                }
            }
        }
        result
    }

    /// Releases the native connection.
    ///
    /// Always ends `Disconnected` and is idempotent. Errors while closing
    /// are logged, never returned.
    #[instrument(skip(self), fields(session_id = %self.id.0, engine = %self.descriptor.key))]
    pub async fn disconnect(&self) -> EngineResult<()> {
        let guard = Arc::clone(&self.engine).lock_owned().await;
        let previous = *self.state.read().await;

        match previous {
            SessionState::Disconnected => return Ok(()),
            SessionState::Unconnected => {
                *self.state.write().await = SessionState::Disconnected;
                return Ok(());
            }
            SessionState::Connecting | SessionState::Connected => {}
        }

        let state = Arc::clone(&self.state);
        let result = run_locked(guard, move |engine| {
            Box::pin(async move {
                if let Err(err) = engine.disconnect().await {
                    warn!(error = %err, "Error while closing connection");
                }
                *state.write().await = SessionState::Disconnected;
                Ok(())
            })
        })
        .await;

        if let Err(err) = result {
            warn!(error = %err, "Disconnect task failed");
            *self.state.write().await = SessionState::Disconnected;
        }
        info!("Session disconnected");
        Ok(())
    }

    /// Runs a batch and returns one normalized result per statement.
    #[instrument(skip(self, sql), fields(session_id = %self.id.0, engine = %self.descriptor.key))]
    pub async fn execute_query(&self, sql: &str) -> EngineResult<Vec<QueryResult>> {
        let sql = sql.to_string();
        let descriptor = self.descriptor;

        let run = self.run_connected(move |engine| {
            Box::pin(async move {
                let raw = engine.execute(&sql).await?;
                Ok(normalize(descriptor, raw))
            })
        });

        match self.settings.query_timeout_ms {
            Some(timeout_ms) => match timeout(Duration::from_millis(timeout_ms), run).await {
                Ok(result) => result,
                Err(_) => Err(EngineError::Timeout { timeout_ms }),
            },
            None => run.await,
        }
    }

    pub async fn list_databases(&self) -> EngineResult<Vec<String>> {
        self.run_connected(|engine| engine.list_databases()).await
    }

    pub async fn list_tables(&self) -> EngineResult<Vec<String>> {
        self.run_connected(|engine| engine.list_tables()).await
    }

    pub async fn list_table_columns(&self, table: &str) -> EngineResult<Vec<TableColumn>> {
        let table = table.to_string();
        self.run_connected(move |engine| {
            Box::pin(async move { engine.list_table_columns(&table).await })
        })
        .await
    }

    pub async fn list_views(&self) -> EngineResult<Vec<String>> {
        self.run_connected(|engine| engine.list_views()).await
    }

    pub async fn list_routines(&self) -> EngineResult<Vec<String>> {
        self.run_connected(|engine| engine.list_routines()).await
    }

    pub async fn list_table_triggers(&self, table: &str) -> EngineResult<Vec<String>> {
        let table = table.to_string();
        self.run_connected(move |engine| {
            Box::pin(async move { engine.list_table_triggers(&table).await })
        })
        .await
    }

    pub async fn get_table_create_script(&self, table: &str) -> EngineResult<String> {
        let table = table.to_string();
        self.run_connected(move |engine| {
            Box::pin(async move { engine.table_create_script(&table).await })
        })
        .await
    }

    pub async fn get_view_create_script(&self, view: &str) -> EngineResult<String> {
        let view = view.to_string();
        self.run_connected(move |engine| {
            Box::pin(async move { engine.view_create_script(&view).await })
        })
        .await
    }

    pub async fn get_routine_create_script(&self, routine: &str) -> EngineResult<String> {
        let routine = routine.to_string();
        self.run_connected(move |engine| {
            Box::pin(async move { engine.routine_create_script(&routine).await })
        })
        .await
    }

    /// Schema (or bucket) the session resolves unqualified names against
    pub async fn current_schema(&self) -> EngineResult<String> {
        self.run_connected(|engine| engine.current_schema()).await
    }

    /// Empties every base table of the current schema.
    ///
    /// Returns the truncated table names.
    #[instrument(skip(self), fields(session_id = %self.id.0, engine = %self.descriptor.key))]
    pub async fn truncate_all_tables(&self) -> EngineResult<Vec<String>> {
        let concurrency = self
            .settings
            .truncate_concurrency_for(self.descriptor.max_truncate_concurrency);

        self.run_connected(move |engine| {
            Box::pin(async move { maintenance::truncate_all_tables(&mut **engine, concurrency).await })
        })
        .await
    }

    /// Quotes an identifier for this session's engine
    pub fn wrap_query(&self, identifier: &str) -> String {
        self.descriptor.kind.wrap_identifier(identifier)
    }

    /// Builds a query returning the first `limit` rows of `table`
    pub fn get_query_select_top(&self, table: &str, limit: u32) -> String {
        let database = self
            .config
            .database
            .as_deref()
            .or(self.descriptor.default_database)
            .unwrap_or_default();
        self.descriptor.kind.select_top(database, table, limit)
    }

    /// Runs `op` on the adapter once the session is connected.
    ///
    /// The state is checked after the engine lock is taken, since connect
    /// and disconnect only change it while holding that lock.
    async fn run_connected<T, F>(&self, op: F) -> EngineResult<T>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut Engine) -> BoxFuture<'a, EngineResult<T>> + Send + 'static,
    {
        let guard = Arc::clone(&self.engine).lock_owned().await;
        let state = *self.state.read().await;
        if state != SessionState::Connected {
            return Err(EngineError::not_connected(state));
        }
        run_locked(guard, op).await
    }
}

/// Runs `op` in its own task that owns the engine guard until it finishes.
async fn run_locked<T, F>(guard: OwnedMutexGuard<Engine>, op: F) -> EngineResult<T>
where
    T: Send + 'static,
    F: for<'a> FnOnce(&'a mut Engine) -> BoxFuture<'a, EngineResult<T>> + Send + 'static,
{
    let task = tokio::spawn(async move {
        let mut guard = guard;
        op(&mut *guard).await
    });

    task.await
        .map_err(|err| EngineError::internal(format!("Engine task failed: {}", err)))?
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::*;
    use crate::engine::normalize::RawResult;
    use crate::engine::registry::{find_descriptor, EngineKind};
    use crate::engine::types::{FieldInfo, Row, Value};

    #[derive(Default)]
    struct Behavior {
        fail_connect: bool,
        fail_close: bool,
        connect_delay_ms: u64,
        execute_delay_ms: u64,
        locked_tables: Vec<&'static str>,
    }

    /// In-memory adapter recording every call it receives
    struct MockEngine {
        behavior: Behavior,
        calls: Arc<StdMutex<Vec<String>>>,
        connected: bool,
    }

    impl MockEngine {
        fn new(behavior: Behavior) -> (Self, Arc<StdMutex<Vec<String>>>) {
            let calls = Arc::new(StdMutex::new(Vec::new()));
            let engine = Self {
                behavior,
                calls: Arc::clone(&calls),
                connected: false,
            };
            (engine, calls)
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }
    }

    #[async_trait]
    impl DataEngine for MockEngine {
        fn kind(&self) -> EngineKind {
            EngineKind::Postgres
        }

        async fn connect(&mut self, config: &ConnectionConfig) -> EngineResult<()> {
            tokio::time::sleep(Duration::from_millis(self.behavior.connect_delay_ms)).await;
            self.record(format!("connect {}", config.host));
            if self.behavior.fail_connect {
                return Err(EngineError::connection_failed("PostgreSQL", "password authentication failed"));
            }
            self.connected = true;
            Ok(())
        }

        async fn disconnect(&mut self) -> EngineResult<()> {
            self.record("disconnect");
            self.connected = false;
            if self.behavior.fail_close {
                return Err(EngineError::internal("socket already closed"));
            }
            Ok(())
        }

        async fn list_databases(&mut self) -> EngineResult<Vec<String>> {
            self.record("list_databases");
            Ok(vec!["postgres".into(), "sqlectron".into()])
        }

        async fn list_tables(&mut self) -> EngineResult<Vec<String>> {
            self.record("list_tables");
            Ok(vec!["roles".into(), "users".into()])
        }

        async fn execute(&mut self, sql: &str) -> EngineResult<Vec<RawResult>> {
            assert!(self.connected, "execute on a closed connection");
            tokio::time::sleep(Duration::from_millis(self.behavior.execute_delay_ms)).await;
            self.record(format!("execute {}", sql));

            if let Some(table) = self
                .behavior
                .locked_tables
                .iter()
                .find(|table| sql.contains(&format!("\"{}\"", table)))
            {
                return Err(EngineError::query_failed(0, format!("{} is locked", table)));
            }

            if sql.starts_with("select") {
                let row = Row::from_cells(vec![("id".into(), Value::Int(1))]);
                return Ok(vec![RawResult::rows(vec![FieldInfo::new("id")], vec![row], 0.1)]);
            }
            Ok(vec![RawResult::mutation(1, 0.1)])
        }

        async fn current_schema(&mut self) -> EngineResult<String> {
            Ok("public".into())
        }
    }

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            engine: "postgresql".into(),
            host: "localhost".into(),
            port: 5432,
            user: "postgres".into(),
            password: "secret".into(),
            database: Some("sqlectron".into()),
            ssl: Default::default(),
            tunneled: false,
        }
    }

    fn session_with(behavior: Behavior, settings: ClientSettings) -> (ConnectionSession, Arc<StdMutex<Vec<String>>>) {
        let descriptor = find_descriptor("postgresql").expect("builtin engine");
        let (engine, calls) = MockEngine::new(behavior);
        let session = ConnectionSession::new(descriptor, config(), Box::new(engine), settings);
        (session, calls)
    }

    fn session(behavior: Behavior) -> (ConnectionSession, Arc<StdMutex<Vec<String>>>) {
        session_with(behavior, ClientSettings::defaults())
    }

    fn calls(calls: &Arc<StdMutex<Vec<String>>>) -> Vec<String> {
        calls.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn operations_require_a_connection() {
        let (session, _) = session(Behavior::default());

        let err = session.list_databases().await.expect_err("not connected yet");
        assert!(matches!(
            err,
            EngineError::NotConnected {
                state: SessionState::Unconnected
            }
        ));
    }

    #[tokio::test]
    async fn full_lifecycle() {
        let (session, recorded) = session(Behavior::default());

        session.connect().await.expect("connect");
        assert_eq!(session.state().await, SessionState::Connected);

        // second connect is a no-op
        session.connect().await.expect("connect again");
        assert_eq!(calls(&recorded), vec!["connect localhost"]);

        let databases = session.list_databases().await.expect("list");
        assert_eq!(databases, vec!["postgres", "sqlectron"]);

        session.disconnect().await.expect("disconnect");
        session.disconnect().await.expect("disconnect twice");
        assert_eq!(session.state().await, SessionState::Disconnected);
        assert_eq!(
            calls(&recorded),
            vec!["connect localhost", "list_databases", "disconnect"]
        );

        let err = session.connect().await.expect_err("terminal state");
        assert!(matches!(err, EngineError::ConnectionError { .. }));

        let err = session.list_tables().await.expect_err("disconnected");
        assert!(matches!(
            err,
            EngineError::NotConnected {
                state: SessionState::Disconnected
            }
        ));
    }

    #[tokio::test]
    async fn failed_connect_returns_to_unconnected() {
        let (session, _) = session(Behavior {
            fail_connect: true,
            ..Default::default()
        });

        let err = session.connect().await.expect_err("bad credentials");
        assert!(matches!(err, EngineError::ConnectionError { .. }));
        assert_eq!(session.state().await, SessionState::Unconnected);
    }

    #[tokio::test]
    async fn connect_is_bounded_by_the_connect_timeout() {
        let settings = ClientSettings {
            connect_timeout_ms: 50,
            ..ClientSettings::defaults()
        };
        let (session, _) = session_with(
            Behavior {
                connect_delay_ms: 5_000,
                ..Default::default()
            },
            settings,
        );

        let err = session.connect().await.expect_err("should time out");
        assert!(matches!(err, EngineError::Timeout { timeout_ms: 50 }));
        assert_eq!(session.state().await, SessionState::Unconnected);
    }

    #[tokio::test]
    async fn disconnect_of_unconnected_session_skips_the_adapter() {
        let (session, recorded) = session(Behavior::default());

        session.disconnect().await.expect("no-op disconnect");
        assert_eq!(session.state().await, SessionState::Disconnected);
        assert!(calls(&recorded).is_empty());
    }

    #[tokio::test]
    async fn close_errors_are_not_propagated() {
        let (session, _) = session(Behavior {
            fail_close: true,
            ..Default::default()
        });

        session.connect().await.expect("connect");
        session.disconnect().await.expect("close error is swallowed");
        assert_eq!(session.state().await, SessionState::Disconnected);
    }

    #[tokio::test]
    async fn execute_query_normalizes_driver_output() {
        let (session, _) = session(Behavior::default());
        session.connect().await.expect("connect");

        let results = session.execute_query("select id from users").await.expect("query");
        assert_eq!(results.len(), 1);
        assert!(results[0].is_select);
        assert_eq!(results[0].row_count, Some(1));
        assert_eq!(results[0].fields, vec![FieldInfo::new("id")]);

        let results = session
            .execute_query("insert into users (id) values (2)")
            .await
            .expect("insert");
        assert!(!results[0].is_select);
        assert_eq!(results[0].affected_rows, Some(1));
        assert!(results[0].rows.is_empty());
        assert!(results[0].fields.is_empty());
    }

    #[tokio::test]
    async fn timed_out_query_finishes_before_next_operation() {
        let settings = ClientSettings {
            query_timeout_ms: Some(50),
            ..ClientSettings::defaults()
        };
        let (session, recorded) = session_with(
            Behavior {
                execute_delay_ms: 300,
                ..Default::default()
            },
            settings,
        );
        session.connect().await.expect("connect");

        let err = session
            .execute_query("update users set id = 3")
            .await
            .expect_err("should time out");
        assert!(matches!(err, EngineError::Timeout { timeout_ms: 50 }));

        session.list_databases().await.expect("list after timeout");
        assert_eq!(
            calls(&recorded),
            vec!["connect localhost", "execute update users set id = 3", "list_databases"]
        );
    }

    #[tokio::test]
    async fn truncate_all_tables_empties_every_table() {
        let (session, recorded) = session(Behavior::default());
        session.connect().await.expect("connect");

        let tables = session.truncate_all_tables().await.expect("truncate");
        assert_eq!(tables, vec!["roles", "users"]);

        let recorded = calls(&recorded);
        assert!(recorded.contains(
            &"execute TRUNCATE TABLE \"public\".\"roles\" RESTART IDENTITY CASCADE".to_string()
        ));
        assert!(recorded.contains(
            &"execute TRUNCATE TABLE \"public\".\"users\" RESTART IDENTITY CASCADE".to_string()
        ));
    }

    #[tokio::test]
    async fn truncate_failures_list_succeeded_and_failed_tables() {
        let (session, _) = session(Behavior {
            locked_tables: vec!["users"],
            ..Default::default()
        });
        session.connect().await.expect("connect");

        let err = session.truncate_all_tables().await.expect_err("users is locked");
        match err {
            EngineError::TruncateError { succeeded, failed } => {
                assert_eq!(succeeded, vec!["roles"]);
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].table, "users");
                assert!(failed[0].message.contains("users is locked"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn generated_fragments_use_engine_quoting() {
        let (session, _) = session(Behavior::default());

        assert_eq!(session.wrap_query("users"), "\"users\"");
        assert_eq!(
            session.get_query_select_top("users", 10),
            "SELECT * FROM \"users\" LIMIT 10"
        );
        assert_eq!(session.display_name(), "postgres@localhost:sqlectron");
    }
}
