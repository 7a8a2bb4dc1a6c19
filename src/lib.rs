// dbbridge - one session contract for MySQL, PostgreSQL, SQL Server and Couchbase
// Core library

pub mod engine;
pub mod observability;
pub mod settings;

pub use engine::{
    resolve, ConnectionConfig, ConnectionSession, DataEngine, DriverRegistry, EngineError,
    EngineKind, EngineResult, QueryResult, ServerSettings,
};
pub use settings::ClientSettings;

/// Resolves `server` (optionally overriding its database) and creates an
/// unconnected session through the process-wide registry.
pub fn create_session(
    server: &ServerSettings,
    database: Option<&str>,
) -> EngineResult<ConnectionSession> {
    let config = resolve(server, database);
    DriverRegistry::global().create_session(&server.engine, config)
}
