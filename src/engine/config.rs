//! Connection config resolution
//!
//! Turns stored server settings plus an optional tunnel into the
//! `ConnectionConfig` a driver connects with.

use crate::engine::registry::find_descriptor;
use crate::engine::types::{ConnectionConfig, ServerSettings};

/// Resolves the config for connecting to `database` on `settings`.
///
/// Pure transform: `settings` is left untouched and nothing is validated
/// here. Missing values fall back to the engine's defaults; invalid ones
/// surface when the driver connects. When a tunnel is configured the remote
/// host/port are replaced by the tunnel's local endpoint and not kept.
pub fn resolve(settings: &ServerSettings, database: Option<&str>) -> ConnectionConfig {
    let descriptor = find_descriptor(&settings.engine);

    let engine = descriptor
        .map(|d| d.key.to_string())
        .unwrap_or_else(|| settings.engine.clone());

    let database = database
        .map(str::to_string)
        .or_else(|| settings.database.clone())
        .filter(|db| !db.is_empty())
        .or_else(|| descriptor.and_then(|d| d.default_database).map(str::to_string));

    let (host, port, tunneled) = match &settings.tunnel {
        Some(tunnel) => (tunnel.local_host.clone(), tunnel.local_port, true),
        None => (
            settings.host.clone(),
            settings
                .port
                .or_else(|| descriptor.map(|d| d.default_port))
                .unwrap_or_default(),
            false,
        ),
    };

    ConnectionConfig {
        engine,
        host,
        port,
        user: settings.user.clone(),
        password: settings.password.clone(),
        database,
        ssl: settings.ssl,
        tunneled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{SslOptions, TunnelEndpoint};

    fn settings(engine: &str) -> ServerSettings {
        ServerSettings {
            engine: engine.to_string(),
            host: "db.internal".to_string(),
            port: None,
            user: "sa".to_string(),
            password: "secret".to_string(),
            database: None,
            ssl: SslOptions {
                enabled: true,
                trust_server_certificate: false,
            },
            tunnel: None,
        }
    }

    #[test]
    fn applies_engine_defaults() {
        let config = resolve(&settings("postgres"), None);

        assert_eq!(config.engine, "postgresql");
        assert_eq!(config.host, "db.internal");
        assert_eq!(config.port, 5432);
        assert_eq!(config.database.as_deref(), Some("postgres"));
        assert!(config.ssl.enabled);
        assert!(!config.tunneled);
    }

    #[test]
    fn selector_wins_over_stored_database() {
        let mut base = settings("mysql");
        base.database = Some("stored".to_string());
        base.port = Some(3307);

        let config = resolve(&base, Some("selected"));
        assert_eq!(config.database.as_deref(), Some("selected"));
        assert_eq!(config.port, 3307);

        let config = resolve(&base, None);
        assert_eq!(config.database.as_deref(), Some("stored"));
    }

    #[test]
    fn tunnel_replaces_remote_endpoint() {
        let mut base = settings("sqlserver");
        base.port = Some(1433);
        base.tunnel = Some(TunnelEndpoint {
            local_host: "127.0.0.1".to_string(),
            local_port: 40123,
        });

        let config = resolve(&base, Some("master"));

        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 40123);
        assert!(config.tunneled);
        // input settings are not modified
        assert_eq!(base.host, "db.internal");
        assert_eq!(base.port, Some(1433));
    }

    #[test]
    fn unknown_engine_passes_through() {
        let config = resolve(&settings("oracle"), None);
        assert_eq!(config.engine, "oracle");
        assert_eq!(config.port, 0);
        assert_eq!(config.database, None);
    }
}
