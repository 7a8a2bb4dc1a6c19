//! Driver Registry
//!
//! Static table of every supported engine and the capabilities each adapter
//! really implements. The table is built once and never mutated; the
//! registry only looks descriptors up and hands out unconnected sessions.

use std::collections::HashMap;
use std::sync::OnceLock;

use serde::Serialize;

use crate::engine::drivers::couchbase::CouchbaseDriver;
use crate::engine::drivers::mysql::MySqlDriver;
use crate::engine::drivers::postgres::PostgresDriver;
use crate::engine::drivers::sqlserver::SqlServerDriver;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::session::ConnectionSession;
use crate::engine::traits::DataEngine;
use crate::engine::types::ConnectionConfig;
use crate::settings::ClientSettings;

/// Supported engine families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    MySql,
    Postgres,
    SqlServer,
    Couchbase,
}

/// How an adapter implements an optional introspection operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureSupport {
    /// Backed by a real metadata query
    Native,
    /// Always succeeds with an empty sequence
    EmptyStub,
    /// Always succeeds with [`UNSUPPORTED_SCRIPT`] (create-script requests)
    MarkerStub,
}

/// Returned by create-script requests the engine has no concept for.
pub const UNSUPPORTED_SCRIPT: &str = "-- create script is not supported by this engine";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub table_columns: FeatureSupport,
    pub views: FeatureSupport,
    pub routines: FeatureSupport,
    pub triggers: FeatureSupport,
    pub create_scripts: FeatureSupport,
}

impl Capabilities {
    const FULL: Capabilities = Capabilities {
        table_columns: FeatureSupport::Native,
        views: FeatureSupport::Native,
        routines: FeatureSupport::Native,
        triggers: FeatureSupport::Native,
        create_scripts: FeatureSupport::Native,
    };
}

/// How row counts of non-select statements are reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CountSemantics {
    /// One result per statement, `affected_rows` set, `row_count` unset
    PerStatement,
    /// A batch without result sets collapses into one result whose
    /// `affected_rows` is the sum and whose `row_count` is 0
    AggregatedMutations,
}

/// Static description of one engine
#[derive(Debug, Serialize)]
pub struct EngineDescriptor {
    pub kind: EngineKind,
    pub key: &'static str,
    #[serde(skip)]
    pub aliases: &'static [&'static str],
    pub display_name: &'static str,
    pub default_port: u16,
    pub default_database: Option<&'static str>,
    pub capabilities: Capabilities,
    pub count_semantics: CountSemantics,
    /// Whether an empty select still reports its columns
    pub fields_on_empty_result: bool,
    /// Upper bound of concurrent truncate statements on one session
    pub max_truncate_concurrency: usize,
    #[serde(skip)]
    factory: fn() -> Box<dyn DataEngine>,
}

impl EngineDescriptor {
    /// Creates a fresh, unconnected adapter for this engine
    pub fn new_engine(&self) -> Box<dyn DataEngine> {
        (self.factory)()
    }

    fn matches(&self, key: &str) -> bool {
        self.key.eq_ignore_ascii_case(key)
            || self.aliases.iter().any(|alias| alias.eq_ignore_ascii_case(key))
    }
}

pub static ENGINES: [EngineDescriptor; 4] = [
    EngineDescriptor {
        kind: EngineKind::MySql,
        key: "mysql",
        aliases: &["mariadb"],
        display_name: "MySQL",
        default_port: 3306,
        default_database: None,
        capabilities: Capabilities::FULL,
        count_semantics: CountSemantics::PerStatement,
        fields_on_empty_result: true,
        max_truncate_concurrency: 1,
        factory: MySqlDriver::boxed,
    },
    EngineDescriptor {
        kind: EngineKind::Postgres,
        key: "postgresql",
        aliases: &["postgres"],
        display_name: "PostgreSQL",
        default_port: 5432,
        default_database: Some("postgres"),
        capabilities: Capabilities::FULL,
        count_semantics: CountSemantics::PerStatement,
        fields_on_empty_result: true,
        max_truncate_concurrency: 1,
        factory: PostgresDriver::boxed,
    },
    EngineDescriptor {
        kind: EngineKind::SqlServer,
        key: "sqlserver",
        aliases: &["mssql"],
        display_name: "Microsoft SQL Server",
        default_port: 1433,
        default_database: None,
        capabilities: Capabilities::FULL,
        count_semantics: CountSemantics::AggregatedMutations,
        fields_on_empty_result: true,
        max_truncate_concurrency: 1,
        factory: SqlServerDriver::boxed,
    },
    EngineDescriptor {
        kind: EngineKind::Couchbase,
        key: "couchbase",
        aliases: &[],
        display_name: "Couchbase",
        default_port: 8091,
        default_database: Some("default"),
        capabilities: Capabilities {
            table_columns: FeatureSupport::EmptyStub,
            views: FeatureSupport::EmptyStub,
            routines: FeatureSupport::EmptyStub,
            triggers: FeatureSupport::EmptyStub,
            create_scripts: FeatureSupport::MarkerStub,
        },
        count_semantics: CountSemantics::PerStatement,
        fields_on_empty_result: false,
        max_truncate_concurrency: 8,
        factory: CouchbaseDriver::boxed,
    },
];

/// Looks a built-in engine up by key or alias (case-insensitive)
pub fn find_descriptor(key: &str) -> Option<&'static EngineDescriptor> {
    ENGINES.iter().find(|descriptor| descriptor.matches(key))
}

/// Registry of the built-in engines
pub struct DriverRegistry {
    engines: HashMap<&'static str, &'static EngineDescriptor>,
    settings: ClientSettings,
}

impl DriverRegistry {
    /// Creates a registry holding every built-in engine
    pub fn new(settings: ClientSettings) -> Self {
        let engines = ENGINES.iter().map(|descriptor| (descriptor.key, descriptor)).collect();
        Self { engines, settings }
    }

    /// Process-wide registry, initialized on first use with the stored settings
    pub fn global() -> &'static DriverRegistry {
        static REGISTRY: OnceLock<DriverRegistry> = OnceLock::new();
        REGISTRY.get_or_init(|| DriverRegistry::new(ClientSettings::load()))
    }

    /// Gets a descriptor by key or alias (case-insensitive)
    pub fn get(&self, key: &str) -> Option<&'static EngineDescriptor> {
        if let Some(descriptor) = self.engines.get(key) {
            return Some(*descriptor);
        }
        self.engines.values().copied().find(|descriptor| descriptor.matches(key))
    }

    pub fn descriptor(&self, key: &str) -> EngineResult<&'static EngineDescriptor> {
        self.get(key).ok_or_else(|| EngineError::unsupported_engine(key))
    }

    /// Lists all registered descriptors, ordered by key
    pub fn list(&self) -> Vec<&'static EngineDescriptor> {
        let mut descriptors: Vec<_> = self.engines.values().copied().collect();
        descriptors.sort_by_key(|descriptor| descriptor.key);
        descriptors
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Creates an unconnected session for `engine_key`
    pub fn create_session(
        &self,
        engine_key: &str,
        config: ConnectionConfig,
    ) -> EngineResult<ConnectionSession> {
        let descriptor = self.descriptor(engine_key)?;
        Ok(ConnectionSession::new(
            descriptor,
            config,
            descriptor.new_engine(),
            self.settings.clone(),
        ))
    }

    /// Returns the number of registered engines
    pub fn len(&self) -> usize {
        self.engines.len()
    }

    /// Returns true if no engines are registered
    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new(ClientSettings::default())
    }
}
