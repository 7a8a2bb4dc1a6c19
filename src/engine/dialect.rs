//! Identifier quoting and generated SQL/N1QL fragments.
//!
//! Every statement the crate generates itself goes through these helpers so
//! quoting rules live in one place per engine.

use crate::engine::registry::EngineKind;

/// Couchbase scope used when a collection name is given without one.
pub const DEFAULT_SCOPE: &str = "_default";

impl EngineKind {
    /// Returns the engine's quoted form of an identifier.
    ///
    /// The closing quote character is doubled inside the identifier.
    pub fn wrap_identifier(&self, identifier: &str) -> String {
        match self {
            EngineKind::MySql | EngineKind::Couchbase => {
                format!("`{}`", identifier.replace('`', "``"))
            }
            EngineKind::Postgres => format!("\"{}\"", identifier.replace('"', "\"\"")),
            EngineKind::SqlServer => format!("[{}]", identifier.replace(']', "]]")),
        }
    }

    /// Fully qualified reference to a table inside `namespace`.
    ///
    /// For Couchbase the namespace is the bucket and `table` is a
    /// `scope.collection` path as returned by `list_tables`.
    pub fn qualified_table(&self, namespace: &str, table: &str) -> String {
        match self {
            EngineKind::Couchbase => {
                let (scope, collection) = table
                    .split_once('.')
                    .unwrap_or((DEFAULT_SCOPE, table));
                format!(
                    "{}.{}.{}",
                    self.wrap_identifier(namespace),
                    self.wrap_identifier(scope),
                    self.wrap_identifier(collection)
                )
            }
            _ => format!(
                "{}.{}",
                self.wrap_identifier(namespace),
                self.wrap_identifier(table)
            ),
        }
    }

    /// Builds a "first N rows" query for `table`.
    ///
    /// `database` is only consulted by Couchbase, whose collections are
    /// always addressed through their bucket.
    pub fn select_top(&self, database: &str, table: &str, limit: u32) -> String {
        match self {
            EngineKind::SqlServer => {
                format!("SELECT TOP {} * FROM {}", limit, self.wrap_identifier(table))
            }
            EngineKind::MySql | EngineKind::Postgres => {
                format!("SELECT * FROM {} LIMIT {}", self.wrap_identifier(table), limit)
            }
            EngineKind::Couchbase => format!(
                "SELECT * FROM {} LIMIT {}",
                self.qualified_table(database, table),
                limit
            ),
        }
    }

    /// Statement emptying one table of `namespace`.
    pub fn truncate_statement(&self, namespace: &str, table: &str) -> String {
        let target = self.qualified_table(namespace, table);
        match self {
            EngineKind::Postgres => format!("TRUNCATE TABLE {} RESTART IDENTITY CASCADE", target),
            EngineKind::MySql | EngineKind::SqlServer => format!("TRUNCATE TABLE {}", target),
            EngineKind::Couchbase => format!("DELETE FROM {}", target),
        }
    }
}
