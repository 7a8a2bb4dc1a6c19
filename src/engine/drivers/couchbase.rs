//! Couchbase Driver
//!
//! Implements the DataEngine trait for Couchbase Server over its HTTP
//! services: the cluster manager REST API (buckets, scopes, collections) and
//! the query service for N1QL.
//!
//! ## Couchbase Specifics
//!
//! - A session is bound to one bucket (the resolved database)
//! - Tables are the bucket's collections, named `scope.collection`
//! - Views, routines, triggers and columns have no N1QL counterpart and
//!   are reported as empty; create scripts return a marker string
//! - Statements run one request at a time; `DELETE FROM` is used to empty a
//!   collection, several requests in flight at once

use std::time::Instant;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::json;

use crate::engine::classify::split_statements;
use crate::engine::dialect::DEFAULT_SCOPE;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::normalize::RawResult;
use crate::engine::registry::EngineKind;
use crate::engine::traits::{DataEngine, TableTruncation};
use crate::engine::types::{ConnectionConfig, FieldInfo, Row as QRow, Value};

const ENGINE_NAME: &str = "Couchbase";
const DEFAULT_QUERY_PORT: u16 = 8093;
const DEFAULT_QUERY_TLS_PORT: u16 = 18093;

/// Column name for results that are not JSON objects (`SELECT RAW ...`)
const RAW_VALUE_COLUMN: &str = "$1";

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<serde_json::Value>,
    #[serde(default)]
    signature: Option<serde_json::Value>,
    #[serde(default)]
    errors: Vec<QueryErrorBody>,
    #[serde(default)]
    metrics: Option<QueryMetrics>,
}

#[derive(Debug, Deserialize)]
struct QueryErrorBody {
    #[serde(default)]
    code: Option<i64>,
    msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryMetrics {
    #[serde(default)]
    mutation_count: Option<u64>,
}

/// Everything needed to talk to the cluster on behalf of one bucket.
///
/// Cheap to clone; the HTTP client shares its connection pool.
#[derive(Clone)]
struct CouchbaseHttp {
    client: reqwest::Client,
    manager_url: Url,
    query_url: Url,
    user: String,
    password: String,
    bucket: String,
}

impl CouchbaseHttp {
    async fn get_json(&self, url: Url) -> EngineResult<serde_json::Value> {
        self.get_json_if_found(url).await?.ok_or_else(|| {
            EngineError::metadata_failed(format!("Cluster manager returned {}", StatusCode::NOT_FOUND))
        })
    }

    /// Like `get_json`, but a 404 is reported as `None`
    async fn get_json_if_found(&self, url: Url) -> EngineResult<Option<serde_json::Value>> {
        let response = self
            .client
            .get(url)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await
            .map_err(|e| EngineError::metadata_failed(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(EngineError::metadata_failed(format!(
                "Cluster manager returned {}",
                status
            )));
        }

        response
            .json()
            .await
            .map(Some)
            .map_err(|e| EngineError::metadata_failed(e.to_string()))
    }

    /// Runs one N1QL statement against the query service
    async fn run_statement(&self, statement: &str) -> EngineResult<RawResult> {
        let start = Instant::now();
        let response = self
            .client
            .post(self.query_url.clone())
            .basic_auth(&self.user, Some(&self.password))
            .json(&json!({ "statement": statement }))
            .send()
            .await
            .map_err(|e| EngineError::metadata_failed(e.to_string()))?;

        // Failed statements still answer with a JSON body listing the errors
        let status = response.status();
        let body: QueryResponse = response.json().await.map_err(|e| {
            EngineError::metadata_failed(format!("Query service returned {}: {}", status, e))
        })?;

        classify_response(body, elapsed_ms(start)).map_err(EngineError::metadata_failed)
    }
}

#[derive(Default)]
pub struct CouchbaseDriver {
    http: Option<CouchbaseHttp>,
}

impl CouchbaseDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn boxed() -> Box<dyn DataEngine> {
        Box::new(Self::new())
    }

    fn http(&self) -> EngineResult<&CouchbaseHttp> {
        self.http
            .as_ref()
            .ok_or_else(|| EngineError::internal("Couchbase connection is not open"))
    }

    /// Asks the cluster which port its query service listens on
    async fn discover_query_port(
        client: &reqwest::Client,
        manager_url: &Url,
        config: &ConnectionConfig,
    ) -> u16 {
        let fallback = if config.ssl.enabled {
            DEFAULT_QUERY_TLS_PORT
        } else {
            DEFAULT_QUERY_PORT
        };

        let Ok(url) = endpoint(manager_url, &["pools", "default", "nodeServices"]) else {
            return fallback;
        };
        let services = client
            .get(url)
            .basic_auth(&config.user, Some(&config.password))
            .send()
            .await
            .ok()
            .filter(|response| response.status().is_success());

        let Some(response) = services else {
            return fallback;
        };
        match response.json::<serde_json::Value>().await {
            Ok(body) => query_port_from_services(&body, config.ssl.enabled).unwrap_or(fallback),
            Err(err) => {
                tracing::debug!(error = %err, "Unreadable node services, using default query port");
                fallback
            }
        }
    }
}

/// Joins `segments` onto the root of `base`, percent-encoding each one.
fn endpoint(base: &Url, segments: &[&str]) -> EngineResult<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| EngineError::internal(format!("{} cannot be a base URL", base)))?
        .clear()
        .extend(segments);
    Ok(url)
}

fn query_port_from_services(services: &serde_json::Value, tls: bool) -> Option<u16> {
    let key = if tls { "n1qlSSL" } else { "n1ql" };
    services
        .get("nodesExt")?
        .as_array()?
        .iter()
        .find_map(|node| node.get("services")?.get(key)?.as_u64())
        .and_then(|port| u16::try_from(port).ok())
}

/// Lists a bucket's collections as `scope.collection` from its manifest.
///
/// The internal `_system` scope is left out.
fn collections_from_manifest(manifest: &serde_json::Value) -> Vec<String> {
    let mut tables: Vec<String> = manifest
        .get("scopes")
        .and_then(|scopes| scopes.as_array())
        .into_iter()
        .flatten()
        .filter_map(|scope| {
            let scope_name = scope.get("name")?.as_str()?;
            if scope_name == "_system" {
                return None;
            }
            let collections = scope.get("collections")?.as_array()?;
            Some(
                collections
                    .iter()
                    .filter_map(|collection| collection.get("name")?.as_str())
                    .map(|collection| format!("{}.{}", scope_name, collection))
                    .collect::<Vec<_>>(),
            )
        })
        .flatten()
        .collect();
    tables.sort();
    tables
}

/// Turns a query service response into a raw result.
///
/// A statement returning documents (or declaring a projection without
/// mutating anything) is a select; otherwise the mutation count is used.
fn classify_response(body: QueryResponse, execution_time_ms: f64) -> Result<RawResult, String> {
    if let Some(error) = body.errors.first() {
        return Err(match error.code {
            Some(code) => format!("{} (code {})", error.msg, code),
            None => error.msg.clone(),
        });
    }

    let mutation_count = body.metrics.and_then(|metrics| metrics.mutation_count);
    let is_select = !body.results.is_empty()
        || (mutation_count.is_none() && body.signature.is_some());

    if !is_select {
        return Ok(RawResult::mutation(mutation_count.unwrap_or(0), execution_time_ms));
    }

    let star_projection = body
        .signature
        .as_ref()
        .map(is_star_signature)
        .unwrap_or(false);

    let fields = match body.signature.as_ref().and_then(|signature| signature.as_object()) {
        Some(columns) if !star_projection => columns.keys().map(FieldInfo::new).collect(),
        _ => Vec::new(),
    };

    let rows = body
        .results
        .into_iter()
        .map(|document| document_to_row(document, star_projection))
        .collect();

    Ok(RawResult::rows(fields, rows, execution_time_ms))
}

fn is_star_signature(signature: &serde_json::Value) -> bool {
    signature
        .as_object()
        .map(|object| object.len() == 1 && object.get("*").and_then(|v| v.as_str()) == Some("*"))
        .unwrap_or(false)
}

/// `SELECT *` wraps every document under its keyspace alias; that wrapper is
/// removed so rows expose the document's own fields.
fn document_to_row(document: serde_json::Value, star_projection: bool) -> QRow {
    let document = match document {
        serde_json::Value::Object(mut object) if star_projection && object.len() == 1 => {
            let only_key = object.keys().next().cloned();
            match only_key.and_then(|key| object.remove(&key)) {
                Some(serde_json::Value::Object(inner)) => serde_json::Value::Object(inner),
                Some(other) => {
                    // not a document wrapper; restore it
                    let mut restored = serde_json::Map::new();
                    restored.insert(RAW_VALUE_COLUMN.to_string(), other);
                    serde_json::Value::Object(restored)
                }
                None => serde_json::Value::Object(object),
            }
        }
        other => other,
    };

    match document {
        serde_json::Value::Object(object) => QRow::from_cells(
            object
                .into_iter()
                .map(|(name, value)| (name, Value::from_json(value)))
                .collect(),
        ),
        other => QRow::from_cells(vec![(RAW_VALUE_COLUMN.to_string(), Value::from_json(other))]),
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_micros() as f64 / 1000.0
}

#[async_trait]
impl DataEngine for CouchbaseDriver {
    fn kind(&self) -> EngineKind {
        EngineKind::Couchbase
    }

    async fn connect(&mut self, config: &ConnectionConfig) -> EngineResult<()> {
        let scheme = if config.ssl.enabled { "https" } else { "http" };
        let bucket = config.database.clone().unwrap_or_else(|| "default".to_string());

        let manager_url = Url::parse(&format!("{}://{}:{}/", scheme, config.host, config.port))
            .map_err(|e| EngineError::connection_failed(ENGINE_NAME, format!("Invalid host: {}", e)))?;

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.ssl.trust_server_certificate)
            .build()
            .map_err(|e| EngineError::connection_failed(ENGINE_NAME, e.to_string()))?;

        // Opening the bucket validates credentials and the bucket name
        let bucket_url = endpoint(&manager_url, &["pools", "default", "buckets", &bucket])?;
        let response = client
            .get(bucket_url)
            .basic_auth(&config.user, Some(&config.password))
            .send()
            .await
            .map_err(|e| EngineError::connection_failed(ENGINE_NAME, e.to_string()))?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(EngineError::connection_failed(
                    ENGINE_NAME,
                    format!("Authentication failed for user {}", config.user),
                ))
            }
            StatusCode::NOT_FOUND => {
                return Err(EngineError::connection_failed(
                    ENGINE_NAME,
                    format!("Bucket {} does not exist", bucket),
                ))
            }
            status => {
                return Err(EngineError::connection_failed(
                    ENGINE_NAME,
                    format!("Cluster manager returned {}", status),
                ))
            }
        }

        let query_port = Self::discover_query_port(&client, &manager_url, config).await;
        let mut query_url = endpoint(&manager_url, &["query", "service"])?;
        query_url
            .set_port(Some(query_port))
            .map_err(|_| EngineError::connection_failed(ENGINE_NAME, "Invalid query service port"))?;

        tracing::debug!(bucket = %bucket, query_url = %query_url, "Bucket opened");
        self.http = Some(CouchbaseHttp {
            client,
            manager_url,
            query_url,
            user: config.user.clone(),
            password: config.password.clone(),
            bucket,
        });
        Ok(())
    }

    async fn disconnect(&mut self) -> EngineResult<()> {
        // HTTP connections close when the client is dropped
        self.http = None;
        Ok(())
    }

    async fn list_databases(&mut self) -> EngineResult<Vec<String>> {
        let http = self.http()?;
        let url = endpoint(&http.manager_url, &["pools", "default", "buckets"])?;
        let buckets = http.get_json(url).await?;

        let mut names: Vec<String> = buckets
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|bucket| bucket.get("name")?.as_str().map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }

    async fn list_tables(&mut self) -> EngineResult<Vec<String>> {
        let http = self.http()?;
        let url = endpoint(
            &http.manager_url,
            &["pools", "default", "buckets", &http.bucket, "scopes"],
        )?;

        match http.get_json_if_found(url).await? {
            Some(manifest) => Ok(collections_from_manifest(&manifest)),
            None => {
                // Servers without collections expose the bucket as one keyspace
                tracing::debug!(bucket = %http.bucket, "No collection manifest, using the default collection");
                Ok(vec![format!("{}.{}", DEFAULT_SCOPE, DEFAULT_SCOPE)])
            }
        }
    }

    async fn execute(&mut self, sql: &str) -> EngineResult<Vec<RawResult>> {
        let http = self.http()?;
        let statements = split_statements(EngineKind::Couchbase, sql);

        let mut results = Vec::with_capacity(statements.len());
        for (index, statement) in statements.iter().enumerate() {
            let result = http
                .run_statement(&statement.text)
                .await
                .map_err(|e| e.at_statement(index))?;
            results.push(result);
        }
        Ok(results)
    }

    async fn current_schema(&mut self) -> EngineResult<String> {
        Ok(self.http()?.bucket.clone())
    }

    async fn truncate_tables(
        &mut self,
        schema: &str,
        tables: &[String],
        concurrency: usize,
    ) -> EngineResult<Vec<TableTruncation>> {
        let http = self.http()?.clone();

        let outcomes = stream::iter(tables.iter().cloned())
            .map(|table| {
                let http = http.clone();
                let statement = EngineKind::Couchbase.truncate_statement(schema, &table);
                async move {
                    let result = http.run_statement(&statement).await.map(|_| ());
                    if let Err(err) = &result {
                        tracing::warn!(table = %table, error = %err, "Truncate failed");
                    }
                    TableTruncation { table, result }
                }
            })
            .buffered(concurrency.max(1))
            .collect()
            .await;

        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(body: serde_json::Value) -> QueryResponse {
        serde_json::from_value(body).expect("valid query response")
    }

    #[test]
    fn star_selects_unwrap_the_keyspace_alias() {
        let body = response(json!({
            "signature": {"*": "*"},
            "results": [{"users": {"id": 1, "username": "maxcnunes"}}],
            "metrics": {"resultCount": 1}
        }));

        let raw = classify_response(body, 1.0).expect("select");
        match raw.outcome {
            crate::engine::normalize::RawOutcome::Rows { fields, rows } => {
                assert!(fields.is_empty());
                assert_eq!(rows.len(), 1);
                assert_eq!(rows[0].columns().collect::<Vec<_>>(), vec!["id", "username"]);
                assert_eq!(rows[0].get("username"), Some(&Value::Text("maxcnunes".into())));
            }
            other => panic!("expected rows, got {other:?}"),
        }
    }

    #[test]
    fn empty_selects_are_still_selects() {
        let body = response(json!({
            "signature": {"id": "json", "name": "json"},
            "results": [],
            "metrics": {"resultCount": 0}
        }));

        let raw = classify_response(body, 1.0).expect("select");
        assert_eq!(
            raw.outcome,
            crate::engine::normalize::RawOutcome::Rows {
                fields: vec![FieldInfo::new("id"), FieldInfo::new("name")],
                rows: Vec::new(),
            }
        );
    }

    #[test]
    fn mutations_report_their_count() {
        let body = response(json!({
            "results": [],
            "metrics": {"mutationCount": 3}
        }));
        let raw = classify_response(body, 2.0).expect("mutation");
        assert_eq!(raw, RawResult::mutation(3, 2.0));

        // DDL answers without signature or count
        let raw = classify_response(response(json!({"results": []})), 2.0).expect("ddl");
        assert_eq!(raw, RawResult::mutation(0, 2.0));
    }

    #[test]
    fn errors_use_the_first_message() {
        let body = response(json!({
            "errors": [
                {"code": 3000, "msg": "syntax error - at FORM"},
                {"code": 4000, "msg": "ignored"}
            ]
        }));
        let err = classify_response(body, 0.0).expect_err("query failed");
        assert_eq!(err, "syntax error - at FORM (code 3000)");
    }

    #[test]
    fn raw_selects_use_a_positional_column() {
        let body = response(json!({
            "signature": "json",
            "results": ["a", "b"]
        }));
        let raw = classify_response(body, 0.0).expect("select");
        match raw.outcome {
            crate::engine::normalize::RawOutcome::Rows { rows, .. } => {
                assert_eq!(rows[1].get(RAW_VALUE_COLUMN), Some(&Value::Text("b".into())));
            }
            other => panic!("expected rows, got {other:?}"),
        }
    }

    #[test]
    fn manifest_lists_scope_qualified_collections() {
        let manifest = json!({
            "uid": "2",
            "scopes": [
                {"name": "inventory", "collections": [{"name": "route"}, {"name": "airline"}]},
                {"name": "_default", "collections": [{"name": "_default"}]},
                {"name": "_system", "collections": [{"name": "_query"}]}
            ]
        });

        assert_eq!(
            collections_from_manifest(&manifest),
            vec!["_default._default", "inventory.airline", "inventory.route"]
        );
    }

    #[test]
    fn query_port_is_read_from_node_services() {
        let services = json!({
            "nodesExt": [
                {"services": {"mgmt": 8091, "kv": 11210}},
                {"services": {"mgmt": 8091, "n1ql": 8093, "n1qlSSL": 18093}}
            ]
        });

        assert_eq!(query_port_from_services(&services, false), Some(8093));
        assert_eq!(query_port_from_services(&services, true), Some(18093));
        assert_eq!(query_port_from_services(&json!({}), false), None);
    }

    #[test]
    fn endpoints_encode_bucket_names() {
        let base = Url::parse("http://127.0.0.1:8091/").expect("valid url");
        let url = endpoint(&base, &["pools", "default", "buckets", "travel sample"]).expect("url");
        assert_eq!(url.as_str(), "http://127.0.0.1:8091/pools/default/buckets/travel%20sample");
    }

    #[tokio::test]
    async fn stubs_answer_without_a_connection() {
        let mut driver = CouchbaseDriver::new();

        assert!(driver.list_views().await.expect("stub").is_empty());
        assert!(driver.list_routines().await.expect("stub").is_empty());
        assert!(driver.list_table_columns("users").await.expect("stub").is_empty());
        assert!(driver.list_table_triggers("users").await.expect("stub").is_empty());
        assert_eq!(
            driver.table_create_script("users").await.expect("stub"),
            crate::engine::registry::UNSUPPORTED_SCRIPT
        );

        let err = driver.list_tables().await.expect_err("not connected");
        assert!(matches!(err, EngineError::Internal(_)));
    }

    mod against_stub_cluster {
        use std::sync::{Arc, Mutex as StdMutex};

        use axum::extract::State;
        use axum::routing::{get, post};
        use axum::{Json, Router};

        use super::*;
        use crate::engine::normalize::RawOutcome;
        use crate::engine::types::SslOptions;

        #[derive(Clone)]
        struct Cluster {
            port: u16,
            scopes_status: StatusCode,
            statements: Arc<StdMutex<Vec<String>>>,
        }

        async fn node_services(State(cluster): State<Cluster>) -> Json<serde_json::Value> {
            Json(json!({"nodesExt": [{"services": {"mgmt": cluster.port, "n1ql": cluster.port}}]}))
        }

        async fn scopes(State(cluster): State<Cluster>) -> (StatusCode, Json<serde_json::Value>) {
            let manifest = json!({
                "scopes": [
                    {"name": "inventory", "collections": [{"name": "route"}, {"name": "locked"}]}
                ]
            });
            (cluster.scopes_status, Json(manifest))
        }

        async fn query_service(
            State(cluster): State<Cluster>,
            Json(body): Json<serde_json::Value>,
        ) -> (StatusCode, Json<serde_json::Value>) {
            let statement = body["statement"].as_str().unwrap_or_default().to_string();
            cluster.statements.lock().expect("statement log").push(statement.clone());

            if statement.contains("nosuch") || statement.contains("`locked`") {
                let failure = json!({
                    "errors": [{"code": 12003, "msg": "Keyspace not found"}],
                    "status": "fatal"
                });
                return (StatusCode::NOT_FOUND, Json(failure));
            }
            if statement.starts_with("SELECT") {
                let rows = json!({
                    "signature": {"id": "json"},
                    "results": [{"id": 1}],
                    "metrics": {"resultCount": 1}
                });
                return (StatusCode::OK, Json(rows));
            }
            (StatusCode::OK, Json(json!({"results": [], "metrics": {"mutationCount": 1}})))
        }

        /// Serves the manager and query endpoints on one local port
        async fn start_cluster(scopes_status: StatusCode) -> (ConnectionConfig, Arc<StdMutex<Vec<String>>>) {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
            let port = listener.local_addr().expect("stub address").port();
            let statements = Arc::new(StdMutex::new(Vec::new()));

            let cluster = Cluster {
                port,
                scopes_status,
                statements: Arc::clone(&statements),
            };
            let app = Router::new()
                .route(
                    "/pools/default/buckets",
                    get(|| async { Json(json!([{"name": "travel"}, {"name": "default"}])) }),
                )
                .route(
                    "/pools/default/buckets/{bucket}",
                    get(|| async { Json(json!({"name": "default"})) }),
                )
                .route("/pools/default/buckets/{bucket}/scopes", get(scopes))
                .route("/pools/default/nodeServices", get(node_services))
                .route("/query/service", post(query_service))
                .with_state(cluster);

            tokio::spawn(async move {
                axum::serve(listener, app).await.expect("stub cluster");
            });

            let config = ConnectionConfig {
                engine: "couchbase".to_string(),
                host: "127.0.0.1".to_string(),
                port,
                user: "Administrator".to_string(),
                password: "password".to_string(),
                database: Some("default".to_string()),
                ssl: SslOptions::default(),
                tunneled: false,
            };
            (config, statements)
        }

        async fn connected(scopes_status: StatusCode) -> (CouchbaseDriver, Arc<StdMutex<Vec<String>>>) {
            let (config, statements) = start_cluster(scopes_status).await;
            let mut driver = CouchbaseDriver::new();
            driver.connect(&config).await.expect("connect to stub");
            (driver, statements)
        }

        #[tokio::test]
        async fn batches_run_statement_by_statement() {
            let (mut driver, statements) = connected(StatusCode::OK).await;

            let results = driver
                .execute("SELECT id FROM users; UPDATE users SET active = true")
                .await
                .expect("batch");

            assert_eq!(results.len(), 2);
            match &results[0].outcome {
                RawOutcome::Rows { fields, rows } => {
                    assert_eq!(fields, &vec![FieldInfo::new("id")]);
                    assert_eq!(rows[0].get("id"), Some(&Value::Int(1)));
                }
                other => panic!("expected rows, got {other:?}"),
            }
            assert!(matches!(results[1].outcome, RawOutcome::Mutation { affected_rows: 1 }));
            assert_eq!(statements.lock().expect("statement log").len(), 2);
        }

        #[tokio::test]
        async fn failing_statement_reports_its_index() {
            let (mut driver, statements) = connected(StatusCode::OK).await;

            let err = driver
                .execute("UPDATE users SET active = true; SELECT * FROM nosuch; SELECT id FROM users")
                .await
                .expect_err("second statement fails");

            match err {
                EngineError::QueryError { index, message } => {
                    assert_eq!(index, 1);
                    assert_eq!(message, "Keyspace not found (code 12003)");
                }
                other => panic!("expected a query error, got {other:?}"),
            }
            // the batch stops at the failure
            assert_eq!(statements.lock().expect("statement log").len(), 2);
        }

        #[tokio::test]
        async fn truncation_reports_each_collection() {
            let (mut driver, statements) = connected(StatusCode::OK).await;
            let tables = driver.list_tables().await.expect("collections");
            assert_eq!(tables, vec!["inventory.locked", "inventory.route"]);

            let outcomes = driver
                .truncate_tables("default", &tables, 4)
                .await
                .expect("truncate");

            assert_eq!(outcomes.len(), 2);
            assert_eq!(outcomes[0].table, "inventory.locked");
            assert!(matches!(outcomes[0].result, Err(EngineError::QueryError { .. })));
            assert_eq!(outcomes[1].table, "inventory.route");
            assert!(outcomes[1].result.is_ok());

            let mut sent = statements.lock().expect("statement log").clone();
            sent.sort();
            assert_eq!(
                sent,
                vec![
                    "DELETE FROM `default`.`inventory`.`locked`",
                    "DELETE FROM `default`.`inventory`.`route`",
                ]
            );
        }

        #[tokio::test]
        async fn rejected_manifest_requests_surface() {
            let (mut driver, _) = connected(StatusCode::UNAUTHORIZED).await;

            let err = driver.list_tables().await.expect_err("401 is an error");
            assert!(err.to_string().contains("401"), "{err}");
        }

        #[tokio::test]
        async fn servers_without_collections_expose_the_default_one() {
            let (mut driver, _) = connected(StatusCode::NOT_FOUND).await;

            assert_eq!(
                driver.list_tables().await.expect("fallback"),
                vec!["_default._default"]
            );
            assert_eq!(
                driver.list_databases().await.expect("buckets"),
                vec!["default", "travel"]
            );
        }
    }
}
