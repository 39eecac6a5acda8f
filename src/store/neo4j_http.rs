//! Neo4j primary store over the transactional HTTP endpoint.
//!
//! Every statement is sent as its own auto-commit transaction to
//! `POST /db/{database}/tx/commit`. `bolt://` and `neo4j://` URIs are mapped onto
//! the HTTP listener of the same host.

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{GraphSession, GraphStore, Row, Statement};
use crate::config::PrimaryStoreConfig;
use crate::error::StoreError;
use crate::resilience::error_classifier::{
    kind_for_http_status, kind_for_message, kind_for_server_code,
};

const DEFAULT_HTTP_PORT: u16 = 7474;
const DEFAULT_HTTPS_PORT: u16 = 7473;

/// Connection factory for a Neo4j server reached over HTTP
#[derive(Clone)]
pub struct Neo4jHttpStore {
    client: Client,
    commit_url: Url,
    username: String,
    password: String,
    name: String,
}

impl std::fmt::Debug for Neo4jHttpStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Neo4jHttpStore")
            .field("commit_url", &self.commit_url.as_str())
            .field("username", &self.username)
            .field("password", &"[MASKED]")
            .finish()
    }
}

impl Neo4jHttpStore {
    /// Build the HTTP client. Missing credentials are reported as `Unavailable`.
    pub fn new(config: &PrimaryStoreConfig) -> Result<Self, StoreError> {
        let (username, password) = match (&config.username, &config.password) {
            (Some(user), Some(password)) if !user.is_empty() && !password.is_empty() => {
                (user.clone(), password.clone())
            }
            _ => {
                return Err(StoreError::unavailable(
                    "primary store credentials are not configured",
                ))
            }
        };

        let base_url = http_base_url(&config.uri)?;
        let commit_url = base_url
            .join(&format!("db/{}/tx/commit", config.database))
            .map_err(|e| StoreError::fatal(format!("invalid database name: {e}")))?;

        let client = Client::builder()
            .connect_timeout(config.connection_timeout())
            .timeout(config.connection_timeout())
            .pool_max_idle_per_host(config.max_connection_pool_size)
            .user_agent(format!("kurultai-core/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| StoreError::fatal(format!("failed to create HTTP client: {e}")))?;

        info!(
            commit_url = %commit_url,
            timeout_ms = config.connection_timeout_ms,
            max_pool = config.max_connection_pool_size,
            "Created Neo4j HTTP store"
        );

        Ok(Self {
            client,
            name: format!("neo4j:{}", base_url.host_str().unwrap_or("unknown")),
            commit_url,
            username,
            password,
        })
    }

    pub fn commit_url(&self) -> &Url {
        &self.commit_url
    }
}

#[async_trait]
impl GraphStore for Neo4jHttpStore {
    async fn session(&self) -> Result<Box<dyn GraphSession>, StoreError> {
        Ok(Box::new(Neo4jHttpSession {
            store: self.clone(),
            closed: false,
        }))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

struct Neo4jHttpSession {
    store: Neo4jHttpStore,
    closed: bool,
}

#[async_trait]
impl GraphSession for Neo4jHttpSession {
    async fn run(&mut self, statement: &Statement) -> Result<Vec<Row>, StoreError> {
        if self.closed {
            return Err(StoreError::fatal("session already closed"));
        }

        let rendered = statement.render();
        let body = json!({
            "statements": [{
                "statement": rendered.text,
                "parameters": Value::Object(rendered.params),
            }]
        });

        let response = self
            .store
            .client
            .post(self.store.commit_url.clone())
            .basic_auth(&self.store.username, Some(&self.store.password))
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            debug!(status = %status, error = %error_text, statement = statement.kind(), "Neo4j request rejected");
            return Err(StoreError::new(
                kind_for_http_status(status.as_u16()),
                format!("HTTP {status}: {error_text}"),
            ));
        }

        let payload: CommitResponse = response
            .json()
            .await
            .map_err(|e| StoreError::transient(format!("failed to parse Neo4j response: {e}")))?;

        rows_from_response(payload)
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        self.closed = true;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
    #[serde(default)]
    errors: Vec<ServerError>,
}

#[derive(Debug, Deserialize)]
struct StatementResult {
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    data: Vec<RowData>,
}

#[derive(Debug, Deserialize)]
struct RowData {
    #[serde(default)]
    row: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct ServerError {
    code: String,
    #[serde(default)]
    message: String,
}

fn rows_from_response(payload: CommitResponse) -> Result<Vec<Row>, StoreError> {
    if let Some(error) = payload.errors.into_iter().next() {
        return Err(
            StoreError::new(kind_for_server_code(&error.code), error.message).with_code(error.code),
        );
    }

    let rows = payload
        .results
        .into_iter()
        .flat_map(|result| {
            let columns = result.columns;
            result.data.into_iter().map(move |data| {
                columns
                    .iter()
                    .cloned()
                    .zip(data.row)
                    .collect::<Row>()
            })
        })
        .collect();
    Ok(rows)
}

fn map_transport_error(error: reqwest::Error) -> StoreError {
    if error.is_timeout() {
        StoreError::transient(format!("request timed out: {error}"))
    } else if error.is_connect() {
        StoreError::unavailable(format!("connection failed: {error}"))
    } else {
        StoreError::new(kind_for_message(&error.to_string()), error.to_string())
    }
}

/// Resolve the HTTP base URL for a configured store URI
fn http_base_url(uri: &str) -> Result<Url, StoreError> {
    let parsed = Url::parse(uri)
        .map_err(|e| StoreError::fatal(format!("invalid primary store URI '{uri}': {e}")))?;

    let (scheme, port) = match parsed.scheme() {
        "http" | "https" => return Ok(parsed),
        "bolt" | "neo4j" => ("http", DEFAULT_HTTP_PORT),
        "bolt+s" | "bolt+ssc" | "neo4j+s" | "neo4j+ssc" => ("https", DEFAULT_HTTPS_PORT),
        other => {
            return Err(StoreError::fatal(format!(
                "unsupported primary store scheme '{other}'"
            )))
        }
    };

    let host = parsed
        .host_str()
        .ok_or_else(|| StoreError::fatal(format!("primary store URI '{uri}' has no host")))?;
    warn!(
        uri = uri,
        port = port,
        "Binary protocol URI configured; using the HTTP endpoint on the same host"
    );
    Url::parse(&format!("{scheme}://{host}:{port}/"))
        .map_err(|e| StoreError::fatal(format!("invalid primary store URI '{uri}': {e}")))
}
