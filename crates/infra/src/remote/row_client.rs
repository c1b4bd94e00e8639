//! HTTP client for the remote row store.
//!
//! Speaks a PostgREST-style REST dialect: single-row upserts keyed by an
//! `on_conflict` column with merge-duplicates preference, filtered range
//! reads, and a `/auth/v1/user` probe for the session. Every request
//! carries a per-request timeout; failures map into
//! [`RemoteError`](inkstone_domain::RemoteError) so the classifier can
//! make retry decisions from status codes and `Retry-After` hints alone.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use inkstone_core::RowStore;
use inkstone_domain::{AuthState, RecordTable, RemoteError, RemoteRow};
use parking_lot::RwLock;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

/// Configuration for the row-store client.
#[derive(Debug, Clone)]
pub struct RowStoreConfig {
    /// Base URL, e.g. `https://rows.example.com`.
    pub base_url: String,
    /// Timeout for each request.
    pub timeout: Duration,
    /// Project API key sent on every request.
    pub api_key: Option<String>,
}

impl Default for RowStoreConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:54321".to_string(),
            timeout: Duration::from_secs(30),
            api_key: None,
        }
    }
}

/// Supplies the bearer token for outgoing requests.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    /// Current access token, or `None` when signed out.
    async fn access_token(&self) -> Option<String>;
}

/// Token provider backed by an in-memory slot (set at sign-in, cleared at
/// sign-out).
#[derive(Debug, Default)]
pub struct StaticTokenProvider {
    token: RwLock<Option<String>>,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: RwLock::new(Some(token.into())) }
    }

    pub fn signed_out() -> Self {
        Self::default()
    }

    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write() = Some(token.into());
    }

    pub fn clear(&self) {
        *self.token.write() = None;
    }
}

#[async_trait]
impl AccessTokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Option<String> {
        self.token.read().clone()
    }
}

#[derive(Debug, Deserialize)]
struct RemoteUser {
    id: String,
}

/// HTTP-backed row store.
pub struct HttpRowStore {
    client: Client,
    config: RowStoreConfig,
    tokens: Arc<dyn AccessTokenProvider>,
    cached_user: RwLock<Option<String>>,
}

impl HttpRowStore {
    /// Build a client with the given configuration and token source.
    pub fn new(
        config: RowStoreConfig,
        tokens: Arc<dyn AccessTokenProvider>,
    ) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RemoteError::Network(format!("failed to build http client: {e}")))?;

        Ok(Self { client, config, tokens, cached_user: RwLock::new(None) })
    }

    /// Forget the cached user id (call after a token change).
    pub fn clear_cached_user(&self) {
        *self.cached_user.write() = None;
    }

    fn rest_url(&self, table: RecordTable) -> String {
        format!("{}/rest/v1/{}", self.config.base_url, table.as_str())
    }

    async fn authorize(&self, request: RequestBuilder) -> Result<RequestBuilder, RemoteError> {
        let token = self.tokens.access_token().await.ok_or(RemoteError::Unauthenticated)?;
        let mut request = request.bearer_auth(token);
        if let Some(api_key) = &self.config.api_key {
            request = request.header("apikey", api_key);
        }
        Ok(request)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
        let response = request.send().await.map_err(map_transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after_ms = parse_retry_after(&response);
        let message = response.text().await.unwrap_or_default();
        let message = truncate(&message, 256);
        warn!(status = status.as_u16(), message = %message, "row store request failed");

        Err(RemoteError::Http { status: status.as_u16(), message, retry_after_ms })
    }
}

#[async_trait]
impl RowStore for HttpRowStore {
    #[instrument(skip(self, row), fields(table = %table, row_id = %row.id))]
    async fn upsert_row(
        &self,
        table: RecordTable,
        row: &RemoteRow,
        on_conflict: &str,
    ) -> Result<(), RemoteError> {
        let url = self.rest_url(table);
        let request = self
            .client
            .post(&url)
            .query(&[("on_conflict", on_conflict)])
            .header("Prefer", "resolution=merge-duplicates")
            .json(row);
        let request = self.authorize(request).await?;

        self.send(request).await?;
        debug!("row upserted");
        Ok(())
    }

    #[instrument(skip(self), fields(table = %table))]
    async fn fetch_rows(
        &self,
        table: RecordTable,
        project_id: &str,
        since: Option<i64>,
    ) -> Result<Vec<RemoteRow>, RemoteError> {
        let url = self.rest_url(table);
        // `projects` rows are keyed by their own id; child tables filter on
        // the parent reference.
        let filter_column = match table {
            RecordTable::Projects => "id",
            _ => "project_id",
        };

        let mut query: Vec<(String, String)> = vec![
            ("select".into(), "*".into()),
            (filter_column.into(), format!("eq.{project_id}")),
            ("deleted_at".into(), "is.null".into()),
        ];
        if let Some(since) = since {
            query.push(("updated_at".into(), format!("gt.{since}")));
        }

        let request = self.client.get(&url).query(&query);
        let request = self.authorize(request).await?;
        let response = self.send(request).await?;

        let rows: Vec<RemoteRow> = response
            .json()
            .await
            .map_err(|e| RemoteError::Decode(format!("row payload decode failed: {e}")))?;
        debug!(count = rows.len(), "rows fetched");
        Ok(rows)
    }

    async fn fetch_project(&self, project_id: &str) -> Result<Option<RemoteRow>, RemoteError> {
        let rows = self.fetch_rows(RecordTable::Projects, project_id, None).await?;
        Ok(rows.into_iter().next())
    }

    async fn fetch_all_projects(&self) -> Result<Vec<RemoteRow>, RemoteError> {
        let url = self.rest_url(RecordTable::Projects);
        let query: Vec<(String, String)> =
            vec![("select".into(), "*".into()), ("deleted_at".into(), "is.null".into())];

        let request = self.client.get(&url).query(&query);
        let request = self.authorize(request).await?;
        let response = self.send(request).await?;

        response
            .json()
            .await
            .map_err(|e| RemoteError::Decode(format!("row payload decode failed: {e}")))
    }

    async fn auth_state(&self) -> Result<AuthState, RemoteError> {
        if self.tokens.access_token().await.is_none() {
            return Ok(AuthState::Anonymous);
        }

        if let Some(user_id) = self.cached_user.read().clone() {
            return Ok(AuthState::Authenticated { user_id });
        }

        let url = format!("{}/auth/v1/user", self.config.base_url);
        let request = self.authorize(self.client.get(&url)).await?;
        let response = request.send().await.map_err(map_transport_error)?;

        match response.status() {
            status if status.is_success() => {
                let user: RemoteUser = response
                    .json()
                    .await
                    .map_err(|e| RemoteError::Decode(format!("user decode failed: {e}")))?;
                *self.cached_user.write() = Some(user.id.clone());
                Ok(AuthState::Authenticated { user_id: user.id })
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Ok(AuthState::Anonymous),
            status => {
                let message = truncate(&response.text().await.unwrap_or_default(), 256);
                Err(RemoteError::Http { status: status.as_u16(), message, retry_after_ms: None })
            }
        }
    }
}

fn map_transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout(Duration::from_secs(30))
    } else {
        RemoteError::Network(err.to_string())
    }
}

/// `Retry-After` arrives in whole seconds; surface it in milliseconds.
fn parse_retry_after(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(|seconds| seconds * 1_000)
}

fn truncate(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max_len.saturating_sub(3)).collect();
    truncated.push_str("...");
    truncated
}
