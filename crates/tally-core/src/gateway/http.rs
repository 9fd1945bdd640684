//! HTTP adapter for the remote store
//!
//! Pull and push are plain JSON POSTs; the change feed is a long-poll
//! loop over the same endpoint family. Auth is a bearer token supplied
//! at construction.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{Document, PendingChange, SyncVersions};

use super::{ChangeFeed, ChangeFeedSource, FeedEvent, PushReport, RemoteGateway, RemotePull};

/// Remote store reachable over HTTP
#[derive(Clone)]
pub struct HttpGateway {
    endpoint: String,
    token: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpGateway {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpGateway")
            .field("endpoint", &self.endpoint)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

#[derive(Serialize)]
struct PullRequest<'a> {
    versions: &'a SyncVersions,
}

#[derive(Serialize)]
struct PushRequest<'a> {
    document: &'a Document,
    changes: &'a [PendingChange],
}

#[derive(Deserialize)]
struct FeedResponse {
    #[serde(default)]
    events: Vec<FeedEvent>,
    /// Cursor to resume from on the next poll
    #[serde(default)]
    next_cursor: Option<String>,
    /// Whether the server is closing this subscription
    #[serde(default)]
    closed: bool,
}

impl HttpGateway {
    /// Build a gateway for `endpoint` authenticating with `token`
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let endpoint = normalize_endpoint(endpoint.into())?;
        let token = token.into();
        if token.trim().is_empty() {
            return Err(Error::InvalidInput(
                "sync token must not be empty".to_string(),
            ));
        }
        Ok(Self {
            endpoint,
            token: token.trim().to_string(),
            client: reqwest::Client::builder().build()?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/sync/{path}", self.endpoint)
    }

    async fn post_json<B: Serialize, T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let response = self
            .client
            .post(self.url(path))
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Remote(parse_api_error(status, &body)));
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl RemoteGateway for HttpGateway {
    async fn pull(&self, versions: &SyncVersions) -> Result<RemotePull> {
        self.post_json("pull", &PullRequest { versions }).await
    }

    async fn push(&self, document: &Document, changes: &[PendingChange]) -> Result<PushReport> {
        self.post_json("push", &PushRequest { document, changes })
            .await
    }
}

#[async_trait]
impl ChangeFeedSource for HttpGateway {
    async fn subscribe(&self) -> Result<Box<dyn ChangeFeed>> {
        Ok(Box::new(HttpChangeFeed {
            gateway: self.clone(),
            cursor: None,
            closed: false,
        }))
    }
}

/// Long-poll subscription over the feed endpoint
struct HttpChangeFeed {
    gateway: HttpGateway,
    cursor: Option<String>,
    closed: bool,
}

#[async_trait]
impl ChangeFeed for HttpChangeFeed {
    async fn next_events(&mut self) -> Result<Option<Vec<FeedEvent>>> {
        if self.closed {
            return Ok(None);
        }

        let mut request = self
            .gateway
            .client
            .get(self.gateway.url("feed"))
            .bearer_auth(&self.gateway.token)
            .header("Accept", "application/json");
        if let Some(cursor) = &self.cursor {
            request = request.query(&[("cursor", cursor.as_str())]);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Remote(parse_api_error(status, &body)));
        }

        let payload = response.json::<FeedResponse>().await?;
        if let Some(cursor) = payload.next_cursor {
            self.cursor = Some(cursor);
        }
        if payload.closed {
            self.closed = true;
            return Ok(None);
        }
        Ok(Some(payload.events))
    }
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

fn normalize_endpoint(raw: String) -> Result<String> {
    let endpoint = raw.trim();
    if endpoint.is_empty() {
        return Err(Error::InvalidInput(
            "sync endpoint must not be empty".to_string(),
        ));
    }
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        Ok(endpoint.trim_end_matches('/').to_string())
    } else {
        Err(Error::InvalidInput(
            "sync endpoint must include http:// or https://".to_string(),
        ))
    }
}
