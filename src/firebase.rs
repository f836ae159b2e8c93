//! Realtime-database REST client.
//!
//! Talks to a Firebase-style realtime database over its REST surface:
//!
//! - **Reads / writes**: `GET`, `PUT` and `DELETE` on `{base}/{path}.json`.
//! - **Conditional writes**: the read asks for an ETag
//!   (`X-Firebase-ETag: true`) and the write sends it back in `if-match`; the
//!   server answers `412 Precondition Failed` if the node changed in between.
//! - **Subscriptions**: a long-lived `text/event-stream` request per node.
//!   The server sends `put` / `patch` deltas relative to the node; a local
//!   copy of the subtree is patched and a full snapshot forwarded after each
//!   change. Dropped streams reconnect after a delay.

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderValue, ACCEPT};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::registry::{
    lookup, segments, write, Registry, RegistryError, Snapshot, SUBSCRIPTION_BUFFER,
};

/// HTTP request timeout for one-shot reads and writes.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Connect timeout for event streams; once open they stay open.
const STREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const ETAG_REQUEST: &str = "X-Firebase-ETag";
const ETAG: &str = "ETag";
const IF_MATCH: &str = "if-match";

/// Client for one realtime database.
#[derive(Clone)]
pub struct FirebaseRegistry {
    base_url: String,
    auth: Option<String>,
    http: reqwest::Client,
    stream_http: reqwest::Client,
    reconnect_delay: Duration,
}

impl FirebaseRegistry {
    pub fn new(
        base_url: &str,
        auth: Option<String>,
        reconnect_delay: Duration,
    ) -> Result<Self, RegistryError> {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        let stream_http = reqwest::Client::builder()
            .connect_timeout(STREAM_CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
            http,
            stream_http,
            reconnect_delay,
        })
    }

    fn url(&self, path: &str) -> Result<String, RegistryError> {
        let parts = segments(path)?;
        Ok(format!("{}/{}.json", self.base_url, parts.join("/")))
    }

    fn with_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            Some(token) => request.query(&[("auth", token)]),
            None => request,
        }
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, RegistryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RegistryError::Status {
        status: status.as_u16(),
        body,
    })
}

fn into_snapshot(value: Value) -> Snapshot {
    if value.is_null() { None } else { Some(value) }
}

#[async_trait]
impl Registry for FirebaseRegistry {
    async fn get(&self, path: &str) -> Result<Snapshot, RegistryError> {
        let url = self.url(path)?;
        let response = self.with_auth(self.http.get(&url)).send().await?;
        let value: Value = check(response).await?.json().await?;
        Ok(into_snapshot(value))
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), RegistryError> {
        let url = self.url(path)?;
        let response = self.with_auth(self.http.put(&url)).json(&value).send().await?;
        check(response).await?;
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), RegistryError> {
        let url = self.url(path)?;
        let response = self.with_auth(self.http.delete(&url)).send().await?;
        check(response).await?;
        Ok(())
    }

    async fn compare_and_set(
        &self,
        path: &str,
        expected: &Snapshot,
        value: Value,
    ) -> Result<bool, RegistryError> {
        let url = self.url(path)?;

        let response = self
            .with_auth(self.http.get(&url))
            .header(ETAG_REQUEST, "true")
            .send()
            .await?;
        let response = check(response).await?;
        let etag = response
            .headers()
            .get(ETAG)
            .cloned()
            .ok_or_else(|| RegistryError::Decode("missing ETag header".into()))?;
        let current: Value = response.json().await?;
        if into_snapshot(current) != *expected {
            debug!(path, "Node changed before conditional write");
            return Ok(false);
        }

        let response = self
            .with_auth(self.http.put(&url))
            .header(IF_MATCH, etag)
            .json(&value)
            .send()
            .await?;
        if response.status() == StatusCode::PRECONDITION_FAILED {
            debug!(path, "Conditional write rejected: ETag mismatch");
            return Ok(false);
        }
        check(response).await?;
        Ok(true)
    }

    async fn subscribe(&self, path: &str) -> Result<mpsc::Receiver<Snapshot>, RegistryError> {
        let url = self.url(path)?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);

        let client = self.clone();
        let path = path.to_string();
        tokio::spawn(async move {
            client.stream_node(path, url, tx).await;
        });

        Ok(rx)
    }
}

impl FirebaseRegistry {
    /// Follow one node's event stream until the receiver is dropped,
    /// reconnecting whenever the stream ends or the server cancels it.
    async fn stream_node(&self, path: String, url: String, tx: mpsc::Sender<Snapshot>) {
        let mut last_sent: Option<Snapshot> = None;

        loop {
            info!(path = %path, "Opening registry stream");

            let request = self
                .with_auth(self.stream_http.get(&url))
                .header(ACCEPT, HeaderValue::from_static("text/event-stream"));

            match request.send().await.map_err(RegistryError::from) {
                Ok(response) => match check(response).await {
                    Ok(response) => {
                        info!(path = %path, "Registry stream connected");
                        let mut tree = Value::Null;
                        let mut parser = SseParser::default();
                        let mut body = response.bytes_stream();

                        'stream: while let Some(chunk) = body.next().await {
                            let bytes = match chunk {
                                Ok(bytes) => bytes,
                                Err(e) => {
                                    warn!(path = %path, error = %e, "Registry stream read failed");
                                    break;
                                }
                            };

                            for event in parser.feed(&bytes) {
                                match apply_event(&mut tree, &event) {
                                    Ok(StreamStep::Changed) => {
                                        let snapshot = lookup(&tree, &[]).cloned();
                                        if last_sent.as_ref() == Some(&snapshot) {
                                            continue;
                                        }
                                        last_sent = Some(snapshot.clone());
                                        if tx.send(snapshot).await.is_err() {
                                            debug!(path = %path, "Subscriber gone, closing stream");
                                            return;
                                        }
                                    }
                                    Ok(StreamStep::Idle) => {}
                                    Ok(StreamStep::Restart(reason)) => {
                                        warn!(path = %path, reason, "Registry closed the stream");
                                        break 'stream;
                                    }
                                    Err(e) => {
                                        warn!(path = %path, error = %e, "Skipping malformed stream event");
                                    }
                                }
                            }
                        }
                        warn!(path = %path, "Registry stream ended, reconnecting");
                    }
                    Err(e) => error!(path = %path, error = %e, "Registry refused stream"),
                },
                Err(e) => error!(path = %path, error = %e, "Failed to open registry stream"),
            }

            info!(delay = ?self.reconnect_delay, "Reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_delay) => {}
                _ = tx.closed() => return,
            }
        }
    }
}

/// One server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` parser. Chunks may split lines (and UTF-8
/// sequences) anywhere; only complete lines are interpreted.
#[derive(Debug, Default)]
pub struct SseParser {
    pending: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.pending.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(&['\n', '\r'][..]);

            if line.is_empty() {
                if let Some(event) = self.event.take() {
                    events.push(SseEvent {
                        event,
                        data: self.data.join("\n"),
                    });
                }
                self.data.clear();
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }

        events
    }
}

#[derive(Deserialize)]
struct Delta {
    path: String,
    data: Value,
}

/// What a stream event means for the subscription.
#[derive(Debug, PartialEq, Eq)]
pub enum StreamStep {
    Changed,
    Idle,
    Restart(&'static str),
}

/// Apply one event to the local copy of the subscribed subtree.
pub fn apply_event(tree: &mut Value, event: &SseEvent) -> Result<StreamStep, RegistryError> {
    match event.event.as_str() {
        "put" => {
            let delta: Delta = serde_json::from_str(&event.data)?;
            let at = segments(&delta.path)?;
            write(tree, &at, delta.data);
            Ok(StreamStep::Changed)
        }
        "patch" => {
            let delta: Delta = serde_json::from_str(&event.data)?;
            let at = segments(&delta.path)?;
            let Value::Object(children) = delta.data else {
                return Err(RegistryError::Decode("patch data is not an object".into()));
            };
            for (key, value) in children {
                let mut target = at.clone();
                target.extend(segments(&key)?);
                write(tree, &target, value);
            }
            Ok(StreamStep::Changed)
        }
        "keep-alive" => Ok(StreamStep::Idle),
        "cancel" => Ok(StreamStep::Restart("cancelled")),
        "auth_revoked" => Ok(StreamStep::Restart("auth revoked")),
        other => {
            debug!(event = other, "Ignoring unknown stream event");
            Ok(StreamStep::Idle)
        }
    }
}
