//! etcd v2 keys API client
//!
//! Implements [`CoordinationStore`] over plain HTTP. Watches are long-poll
//! requests chained by `waitIndex`, surfaced as a stream that ends with an
//! error whenever the connection breaks.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::store::{CoordinationStore, EventKind, KeyValue, Listing, WatchEvent, WatchStream};

/// etcd error code: key not found
const ERR_KEY_NOT_FOUND: u32 = 100;

/// etcd error code: requested watch index was cleared from history
const ERR_EVENT_INDEX_CLEARED: u32 = 401;

/// Header carrying the store-wide index at response time
const ETCD_INDEX_HEADER: &str = "x-etcd-index";

#[derive(Debug, Default, Deserialize)]
struct EtcdNode {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<EtcdNode>,
    #[serde(rename = "modifiedIndex", default)]
    modified_index: u64,
}

#[derive(Debug, Deserialize)]
struct EtcdResponse {
    action: String,
    #[serde(default)]
    node: Option<EtcdNode>,
}

#[derive(Debug, Deserialize)]
struct EtcdErrorBody {
    #[serde(rename = "errorCode")]
    error_code: u32,
    message: String,
    #[serde(default)]
    cause: Option<String>,
    #[serde(default)]
    index: u64,
}

impl EtcdErrorBody {
    fn into_error(self, requested: u64) -> StoreError {
        match self.error_code {
            ERR_KEY_NOT_FOUND => StoreError::KeyNotFound(self.cause.unwrap_or(self.message)),
            ERR_EVENT_INDEX_CLEARED => StoreError::Compacted {
                requested,
                oldest: self.index,
            },
            code => StoreError::Api {
                code,
                message: self.message,
            },
        }
    }
}

/// Round a TTL up to whole seconds, never below one
fn ttl_secs(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).div_ceil(1000).max(1)
}

/// Collect every leaf node under `node` (etcd listings are nested)
fn flatten_nodes(node: EtcdNode, out: &mut Vec<KeyValue>) {
    if node.dir {
        for child in node.nodes {
            flatten_nodes(child, out);
        }
        return;
    }
    if let (Some(key), Some(value)) = (node.key, node.value) {
        out.push(KeyValue {
            key,
            value,
            revision: node.modified_index,
        });
    }
}

/// Convert a watch response into a change event
fn event_from_response(resp: EtcdResponse) -> Result<WatchEvent, StoreError> {
    let node = resp
        .node
        .ok_or_else(|| StoreError::Decode(format!("watch response '{}' without node", resp.action)))?;
    let key = node
        .key
        .ok_or_else(|| StoreError::Decode("watch node without key".to_string()))?;

    let kind = match resp.action.as_str() {
        "set" | "create" | "update" | "compareAndSwap" => EventKind::Put,
        "delete" | "expire" | "compareAndDelete" => EventKind::Delete,
        other => return Err(StoreError::Decode(format!("unknown etcd action '{}'", other))),
    };

    Ok(WatchEvent {
        kind,
        value: if kind == EventKind::Put { node.value } else { None },
        key,
        revision: node.modified_index,
    })
}

fn etcd_index(resp: &Response) -> u64 {
    resp.headers()
        .get(ETCD_INDEX_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// Read a response body into either a success document or a mapped error
async fn decode(resp: Response, requested: u64) -> Result<(EtcdResponse, u64), StoreError> {
    let index = etcd_index(&resp);
    let status = resp.status();
    let body = resp.bytes().await?;

    if status.is_success() {
        let parsed: EtcdResponse = serde_json::from_slice(&body)?;
        return Ok((parsed, index));
    }

    match serde_json::from_slice::<EtcdErrorBody>(&body) {
        Ok(err) => Err(err.into_error(requested)),
        Err(_) => Err(StoreError::Api {
            code: status.as_u16() as u32,
            message: String::from_utf8_lossy(&body).into_owned(),
        }),
    }
}

struct Endpoints {
    urls: Vec<String>,
    /// Index of the last endpoint that answered
    preferred: AtomicUsize,
}

/// etcd v2 HTTP client
#[derive(Clone)]
pub struct EtcdStore {
    endpoints: Arc<Endpoints>,
    http: Client,
    /// Watches are long polls and must not inherit the request timeout
    watch_http: Client,
    timeout: Duration,
}

impl EtcdStore {
    /// Create a client for one or more etcd endpoints (e.g. `http://10.0.0.1:2379`)
    pub fn new(endpoints: Vec<String>, timeout: Duration) -> Result<Self, StoreError> {
        debug!(?endpoints, ?timeout, "EtcdStore::new: called");
        if endpoints.is_empty() {
            return Err(StoreError::Transport("no etcd endpoints configured".to_string()));
        }
        let urls = endpoints
            .into_iter()
            .map(|e| e.trim_end_matches('/').to_string())
            .collect();

        let http = Client::builder().timeout(timeout).build()?;
        let watch_http = Client::builder().connect_timeout(timeout).build()?;

        Ok(Self {
            endpoints: Arc::new(Endpoints {
                urls,
                preferred: AtomicUsize::new(0),
            }),
            http,
            watch_http,
            timeout,
        })
    }

    fn keys_url(base: &str, key: &str) -> String {
        format!("{}/v2/keys/{}", base, key.trim_start_matches('/'))
    }

    /// Send a request, failing over across endpoints on transport errors
    async fn execute<F>(&self, build: F) -> Result<Response, StoreError>
    where
        F: Fn(&Client, &str) -> RequestBuilder,
    {
        let count = self.endpoints.urls.len();
        let start = self.endpoints.preferred.load(Ordering::Relaxed) % count;
        let mut last_error = None;

        for offset in 0..count {
            let idx = (start + offset) % count;
            let base = &self.endpoints.urls[idx];
            match build(&self.http, base).send().await {
                Ok(resp) => {
                    self.endpoints.preferred.store(idx, Ordering::Relaxed);
                    return Ok(resp);
                }
                Err(e) if e.is_timeout() => {
                    debug!(%base, "EtcdStore::execute: request timed out");
                    last_error = Some(StoreError::Timeout(self.timeout));
                }
                Err(e) => {
                    debug!(%base, error = %e, "EtcdStore::execute: endpoint failed");
                    last_error = Some(StoreError::from(e));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| StoreError::Transport("no etcd endpoint answered".to_string())))
    }

    fn preferred_url(&self) -> String {
        let count = self.endpoints.urls.len();
        let idx = self.endpoints.preferred.load(Ordering::Relaxed) % count;
        self.endpoints.urls[idx].clone()
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<u64, StoreError> {
        debug!(%key, ?ttl, "EtcdStore::put: called");
        let mut form = vec![("value", value.to_string())];
        if let Some(ttl) = ttl {
            form.push(("ttl", ttl_secs(ttl).to_string()));
        }

        let resp = self
            .execute(|http, base| http.put(Self::keys_url(base, key)).form(&form))
            .await?;
        let (body, index) = decode(resp, 0).await?;
        Ok(body.node.map(|n| n.modified_index).unwrap_or(index))
    }

    async fn refresh(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        debug!(%key, ?ttl, "EtcdStore::refresh: called");
        let form = [
            ("ttl", ttl_secs(ttl).to_string()),
            ("refresh", "true".to_string()),
            ("prevExist", "true".to_string()),
        ];

        let resp = self
            .execute(|http, base| http.put(Self::keys_url(base, key)).form(&form))
            .await?;
        let (body, index) = decode(resp, 0).await?;
        Ok(body.node.map(|n| n.modified_index).unwrap_or(index))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        debug!(%key, "EtcdStore::delete: called");
        let resp = self.execute(|http, base| http.delete(Self::keys_url(base, key))).await?;
        match decode(resp, 0).await {
            Ok(_) => Ok(()),
            Err(StoreError::KeyNotFound(_)) => {
                debug!(%key, "EtcdStore::delete: key already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn get(&self, prefix: &str) -> Result<Listing, StoreError> {
        debug!(%prefix, "EtcdStore::get: called");
        let resp = self
            .execute(|http, base| {
                http.get(Self::keys_url(base, prefix))
                    .query(&[("recursive", "true"), ("sorted", "true")])
            })
            .await?;

        let fallback_index = etcd_index(&resp);
        match decode(resp, 0).await {
            Ok((body, index)) => {
                let mut entries = Vec::new();
                if let Some(node) = body.node {
                    flatten_nodes(node, &mut entries);
                }
                entries.sort_by(|a, b| a.key.cmp(&b.key));
                Ok(Listing {
                    entries,
                    revision: index,
                })
            }
            Err(StoreError::KeyNotFound(_)) => {
                debug!(%prefix, "EtcdStore::get: prefix does not exist yet");
                Ok(Listing {
                    entries: Vec::new(),
                    revision: fallback_index,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn watch(&self, prefix: &str, after_revision: u64) -> Result<WatchStream, StoreError> {
        debug!(%prefix, after_revision, "EtcdStore::watch: called");
        let url = Self::keys_url(&self.preferred_url(), prefix);
        let http = self.watch_http.clone();

        struct State {
            http: Client,
            url: String,
            next_index: u64,
            done: bool,
        }

        let state = State {
            http,
            url,
            next_index: after_revision + 1,
            done: false,
        };

        let stream = futures::stream::unfold(state, |mut st| async move {
            if st.done {
                return None;
            }
            loop {
                let wait_index = st.next_index.to_string();
                let sent = st
                    .http
                    .get(&st.url)
                    .query(&[("wait", "true"), ("recursive", "true"), ("waitIndex", wait_index.as_str())])
                    .send()
                    .await;

                let resp = match sent {
                    Ok(resp) => resp,
                    Err(e) => {
                        warn!(error = %e, url = %st.url, "etcd watch request failed");
                        st.done = true;
                        return Some((Err(StoreError::from(e)), st));
                    }
                };

                // etcd answers an idle long poll with an empty 200 on server timeout
                if resp.status() == StatusCode::OK && resp.content_length() == Some(0) {
                    debug!(next_index = st.next_index, "etcd watch: empty long-poll response, re-polling");
                    continue;
                }

                let result = decode(resp, st.next_index.saturating_sub(1))
                    .await
                    .and_then(|(body, _)| event_from_response(body));
                return match result {
                    Ok(event) => {
                        st.next_index = event.revision + 1;
                        Some((Ok(event), st))
                    }
                    Err(e) => {
                        st.done = true;
                        Some((Err(e), st))
                    }
                };
            }
        });

        Ok(Box::pin(stream))
    }
}
