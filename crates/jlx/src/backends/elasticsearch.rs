//! # 📡 THE ELASTICSEARCH BACKEND
//!
//! 🎬 COLD OPEN, INT. SERVER ROOM, 3:47 AM
//!
//! The monitoring dashboard glows amber in the dark. One engineer, alone,
//! stares into the abyss of a RED cluster. The abyss stares back and
//! offers a 429. "I'll just dump it to a file," they whispered. "It'll be fast."
//!
//! 🚀 This module is the only place in jlx that knows Elasticsearch speaks HTTP.
//! It counts, it opens point-in-times, it scrolls, it reads breaker stats, it bulks.
//! It does NOT retry. Retrying is the retry controller's whole personality and we
//! respect boundaries here.
//!
//! 🧠 Knowledge graph:
//! - 429 / 5xx → `TransientError`, the retry controller will come back for it
//! - connect / timeout errors → left as `reqwest::Error` in the chain, also transient
//! - any other non-2xx → fatal, with the body attached for the postmortem
//! - a 2xx body that doesn't decode → protocol violation, fatal
//!
//! 🦆 (mandatory duck, no context provided, none shall be requested)

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, trace};

use super::{BreakerSnapshot, BulkItemResult, Cluster, SearchPage, SearchRequest};
use crate::common::Hit;
use crate::cursor::PagingMode;
use crate::error::{TransientError, is_retryable_status};

// 📡 ClusterConfig: "It's just Elasticsearch", she said, before the cluster went red.
//
// 🔧 auth is tri-modal: username+password, api_key, or "I hope anonymous works" (it might!).
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ClusterConfig {
    /// 📡 The URL of your cluster. Include scheme + port. Yes, all of it.
    #[serde(default = "default_url")]
    pub url: String,
    /// 🔒 Username for basic auth. Optional, like flossing.
    #[serde(default)]
    pub username: Option<String>,
    /// 🔒 Password. If this is in plaintext in your config file, I've already filed a complaint
    /// with the Department of Security Choices.
    #[serde(default)]
    pub password: Option<String>,
    /// 🔒 API key auth. Wins over basic auth when both are set.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// ⏱️ Per-request ceiling. Bulk bodies are meaty, so this is generous.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_url() -> String {
    "http://localhost:9200".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            username: None,
            password: None,
            api_key: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

// ===== wire shapes, straight from the cluster's mouth =====

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

/// 👋 `GET /`. Only the version matters to us.
#[derive(Debug, Deserialize)]
struct RootResponse {
    version: Option<RootVersion>,
}

#[derive(Debug, Deserialize)]
struct RootVersion {
    number: String,
    /// OpenSearch says so here. Elasticsearch leaves it out.
    distribution: Option<String>,
}

/// 🔢 Sorting a point-in-time on `_shard_doc` needs Elasticsearch 7.12 or newer.
/// Versions we can't read get the benefit of the doubt.
pub fn supports_shard_doc(version: &str) -> bool {
    let mut parts = version.split('.').map(|part| part.parse::<u32>());
    match (parts.next(), parts.next()) {
        (Some(Ok(major)), Some(Ok(minor))) => (major, minor) >= (7, 12),
        _ => true,
    }
}

#[derive(Debug, Deserialize)]
struct PitResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(rename = "_scroll_id", default)]
    scroll_id: Option<String>,
    #[serde(default)]
    pit_id: Option<String>,
    hits: HitsEnvelope,
}

#[derive(Debug, Deserialize)]
struct HitsEnvelope {
    #[serde(default)]
    total: Option<TotalHits>,
    #[serde(default)]
    hits: Vec<Hit>,
}

/// 🔢 7.x sends `{value, relation}`, 6.x sends a bare number. We take both.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TotalHits {
    Tracked {
        value: u64,
        #[serde(default)]
        relation: Option<String>,
    },
    Plain(u64),
}

impl TotalHits {
    /// Only an exact total is worth remembering. A `gte` lower bound would end the scan early.
    fn exact(&self) -> Option<u64> {
        match self {
            TotalHits::Tracked { value, relation } => match relation.as_deref() {
                None | Some("eq") => Some(*value),
                Some(_) => None,
            },
            TotalHits::Plain(value) => Some(*value),
        }
    }
}

#[derive(Debug, Deserialize)]
struct NodesBreakerResponse {
    #[serde(default)]
    nodes: BTreeMap<String, NodeBreakers>,
}

#[derive(Debug, Deserialize)]
struct NodeBreakers {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    breakers: BTreeMap<String, BreakerStats>,
}

#[derive(Debug, Deserialize)]
struct BreakerStats {
    #[serde(default)]
    estimated_size_in_bytes: u64,
    #[serde(default)]
    limit_size_in_bytes: i64,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    items: Vec<BTreeMap<String, BulkResponseItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkResponseItem {
    #[serde(rename = "_id", default)]
    id: Option<String>,
    #[serde(default)]
    status: u16,
    #[serde(default)]
    error: Option<Value>,
}

impl From<SearchResponse> for SearchPage {
    fn from(response: SearchResponse) -> Self {
        SearchPage {
            reported_total: response.hits.total.as_ref().and_then(TotalHits::exact),
            hits: response.hits.hits,
            token: response.pit_id.or(response.scroll_id),
        }
    }
}

/// 🧯 `{"type":"x","reason":"y"}` → `x: y`. Anything else gets stringified as-is.
fn describe_item_error(error: &Value) -> String {
    match (error.get("type").and_then(Value::as_str), error.get("reason").and_then(Value::as_str)) {
        (Some(kind), Some(reason)) => format!("{kind}: {reason}"),
        (Some(kind), None) => kind.to_string(),
        _ => error.to_string(),
    }
}

/// 📦 The HTTP-speaking half of jlx. One `reqwest::Client`, reused for everything,
/// because spinning up a client per request is the networking equivalent of buying a
/// new car every time you need groceries.
#[derive(Debug, Clone)]
pub struct ElasticsearchCluster {
    client: reqwest::Client,
    config: ClusterConfig,
}

impl ElasticsearchCluster {
    /// 🚀 Builds the client. Fails only if reqwest itself can't be born (TLS drama, usually).
    pub fn new(config: ClusterConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            // -- There is no retry. There is only this context string, and silence.
            .context("💀 The HTTP client refused to be born. The TLS stack wept. We tried to build a reqwest::Client and the universe said 'no'.")?;
        Ok(Self { client, config })
    }

    /// 📡 "Hello? Is this thing on?": fail loudly now rather than quietly 50,000 docs later.
    ///
    /// Returns the Elasticsearch version when the cluster tells us one. OpenSearch and
    /// anything that answers without a version come back as `None`.
    pub async fn ping(&self) -> Result<Option<String>> {
        let response = self
            .request(Method::GET, "")
            .send()
            .await
            .with_context(|| format!("💀 Could not reach the cluster at '{}'. Is it running? Is the URL right?", self.config.url))?;
        let status = response.status();
        debug!("📡 cluster at {} answered with {status}", self.config.url);
        ensure!(
            status.is_success(),
            "💀 the cluster at '{}' answered the hello with {status}. Credentials? Proxy? Wrong port?",
            self.config.url
        );
        // -- a proxy that says 200 with an HTML page is still a hello, just not a chatty one
        let version = response
            .json::<RootResponse>()
            .await
            .ok()
            .and_then(|root| root.version)
            .filter(|version| version.distribution.as_deref() != Some("opensearch"))
            .map(|version| version.number);
        Ok(version)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    /// 🔒 Same auth dance everywhere: api_key beats basic auth in this club.
    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut request = self.client.request(method, self.url(path));
        if let Some(ref api_key) = self.config.api_key {
            request = request.header("Authorization", format!("ApiKey {}", api_key));
        } else if let Some(ref username) = self.config.username {
            request = request.basic_auth(username, self.config.password.as_ref());
        }
        request
    }

    fn json_request(&self, method: Method, path: &str, body: &Value) -> RequestBuilder {
        self.request(method, path)
            .header("Content-Type", "application/json")
            .body(body.to_string())
    }

    /// 📬 Sends, classifies the status, decodes the body. The one place HTTP outcomes get judged.
    async fn call<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<T> {
        let response = request
            .send()
            .await
            .with_context(|| format!("💀 {what}: the request never made it to the cluster"))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .with_context(|| format!("💀 {what}: the response body evaporated mid-read"))?;

        if !status.is_success() {
            let text = String::from_utf8_lossy(&body).into_owned();
            if is_retryable_status(status.as_u16()) {
                return Err(anyhow::Error::new(TransientError::new(Some(status.as_u16()), text)))
                    .with_context(|| format!("⏳ {what}: cluster asked us to back off"));
            }
            anyhow::bail!("💀 {what}: cluster answered {status}. The body read: '{text}'");
        }

        trace!("📡 {what}: {} bytes back", body.len());
        serde_json::from_slice(&body)
            .with_context(|| format!("💀 {what}: response did not match the expected shape (protocol violation)"))
    }
}

#[async_trait]
impl Cluster for ElasticsearchCluster {
    async fn count(&self, index: &str) -> Result<u64> {
        let response: CountResponse = self
            .call(self.request(Method::GET, &format!("{index}/_count")), "count")
            .await?;
        Ok(response.count)
    }

    async fn open_point_in_time(&self, index: &str, keep_alive: &str) -> Result<String> {
        let response: PitResponse = self
            .call(
                self.request(Method::POST, &format!("{index}/_pit?keep_alive={keep_alive}")),
                "open point-in-time",
            )
            .await?;
        debug!("📍 opened point-in-time on '{index}'");
        Ok(response.id)
    }

    async fn search(&self, request: &SearchRequest<'_>) -> Result<SearchPage> {
        let (path, body) = match request.mode {
            PagingMode::PointInTime => {
                let pit_id = request
                    .token
                    .context("💀 point-in-time search without a point-in-time id")?;
                let mut body = json!({
                    "size": request.size,
                    "query": { "match_all": {} },
                    "pit": { "id": pit_id, "keep_alive": request.keep_alive },
                    "sort": [ { "_shard_doc": "asc" } ],
                });
                if !request.search_after.is_empty() {
                    body["search_after"] = Value::Array(request.search_after.to_vec());
                }
                ("_search".to_string(), body)
            }
            PagingMode::Scroll => (
                format!("{}/_search?scroll={}", request.index, request.keep_alive),
                json!({
                    "size": request.size,
                    "query": { "match_all": {} },
                    "sort": [ "_doc" ],
                }),
            ),
        };

        let response: SearchResponse = self
            .call(self.json_request(Method::POST, &path, &body), "search")
            .await?;
        Ok(response.into())
    }

    async fn refresh_cursor(&self, token: &str, keep_alive: &str) -> Result<SearchPage> {
        let body = json!({ "scroll": keep_alive, "scroll_id": token });
        let response: SearchResponse = self
            .call(self.json_request(Method::POST, "_search/scroll", &body), "scroll")
            .await?;
        Ok(response.into())
    }

    async fn release_cursor(&self, mode: PagingMode, token: &str) -> Result<()> {
        let (path, body) = match mode {
            PagingMode::PointInTime => ("_pit", json!({ "id": token })),
            PagingMode::Scroll => ("_search/scroll", json!({ "scroll_id": token })),
        };
        let _: Value = self
            .call(self.json_request(Method::DELETE, path, &body), "release cursor")
            .await?;
        Ok(())
    }

    async fn breaker_stats(&self) -> Result<Vec<BreakerSnapshot>> {
        let response: NodesBreakerResponse = self
            .call(self.request(Method::GET, "_nodes/stats/breaker"), "breaker stats")
            .await?;
        let snapshots = response
            .nodes
            .into_iter()
            .flat_map(|(node_id, node)| {
                let node_name = node.name.unwrap_or(node_id);
                node.breakers.into_iter().map(move |(breaker, stats)| {
                    BreakerSnapshot::new(
                        node_name.clone(),
                        breaker,
                        stats.estimated_size_in_bytes,
                        stats.limit_size_in_bytes,
                    )
                })
            })
            .collect();
        Ok(snapshots)
    }

    async fn bulk(&self, body: String) -> Result<Vec<BulkItemResult>> {
        // ⚠️ application/x-ndjson, not application/json. VERY important.
        let request = self
            .request(Method::POST, "_bulk")
            .header("Content-Type", "application/x-ndjson")
            .body(body);
        let response: BulkResponse = self.call(request, "bulk").await?;
        Ok(response
            .items
            .into_iter()
            .filter_map(|item| item.into_values().next())
            .map(|item| BulkItemResult {
                id: item.id,
                status: item.status,
                error: item.error.as_ref().map(describe_item_error),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_transient;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn cluster_for(server: &MockServer) -> Result<ElasticsearchCluster> {
        ElasticsearchCluster::new(ClusterConfig {
            url: server.uri(),
            ..ClusterConfig::default()
        })
    }

    #[tokio::test]
    async fn the_one_where_the_hello_gets_an_answer() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"version": {"number": "8.13.0"}})))
            .expect(1)
            .mount(&server)
            .await;

        assert_eq!(cluster_for(&server)?.ping().await?.as_deref(), Some("8.13.0"));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_opensearch_keeps_its_version_to_itself() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"version": {"distribution": "opensearch", "number": "2.11.0"}})),
            )
            .mount(&server)
            .await;

        assert_eq!(cluster_for(&server)?.ping().await?, None);
        Ok(())
    }

    #[test]
    fn the_one_where_shard_doc_arrived_in_seven_twelve() {
        assert!(!supports_shard_doc("7.10.2"));
        assert!(!supports_shard_doc("6.8.23"));
        assert!(supports_shard_doc("7.12.0"));
        assert!(supports_shard_doc("8.13.0"));
        assert!(supports_shard_doc("8.0.0-SNAPSHOT"));
        assert!(supports_shard_doc("banana"));
    }

    #[tokio::test]
    async fn the_one_where_bad_credentials_fail_the_hello() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = cluster_for(&server)?.ping().await.expect_err("401 is not hello");
        assert!(format!("{err:#}").contains("401"));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_count_comes_back_with_a_number() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/docs/_count"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"count": 2500})))
            .mount(&server)
            .await;

        assert_eq!(cluster_for(&server)?.count("docs").await?, 2500);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_point_in_time_search_carries_the_sort_key_forward() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/_search"))
            .and(body_partial_json(json!({
                "size": 2,
                "pit": {"id": "pit-a", "keep_alive": "5m"},
                "search_after": [41],
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "pit_id": "pit-b",
                "hits": {
                    "total": {"value": 3, "relation": "eq"},
                    "hits": [
                        {"_id": "x", "_index": "docs", "_source": {"n": 42}, "sort": [42]}
                    ]
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let search_after = [json!(41)];
        let page = cluster_for(&server)?
            .search(&SearchRequest {
                index: "docs",
                mode: PagingMode::PointInTime,
                size: 2,
                token: Some("pit-a"),
                search_after: &search_after,
                keep_alive: "5m",
            })
            .await?;

        assert_eq!(page.token.as_deref(), Some("pit-b"));
        assert_eq!(page.reported_total, Some(3));
        assert_eq!(page.hits.len(), 1);
        assert_eq!(page.hits[0].id, "x");
        assert_eq!(page.hits[0].sort, vec![json!(42)]);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_lower_bound_total_is_not_trusted() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/docs/_search"))
            .and(query_param("scroll", "5m"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "_scroll_id": "scroll-1",
                "hits": {"total": {"value": 10000, "relation": "gte"}, "hits": []}
            })))
            .mount(&server)
            .await;

        let page = cluster_for(&server)?
            .search(&SearchRequest {
                index: "docs",
                mode: PagingMode::Scroll,
                size: 100,
                token: None,
                search_after: &[],
                keep_alive: "5m",
            })
            .await?;
        assert_eq!(page.reported_total, None);
        assert_eq!(page.token.as_deref(), Some("scroll-1"));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_429_is_marked_transient() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/_search/scroll"))
            .respond_with(ResponseTemplate::new(429).set_body_string("circuit_breaking_exception"))
            .mount(&server)
            .await;

        let err = cluster_for(&server)?
            .refresh_cursor("scroll-1", "5m")
            .await
            .expect_err("429 must be an error");
        assert!(is_transient(&err), "429 should be retryable: {err:#}");
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_404_and_garbage_are_both_fatal() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing/_count"))
            .respond_with(ResponseTemplate::new(404).set_body_string("index_not_found_exception"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/garbled/_count"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>proxy says hi</html>"))
            .mount(&server)
            .await;

        let cluster = cluster_for(&server)?;
        let missing = cluster.count("missing").await.expect_err("404 must fail");
        assert!(!is_transient(&missing));
        let garbled = cluster.count("garbled").await.expect_err("html must fail");
        assert!(!is_transient(&garbled));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_breakers_from_every_node_are_flattened() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_nodes/stats/breaker"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "nodes": {
                    "abc": {"name": "node-1", "breakers": {
                        "parent": {"estimated_size_in_bytes": 900, "limit_size_in_bytes": 1000, "tripped": 0},
                        "request": {"estimated_size_in_bytes": 1000, "limit_size_in_bytes": 1000, "tripped": 3}
                    }},
                    "def": {"breakers": {
                        "accounting": {"estimated_size_in_bytes": 5, "limit_size_in_bytes": -1}
                    }}
                }
            })))
            .mount(&server)
            .await;

        let snapshots = cluster_for(&server)?.breaker_stats().await?;
        assert_eq!(snapshots.len(), 3);
        let request_breaker = snapshots
            .iter()
            .find(|s| s.breaker == "request")
            .context("request breaker missing")?;
        assert_eq!(request_breaker.node, "node-1");
        assert!(request_breaker.tripped);
        let accounting = snapshots
            .iter()
            .find(|s| s.breaker == "accounting")
            .context("accounting breaker missing")?;
        assert_eq!(accounting.node, "def", "nameless nodes fall back to their id");
        assert!(accounting.is_healthy());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_bulk_reports_every_item_and_uses_the_api_key() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .and(header("Content-Type", "application/x-ndjson"))
            .and(header("Authorization", "ApiKey s3cr3t"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errors": true,
                "items": [
                    {"index": {"_id": "a", "status": 201}},
                    {"index": {"_id": "b", "status": 400, "error": {"type": "mapper_parsing_exception", "reason": "bad field"}}}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let cluster = ElasticsearchCluster::new(ClusterConfig {
            url: server.uri(),
            api_key: Some("s3cr3t".into()),
            username: Some("ignored".into()),
            ..ClusterConfig::default()
        })?;
        let results = cluster.bulk("{\"index\":{}}\n{}\n".to_string()).await?;
        assert_eq!(results.len(), 2);
        assert!(results[0].is_success());
        assert_eq!(results[1].id.as_deref(), Some("b"));
        assert_eq!(results[1].error.as_deref(), Some("mapper_parsing_exception: bad field"));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_point_in_time_gets_opened_and_released() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/docs/_pit"))
            .and(query_param("keep_alive", "1m"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "pit-xyz"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/_pit"))
            .and(body_partial_json(json!({"id": "pit-xyz"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"succeeded": true, "num_freed": 1})))
            .expect(1)
            .mount(&server)
            .await;

        let cluster = cluster_for(&server)?;
        let pit = cluster.open_point_in_time("docs", "1m").await?;
        assert_eq!(pit, "pit-xyz");
        cluster.release_cursor(PagingMode::PointInTime, &pit).await?;
        Ok(())
    }
}
