//! Search/aggregation-index source.
//!
//! One `_search` request per query with `size: 0`: a `terms` aggregation on
//! the host address field with `stats` sub-aggregations for CPU, memory and
//! disk. Hosts without documents in the window produce no bucket, which is
//! how absence is detected.

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{
    build_client, error_for_status, normalize_endpoint, HostMetrics, MetricsSource, SourceError,
    SourceKind, SourceParams, TimeRange, Utilization,
};
use crate::config::{ElasticsearchConfig, ElasticsearchFields};

/// Upper bound on buckets returned for a group query.
const MAX_GROUP_BUCKETS: usize = 10_000;

pub struct ElasticsearchSource {
    client: reqwest::Client,
    search_url: String,
    username: Option<String>,
    password: Option<String>,
    value_scale: f64,
    fields: ElasticsearchFields,
}

/// Which documents a search covers.
#[derive(Debug, Clone, Copy)]
pub enum Filter<'a> {
    Hosts(&'a [String]),
    Group(&'a str),
}

impl ElasticsearchSource {
    pub fn new(config: &ElasticsearchConfig, params: &SourceParams) -> Result<Self, SourceError> {
        let endpoint = normalize_endpoint(params.endpoint.as_deref().unwrap_or(&config.endpoint))?;
        let index = params
            .index_pattern
            .as_deref()
            .unwrap_or(&config.index_pattern)
            .trim();
        if index.is_empty() {
            return Err(SourceError::InvalidParams(
                "index pattern must not be empty".to_string(),
            ));
        }

        Ok(Self {
            client: build_client(config.request_timeout_secs)?,
            search_url: format!("{}/{}/_search", endpoint, index),
            username: config.username.clone(),
            password: config.password.clone(),
            value_scale: config.value_scale,
            fields: config.fields.clone(),
        })
    }

    async fn search(&self, filter: Filter<'_>, range: &TimeRange) -> Result<Vec<HostMetrics>, SourceError> {
        let body = build_query(&self.fields, filter, range);
        debug!(url = %self.search_url, ?filter, "querying search index");

        let mut req = self.client.post(&self.search_url).json(&body);
        if let Some(user) = &self.username {
            req = req.basic_auth(user, self.password.as_deref());
        }

        let resp = error_for_status(req.send().await?).await?;
        let parsed: SearchResponse = resp
            .json()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))?;
        Ok(parse_response(parsed, self.value_scale))
    }
}

#[async_trait::async_trait]
impl MetricsSource for ElasticsearchSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Elasticsearch
    }

    async fn query_one(
        &self,
        address: &str,
        range: &TimeRange,
    ) -> Result<Option<HostMetrics>, SourceError> {
        let addresses = [address.to_string()];
        let found = self.search(Filter::Hosts(&addresses), range).await?;
        Ok(found.into_iter().find(|m| m.address == address))
    }

    async fn query_many(
        &self,
        addresses: &[String],
        range: &TimeRange,
    ) -> Result<Vec<HostMetrics>, SourceError> {
        if addresses.is_empty() {
            return Ok(Vec::new());
        }
        self.search(Filter::Hosts(addresses), range).await
    }

    async fn query_group(
        &self,
        group: &str,
        range: &TimeRange,
    ) -> Result<Vec<HostMetrics>, SourceError> {
        self.search(Filter::Group(group), range).await
    }
}

/// Build the aggregation request body.
pub fn build_query(fields: &ElasticsearchFields, filter: Filter<'_>, range: &TimeRange) -> Value {
    let (selector, bucket_count) = match filter {
        Filter::Hosts(addresses) => (
            json!({ "terms": { fields.host_address.as_str(): addresses } }),
            addresses.len().max(1),
        ),
        Filter::Group(group) => (
            json!({ "term": { fields.group.as_str(): group } }),
            MAX_GROUP_BUCKETS,
        ),
    };

    json!({
        "size": 0,
        "query": {
            "bool": {
                "filter": [
                    selector,
                    {
                        "range": {
                            fields.timestamp.as_str(): {
                                "gte": range.start.to_rfc3339(),
                                "lte": range.end.to_rfc3339(),
                                "format": "strict_date_optional_time"
                            }
                        }
                    }
                ]
            }
        },
        "aggs": {
            "hosts": {
                "terms": { "field": fields.host_address.as_str(), "size": bucket_count },
                "aggs": {
                    "host_name": { "terms": { "field": fields.host_name.as_str(), "size": 1 } },
                    "cpu": { "stats": { "field": fields.cpu.as_str() } },
                    "mem": { "stats": { "field": fields.memory.as_str() } },
                    "disk": { "stats": { "field": fields.disk.as_str() } }
                }
            }
        }
    })
}

#[derive(Debug, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub aggregations: Option<Aggregations>,
}

#[derive(Debug, Deserialize)]
pub struct Aggregations {
    pub hosts: Buckets<HostBucket>,
}

#[derive(Debug, Deserialize)]
pub struct Buckets<T> {
    #[serde(default = "Vec::new")]
    pub buckets: Vec<T>,
}

#[derive(Debug, Deserialize)]
pub struct HostBucket {
    pub key: String,
    pub doc_count: u64,
    #[serde(default)]
    pub host_name: Option<Buckets<NameBucket>>,
    #[serde(default)]
    pub cpu: Stats,
    #[serde(default)]
    pub mem: Stats,
    #[serde(default)]
    pub disk: Stats,
}

#[derive(Debug, Deserialize)]
pub struct NameBucket {
    pub key: String,
}

/// `stats` aggregation output; min/max/avg are null when count is 0.
#[derive(Debug, Default, Deserialize)]
pub struct Stats {
    #[serde(default)]
    pub count: u64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub avg: Option<f64>,
}

impl Stats {
    fn scaled(&self, scale: f64) -> Utilization {
        Utilization {
            max: self.max.unwrap_or(0.0) * scale,
            avg: self.avg.unwrap_or(0.0) * scale,
            min: self.min.unwrap_or(0.0) * scale,
        }
    }
}

/// Translate the aggregation response. Buckets with no samples in any
/// metric are dropped so they read as absent.
pub fn parse_response(resp: SearchResponse, value_scale: f64) -> Vec<HostMetrics> {
    let Some(aggs) = resp.aggregations else {
        return Vec::new();
    };

    aggs.hosts
        .buckets
        .into_iter()
        .filter_map(|b| {
            let points = b.cpu.count.max(b.mem.count).max(b.disk.count);
            if b.doc_count == 0 || points == 0 {
                return None;
            }
            let host_name = b
                .host_name
                .and_then(|n| n.buckets.into_iter().next())
                .map(|n| n.key)
                .filter(|n| !n.is_empty());
            Some(HostMetrics {
                address: b.key,
                host_name,
                cpu: b.cpu.scaled(value_scale),
                memory: b.mem.scaled(value_scale),
                disk: b.disk.scaled(value_scale),
                points,
            })
        })
        .collect()
}
