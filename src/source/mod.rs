//! External metrics sources.
//!
//! Each backend implements [`MetricsSource`] and translates its own response
//! format into [`HostMetrics`]. A host with nothing to report is a normal
//! outcome (`Ok(None)` or missing from the returned vec), never an error;
//! errors mean the source itself could not be queried. Adapters do not retry.

pub mod cmsys;
pub mod elasticsearch;

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{CmsysConfig, ElasticsearchConfig};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("source returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("source rejected query (code {code}): {message}")]
    Rejected { code: i64, message: String },

    #[error("failed to decode source response: {0}")]
    Decode(String),

    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("invalid source parameters: {0}")]
    InvalidParams(String),
}

/// Which external metrics backend a run or task targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[serde(alias = "es")]
    Elasticsearch,
    Cmsys,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Elasticsearch => "elasticsearch",
            SourceKind::Cmsys => "cmsys",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "elasticsearch" | "es" => Ok(SourceKind::Elasticsearch),
            "cmsys" => Ok(SourceKind::Cmsys),
            other => Err(SourceError::InvalidParams(format!(
                "unknown source kind '{}' (expected 'elasticsearch', 'es' or 'cmsys')",
                other
            ))),
        }
    }
}

/// Query window `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// The window ending now and reaching `minutes` back.
    pub fn last_minutes(minutes: i64) -> Self {
        let end = Utc::now();
        Self {
            start: end - Duration::minutes(minutes.max(1)),
            end,
        }
    }
}

/// Max / average / minimum of a utilization percentage over the window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Utilization {
    pub max: f64,
    pub avg: f64,
    pub min: f64,
}

/// Normalized per-host result from any source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostMetrics {
    pub address: String,
    pub host_name: Option<String>,
    pub cpu: Utilization,
    pub memory: Utilization,
    pub disk: Utilization,
    /// Number of samples the aggregates were computed from.
    pub points: u64,
}

/// Per-task overrides of the source defaults from the config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceParams {
    pub endpoint: Option<String>,
    pub index_pattern: Option<String>,
    pub time_range_minutes: Option<i64>,
    /// Free-form filter passed through to the inventory API.
    pub query: Option<String>,
}

/// Capability shared by every metrics backend.
#[async_trait::async_trait]
pub trait MetricsSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Metrics for one host, `None` if the source has no samples for it.
    async fn query_one(
        &self,
        address: &str,
        range: &TimeRange,
    ) -> Result<Option<HostMetrics>, SourceError>;

    /// Metrics for the hosts that have data; absent hosts are simply missing.
    async fn query_many(
        &self,
        addresses: &[String],
        range: &TimeRange,
    ) -> Result<Vec<HostMetrics>, SourceError>;

    /// Every host of `group` that has data in the window.
    async fn query_group(
        &self,
        group: &str,
        range: &TimeRange,
    ) -> Result<Vec<HostMetrics>, SourceError>;
}

/// Builds a source client for a kind and its per-task parameters.
pub trait SourceFactory: Send + Sync {
    fn create(
        &self,
        kind: SourceKind,
        params: &SourceParams,
    ) -> Result<Arc<dyn MetricsSource>, SourceError>;
}

/// Factory for the real HTTP-backed adapters.
pub struct HttpSourceFactory {
    elasticsearch: ElasticsearchConfig,
    cmsys: CmsysConfig,
}

impl HttpSourceFactory {
    pub fn new(elasticsearch: ElasticsearchConfig, cmsys: CmsysConfig) -> Self {
        Self {
            elasticsearch,
            cmsys,
        }
    }
}

impl SourceFactory for HttpSourceFactory {
    fn create(
        &self,
        kind: SourceKind,
        params: &SourceParams,
    ) -> Result<Arc<dyn MetricsSource>, SourceError> {
        match kind {
            SourceKind::Elasticsearch => Ok(Arc::new(
                elasticsearch::ElasticsearchSource::new(&self.elasticsearch, params)?,
            )),
            SourceKind::Cmsys => Ok(Arc::new(cmsys::CmsysSource::new(&self.cmsys, params)?)),
        }
    }
}

/// Requested addresses the source returned nothing for, in request order.
pub fn absent_addresses(requested: &[String], found: &[HostMetrics]) -> Vec<String> {
    let present: HashSet<&str> = found.iter().map(|m| m.address.as_str()).collect();
    requested
        .iter()
        .filter(|addr| !present.contains(addr.as_str()))
        .cloned()
        .collect()
}

fn build_client(timeout_secs: u64) -> Result<reqwest::Client, SourceError> {
    Ok(reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs.max(1)))
        .build()?)
}

fn normalize_endpoint(endpoint: &str) -> Result<String, SourceError> {
    let trimmed = endpoint.trim().trim_end_matches('/');
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(SourceError::InvalidParams(format!(
            "endpoint must be an http(s) URL, got '{}'",
            endpoint
        )));
    }
    Ok(trimmed.to_string())
}

async fn error_for_status(resp: reqwest::Response) -> Result<reqwest::Response, SourceError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(SourceError::Status {
        status: status.as_u16(),
        body: body.chars().take(512).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_kind_normalizes_aliases() {
        assert_eq!("es".parse::<SourceKind>().unwrap(), SourceKind::Elasticsearch);
        assert_eq!(
            " Elasticsearch ".parse::<SourceKind>().unwrap(),
            SourceKind::Elasticsearch
        );
        assert_eq!("CMSYS".parse::<SourceKind>().unwrap(), SourceKind::Cmsys);
        assert!("prometheus".parse::<SourceKind>().is_err());
    }

    #[test]
    fn test_source_kind_serde_accepts_alias() {
        let kind: SourceKind = serde_json::from_str("\"es\"").unwrap();
        assert_eq!(kind, SourceKind::Elasticsearch);
        assert_eq!(serde_json::to_string(&kind).unwrap(), "\"elasticsearch\"");
    }

    #[test]
    fn test_absent_addresses_is_set_difference() {
        let requested = vec!["10.0.0.1".to_string(), "10.0.0.2".to_string(), "10.0.0.3".to_string()];
        let found = vec![HostMetrics {
            address: "10.0.0.2".to_string(),
            host_name: None,
            cpu: Utilization::default(),
            memory: Utilization::default(),
            disk: Utilization::default(),
            points: 4,
        }];
        assert_eq!(absent_addresses(&requested, &found), vec!["10.0.0.1", "10.0.0.3"]);
    }

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(
            normalize_endpoint("http://es:9200/").unwrap(),
            "http://es:9200"
        );
        assert!(normalize_endpoint("es:9200").is_err());
    }

    #[test]
    fn test_time_range_window() {
        let range = TimeRange::last_minutes(30);
        assert_eq!((range.end - range.start).num_minutes(), 30);
    }
}
