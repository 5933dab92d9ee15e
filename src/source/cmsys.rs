//! Proprietary inventory-API source.
//!
//! `POST {endpoint}/api/v1/metrics/query` with either a host list or a group
//! name. The API wraps results in a `{code, message, data}` envelope; a
//! non-zero code is a rejected query, an empty `data` list means no data.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    build_client, error_for_status, normalize_endpoint, HostMetrics, MetricsSource, SourceError,
    SourceKind, SourceParams, TimeRange, Utilization,
};
use crate::config::CmsysConfig;

pub struct CmsysSource {
    client: reqwest::Client,
    query_url: String,
    api_token: Option<String>,
    query: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct QueryRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hosts: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<&'a str>,
    pub start: String,
    pub end: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
pub struct Envelope {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Vec<HostRow>,
}

#[derive(Debug, Deserialize)]
pub struct HostRow {
    pub ip: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub cpu: Option<Utilization>,
    #[serde(default)]
    pub mem: Option<Utilization>,
    #[serde(default)]
    pub disk: Option<Utilization>,
    #[serde(default)]
    pub points: u64,
}

impl CmsysSource {
    pub fn new(config: &CmsysConfig, params: &SourceParams) -> Result<Self, SourceError> {
        let endpoint = normalize_endpoint(params.endpoint.as_deref().unwrap_or(&config.endpoint))?;
        Ok(Self {
            client: build_client(config.request_timeout_secs)?,
            query_url: format!("{}/api/v1/metrics/query", endpoint),
            api_token: config.api_token.clone(),
            query: params.query.clone().filter(|q| !q.trim().is_empty()),
        })
    }

    async fn post(&self, body: &QueryRequest<'_>) -> Result<Vec<HostMetrics>, SourceError> {
        debug!(url = %self.query_url, hosts = ?body.hosts.map(|h| h.len()), group = ?body.group, "querying inventory API");

        let mut req = self.client.post(&self.query_url).json(body);
        if let Some(token) = &self.api_token {
            req = req.bearer_auth(token);
        }

        let resp = error_for_status(req.send().await?).await?;
        let envelope: Envelope = resp
            .json()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))?;
        parse_envelope(envelope)
    }

    fn request<'a>(
        &'a self,
        hosts: Option<&'a [String]>,
        group: Option<&'a str>,
        range: &TimeRange,
    ) -> QueryRequest<'a> {
        QueryRequest {
            hosts,
            group,
            start: range.start.to_rfc3339(),
            end: range.end.to_rfc3339(),
            query: self.query.as_deref(),
        }
    }
}

#[async_trait::async_trait]
impl MetricsSource for CmsysSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Cmsys
    }

    async fn query_one(
        &self,
        address: &str,
        range: &TimeRange,
    ) -> Result<Option<HostMetrics>, SourceError> {
        let hosts = [address.to_string()];
        let found = self.post(&self.request(Some(&hosts[..]), None, range)).await?;
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
        self.post(&self.request(Some(addresses), None, range)).await
    }

    async fn query_group(
        &self,
        group: &str,
        range: &TimeRange,
    ) -> Result<Vec<HostMetrics>, SourceError> {
        self.post(&self.request(None, Some(group), range)).await
    }
}

/// Unwrap the response envelope into normalized metrics. Rows with zero
/// points or no metric blocks at all are dropped as absent.
pub fn parse_envelope(envelope: Envelope) -> Result<Vec<HostMetrics>, SourceError> {
    if envelope.code != 0 {
        return Err(SourceError::Rejected {
            code: envelope.code,
            message: envelope.message,
        });
    }

    Ok(envelope
        .data
        .into_iter()
        .filter(|row| row.points > 0 && (row.cpu.is_some() || row.mem.is_some() || row.disk.is_some()))
        .map(|row| HostMetrics {
            address: row.ip.trim().to_string(),
            host_name: row.hostname.filter(|h| !h.trim().is_empty()),
            cpu: row.cpu.unwrap_or_default(),
            memory: row.mem.unwrap_or_default(),
            disk: row.disk.unwrap_or_default(),
            points: row.points,
        })
        .collect())
}
