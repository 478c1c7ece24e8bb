//! DNS record inventory unit.
//!
//! Pulls all records of a zone through a page-numbered listing
//! endpoint (`result_info { page, total_pages }` envelope).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use driftwatch_core::{
    CanonicalRecord, Error, FetchContext, FieldValue, Page, PageCursor, PageSource, Result,
    ScopeConfig, SyncUnit, fetch_all,
};
use serde::Deserialize;

use crate::client::{ApiClientFactory, fetch_error};

pub const RESOURCE_TYPE: &str = "dns_record";

#[derive(Debug, Deserialize)]
struct Envelope {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiError>,
    #[serde(default)]
    result: Vec<serde_json::Value>,
    result_info: ResultInfo,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ResultInfo {
    page: u32,
    total_pages: u32,
}

#[derive(Debug, Deserialize)]
struct DnsRecordPayload {
    id: String,
    name: String,
    #[serde(rename = "type")]
    record_type: String,
    content: String,
    #[serde(default)]
    ttl: Option<i64>,
    #[serde(default)]
    proxied: Option<bool>,
}

pub struct DnsRecordUnit {
    factory: Arc<ApiClientFactory>,
}

impl DnsRecordUnit {
    pub fn new(factory: Arc<ApiClientFactory>) -> Self {
        Self { factory }
    }
}

struct DnsRecordPages {
    client: reqwest::Client,
    api_base: String,
    zone_id: String,
}

#[async_trait]
impl PageSource for DnsRecordPages {
    async fn list_page(&self, scope: &ScopeConfig, cursor: Option<&PageCursor>) -> Result<Page> {
        let page = cursor.and_then(|c| c.0.as_u64()).unwrap_or(1);
        let url = format!("{}/zones/{}/dns_records", self.api_base, self.zone_id);

        let resp = self
            .client
            .get(&url)
            .query(&[("page", page.to_string()), ("per_page", scope.page_size.to_string())])
            .send()
            .await
            .map_err(|e| fetch_error("list dns records", e))?;
        let envelope: Envelope = resp
            .json()
            .await
            .map_err(|e| fetch_error("decode dns record page", e))?;

        if !envelope.success {
            let message = envelope
                .errors
                .first()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "unknown api error".to_string());
            return Err(Error::BackendMessage(message));
        }

        Ok(Page {
            items: envelope.result,
            next_cursor: next_page_cursor(&envelope.result_info),
        })
    }
}

fn next_page_cursor(info: &ResultInfo) -> Option<PageCursor> {
    if info.page < info.total_pages {
        Some(PageCursor::new(serde_json::json!(info.page + 1)))
    } else {
        None
    }
}

#[async_trait]
impl SyncUnit for DnsRecordUnit {
    fn resource_type(&self) -> &str {
        RESOURCE_TYPE
    }

    #[tracing::instrument(level = "info", skip(self, ctx), fields(scope = %ctx.scope.scope))]
    async fn fetch(&self, ctx: &FetchContext<'_>) -> Result<Vec<serde_json::Value>> {
        let zone_id = ctx
            .scope
            .settings
            .get("zone_id")
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| {
                Error::InvalidInput("dns_record scope settings require zone_id".to_string())
            })?;

        let pages = DnsRecordPages {
            client: self.factory.client()?,
            api_base: self.factory.api_base().to_string(),
            zone_id: zone_id.to_string(),
        };
        fetch_all(&pages, ctx.scope, ctx.heartbeat).await
    }

    fn convert(
        &self,
        raw: &serde_json::Value,
        _scope: &ScopeConfig,
        collected_at: DateTime<Utc>,
    ) -> Result<CanonicalRecord> {
        let source_id = raw
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or("?")
            .to_string();
        let payload: DnsRecordPayload = serde_json::from_value(raw.clone())
            .map_err(|e| Error::conversion(RESOURCE_TYPE, &source_id, e.to_string()))?;

        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), FieldValue::Text(payload.name));
        fields.insert("record_type".to_string(), FieldValue::Text(payload.record_type));
        fields.insert("content".to_string(), FieldValue::Text(payload.content));
        fields.insert(
            "ttl".to_string(),
            payload.ttl.map(FieldValue::Int).unwrap_or(FieldValue::Null),
        );
        fields.insert(
            "proxied".to_string(),
            payload
                .proxied
                .map(FieldValue::Bool)
                .unwrap_or(FieldValue::Null),
        );

        CanonicalRecord::new(RESOURCE_TYPE, payload.id, fields, collected_at)
    }
}
