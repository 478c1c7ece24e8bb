//! Compute inventory units: servers and the volumes attached to them.
//!
//! Servers page with an opaque string cursor. Volumes are a dependent
//! type: their fetch walks the server identities already committed to
//! the snapshot store rather than re-listing servers remotely.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use driftwatch_core::{
    CanonicalRecord, Error, FetchContext, FieldValue, ListQuery, Page, PageCursor, PageSource,
    Result, ScopeConfig, SyncUnit, fetch_all,
};
use serde::{Deserialize, Serialize};

use crate::client::{ApiClientFactory, fetch_error};

pub const SERVER_TYPE: &str = "server";
pub const VOLUME_TYPE: &str = "volume";

#[derive(Debug, Deserialize)]
struct CursorPage {
    #[serde(default)]
    items: Vec<serde_json::Value>,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ServerPayload {
    id: String,
    name: String,
    status: String,
    flavor: String,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct VolumePayload {
    id: String,
    server_id: String,
    name: String,
    status: String,
    size_gb: i64,
    #[serde(default)]
    attachments: Vec<AttachmentPayload>,
}

#[derive(Debug, Deserialize, Serialize)]
struct AttachmentPayload {
    id: String,
    device: String,
}

pub struct ServerUnit {
    factory: Arc<ApiClientFactory>,
}

impl ServerUnit {
    pub fn new(factory: Arc<ApiClientFactory>) -> Self {
        Self { factory }
    }
}

struct ServerPages {
    client: reqwest::Client,
    api_base: String,
}

#[async_trait]
impl PageSource for ServerPages {
    async fn list_page(&self, scope: &ScopeConfig, cursor: Option<&PageCursor>) -> Result<Page> {
        let url = format!("{}/v1/projects/{}/servers", self.api_base, scope.scope);
        let mut req = self
            .client
            .get(&url)
            .query(&[("limit", scope.page_size.to_string())]);
        if let Some(c) = cursor.and_then(|c| c.0.as_str()) {
            req = req.query(&[("cursor", c)]);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| fetch_error("list servers", e))?
            .error_for_status()
            .map_err(|e| fetch_error("list servers", e))?;
        let page: CursorPage = resp
            .json()
            .await
            .map_err(|e| fetch_error("decode server page", e))?;

        Ok(Page {
            items: page.items,
            next_cursor: page
                .next_cursor
                .map(|c| PageCursor::new(serde_json::json!(c))),
        })
    }
}

#[async_trait]
impl SyncUnit for ServerUnit {
    fn resource_type(&self) -> &str {
        SERVER_TYPE
    }

    #[tracing::instrument(level = "info", skip(self, ctx), fields(scope = %ctx.scope.scope))]
    async fn fetch(&self, ctx: &FetchContext<'_>) -> Result<Vec<serde_json::Value>> {
        let pages = ServerPages {
            client: self.factory.client()?,
            api_base: self.factory.api_base().to_string(),
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
        let payload: ServerPayload = serde_json::from_value(raw.clone())
            .map_err(|e| Error::conversion(SERVER_TYPE, &source_id, e.to_string()))?;

        // Upstream tag ordering is unstable; sort so reorders do not
        // register as changes.
        let mut tags = payload.tags;
        tags.sort();

        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), FieldValue::Text(payload.name));
        fields.insert("status".to_string(), FieldValue::Text(payload.status));
        fields.insert("flavor".to_string(), FieldValue::Text(payload.flavor));
        fields.insert("image".to_string(), FieldValue::opt_text(payload.image));
        fields.insert("tags".to_string(), FieldValue::blob(&tags)?);

        CanonicalRecord::new(SERVER_TYPE, payload.id, fields, collected_at)
    }
}

/// Volumes hang off servers; the set of parents comes from the
/// snapshot store, so this unit declares a dependency on `server`.
pub struct VolumeUnit {
    factory: Arc<ApiClientFactory>,
}

impl VolumeUnit {
    pub fn new(factory: Arc<ApiClientFactory>) -> Self {
        Self { factory }
    }

    async fn server_ids(&self, ctx: &FetchContext<'_>) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut query = ListQuery::default();
        loop {
            let batch = ctx.store.list_snapshots(SERVER_TYPE, query).await?;
            let len = batch.len();
            ids.extend(batch.into_iter().map(|s| s.resource_id));
            if len < query.limit {
                return Ok(ids);
            }
            query.offset += query.limit;
        }
    }
}

#[async_trait]
impl SyncUnit for VolumeUnit {
    fn resource_type(&self) -> &str {
        VOLUME_TYPE
    }

    fn depends_on(&self) -> Vec<String> {
        vec![SERVER_TYPE.to_string()]
    }

    #[tracing::instrument(level = "info", skip(self, ctx), fields(scope = %ctx.scope.scope))]
    async fn fetch(&self, ctx: &FetchContext<'_>) -> Result<Vec<serde_json::Value>> {
        let client = self.factory.client()?;
        let mut all = Vec::new();
        for server_id in self.server_ids(ctx).await? {
            let url = format!(
                "{}/v1/projects/{}/servers/{}/volumes",
                self.factory.api_base(),
                ctx.scope.scope,
                server_id
            );
            let resp = client
                .get(&url)
                .send()
                .await
                .map_err(|e| fetch_error("list volumes", e))?
                .error_for_status()
                .map_err(|e| fetch_error("list volumes", e))?;
            let items: Vec<serde_json::Value> = resp
                .json()
                .await
                .map_err(|e| fetch_error("decode volume list", e))?;

            // Stamp the parent onto each raw item so convert stays
            // pure and needs no store access.
            for mut item in items {
                if let Some(obj) = item.as_object_mut() {
                    obj.insert(
                        "server_id".to_string(),
                        serde_json::json!(server_id.clone()),
                    );
                }
                all.push(item);
            }
            if let Some(hb) = ctx.heartbeat {
                hb.beat();
            }
        }
        Ok(all)
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
        let payload: VolumePayload = serde_json::from_value(raw.clone())
            .map_err(|e| Error::conversion(VOLUME_TYPE, &source_id, e.to_string()))?;

        let attachments = payload
            .attachments
            .into_iter()
            .map(|a| (a.id.clone(), a));

        let mut fields = BTreeMap::new();
        fields.insert("server_id".to_string(), FieldValue::Text(payload.server_id));
        fields.insert("name".to_string(), FieldValue::Text(payload.name));
        fields.insert("status".to_string(), FieldValue::Text(payload.status));
        fields.insert("size_gb".to_string(), FieldValue::Int(payload.size_gb));
        fields.insert("attachments".to_string(), FieldValue::keyed(attachments)?);

        CanonicalRecord::new(VOLUME_TYPE, payload.id, fields, collected_at)
    }
}
