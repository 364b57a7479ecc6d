//! TrueNAS Backend Gateway
//!
//! Implements the `BackendGateway` port against the TrueNAS REST API
//! (`/api/v2.0`). Datasets are returned as a tree and flattened; ZFS
//! properties arrive as `{value, rawvalue, parsed}` objects and are
//! decoded leniently. Items that cannot be decoded are skipped with a
//! debug log rather than failing the whole listing.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, instrument};

use crate::config::TrueNasConfig;
use crate::domain::ports::{BackendEntity, BackendGateway, PoolInfo};
use crate::error::{Error, Result};

const SYSTEM: &str = "truenas";
const API_PREFIX: &str = "/api/v2.0";

// =============================================================================
// Wire Types
// =============================================================================

/// A ZFS property as reported by TrueNAS
#[derive(Debug, Clone, Default, Deserialize)]
struct ZfsProperty {
    #[serde(default)]
    value: Option<serde_json::Value>,
    #[serde(default)]
    rawvalue: Option<serde_json::Value>,
    #[serde(default)]
    parsed: Option<serde_json::Value>,
}

impl ZfsProperty {
    fn candidates(&self) -> impl Iterator<Item = &serde_json::Value> {
        [&self.parsed, &self.rawvalue, &self.value]
            .into_iter()
            .flatten()
    }

    fn as_u64(&self) -> Option<u64> {
        self.candidates().find_map(json_u64)
    }

    fn as_string(&self) -> Option<String> {
        self.candidates().find_map(|v| match v {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        })
    }

    /// Creation times come as epoch seconds or as `{"$date": millis}`
    fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        self.candidates().find_map(|v| match v {
            serde_json::Value::Object(obj) => obj
                .get("$date")
                .and_then(json_u64)
                .and_then(|ms| Utc.timestamp_millis_opt(ms as i64).single()),
            other => json_u64(other).and_then(|s| Utc.timestamp_opt(s as i64, 0).single()),
        })
    }
}

fn json_u64(v: &serde_json::Value) -> Option<u64> {
    match v {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct RawDataset {
    id: String,
    #[serde(rename = "type", default)]
    dataset_type: Option<String>,
    #[serde(default)]
    pool: Option<String>,
    #[serde(default)]
    mountpoint: Option<String>,
    #[serde(default)]
    used: Option<ZfsProperty>,
    #[serde(default)]
    volsize: Option<ZfsProperty>,
    #[serde(default)]
    quota: Option<ZfsProperty>,
    #[serde(default)]
    creation: Option<ZfsProperty>,
    #[serde(default)]
    comments: Option<ZfsProperty>,
    #[serde(default)]
    user_properties: BTreeMap<String, ZfsProperty>,
    #[serde(default)]
    children: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawSnapshot {
    id: String,
    #[serde(default)]
    dataset: Option<String>,
    #[serde(default)]
    snapshot_name: Option<String>,
    #[serde(default)]
    properties: BTreeMap<String, ZfsProperty>,
}

#[derive(Debug, Deserialize)]
struct RawPool {
    name: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    healthy: Option<bool>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    allocated: Option<u64>,
    #[serde(default)]
    free: Option<u64>,
}

// =============================================================================
// Conversions
// =============================================================================

/// Flatten a dataset tree into volume entities, skipping malformed nodes
/// TrueNAS lists every dataset at the top level and again under its
/// parent's `children`, so entities are keyed by id.
fn flatten_datasets(
    items: Vec<serde_json::Value>,
    seen: &mut HashSet<String>,
    out: &mut Vec<BackendEntity>,
) {
    for item in items {
        let mut raw: RawDataset = match serde_json::from_value(item) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(error = %e, "Skipping malformed dataset");
                continue;
            }
        };
        let children = std::mem::take(&mut raw.children);
        if seen.insert(raw.id.clone()) {
            out.push(dataset_entity(raw));
        }
        flatten_datasets(children, seen, out);
    }
}

fn dataset_entity(raw: RawDataset) -> BackendEntity {
    let mut entity = BackendEntity::volume(raw.id);
    entity.used_bytes = raw.used.as_ref().and_then(ZfsProperty::as_u64).unwrap_or(0);
    entity.size_bytes = raw
        .volsize
        .as_ref()
        .or(raw.quota.as_ref())
        .and_then(ZfsProperty::as_u64)
        .unwrap_or(0);
    entity.created_at = raw.creation.as_ref().and_then(ZfsProperty::as_timestamp);

    let props = &mut entity.properties;
    if let Some(t) = raw.dataset_type {
        props.insert("type".into(), t);
    }
    if let Some(pool) = raw.pool {
        props.insert("pool".into(), pool);
    }
    if let Some(mp) = raw.mountpoint {
        props.insert("mountpoint".into(), mp);
    }
    if let Some(comments) = raw.comments.as_ref().and_then(ZfsProperty::as_string) {
        props.insert("comments".into(), comments);
    }
    for (key, prop) in &raw.user_properties {
        if let Some(v) = prop.as_string() {
            props.insert(key.clone(), v);
        }
    }
    entity
}

fn snapshot_entity(raw: RawSnapshot) -> BackendEntity {
    let mut entity = BackendEntity::snapshot(raw.id);
    if let Some(dataset) = raw.dataset {
        entity.dataset_path = dataset;
    }
    if let Some(name) = raw.snapshot_name {
        entity.name = name;
    }
    entity.created_at = raw.properties.get("creation").and_then(ZfsProperty::as_timestamp);
    entity.used_bytes = raw
        .properties
        .get("used")
        .and_then(ZfsProperty::as_u64)
        .unwrap_or(0);
    entity.size_bytes = raw
        .properties
        .get("referenced")
        .and_then(ZfsProperty::as_u64)
        .unwrap_or(0);
    entity
}

fn pool_info(raw: RawPool) -> PoolInfo {
    let status = raw.status.unwrap_or_else(|| "UNKNOWN".to_string());
    let size = raw.size.unwrap_or(0);
    let allocated = raw.allocated.unwrap_or(0);
    PoolInfo {
        healthy: raw.healthy.unwrap_or(status == "ONLINE"),
        name: raw.name,
        status,
        size_bytes: size,
        allocated_bytes: allocated,
        free_bytes: raw.free.unwrap_or_else(|| size.saturating_sub(allocated)),
    }
}

/// Decode a JSON array item by item, dropping items that do not fit `T`
fn decode_items<T: DeserializeOwned>(items: Vec<serde_json::Value>, what: &str) -> Vec<T> {
    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value(item) {
            Ok(v) => Some(v),
            Err(e) => {
                debug!(error = %e, "Skipping malformed {}", what);
                None
            }
        })
        .collect()
}

// =============================================================================
// Gateway
// =============================================================================

/// TrueNAS REST API client
pub struct TrueNasGateway {
    config: TrueNasConfig,
    client: Client,
    base_url: String,
}

impl TrueNasGateway {
    /// Create a new TrueNAS gateway
    pub fn new(config: TrueNasConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        let base_url = format!("{}{}", config.url.trim_end_matches('/'), API_PREFIX);
        Ok(Self {
            config,
            client,
            base_url,
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match (&self.config.api_key, &self.config.username) {
            (Some(key), _) if !key.is_empty() => request.bearer_auth(key),
            (_, Some(user)) => request.basic_auth(user, self.config.password.as_deref()),
            _ => request,
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, permission: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "Querying TrueNAS");

        let response = self.authorize(self.client.get(&url)).send().await?;
        let status = response.status();

        match status {
            s if s.is_success() => response
                .json()
                .await
                .map_err(|e| Error::BackendResponseParse(format!("{}: {}", path, e))),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::Unauthorized {
                system: SYSTEM.to_string(),
                permission: permission.to_string(),
            }),
            StatusCode::NOT_FOUND => Err(Error::ResourceNotFound {
                kind: "endpoint".to_string(),
                name: path.to_string(),
            }),
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(Error::BackendApi {
                    status: status.as_u16(),
                    message: truncate(&body, 256),
                })
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

#[async_trait]
impl BackendGateway for TrueNasGateway {
    #[instrument(skip(self))]
    async fn list_volumes(&self) -> Result<Vec<BackendEntity>> {
        let items: Vec<serde_json::Value> = self.get("/pool/dataset", "read datasets").await?;
        let mut volumes = Vec::new();
        flatten_datasets(items, &mut HashSet::new(), &mut volumes);
        debug!(count = volumes.len(), "Listed TrueNAS datasets");
        Ok(volumes)
    }

    #[instrument(skip(self))]
    async fn list_snapshots(&self) -> Result<Vec<BackendEntity>> {
        let items: Vec<serde_json::Value> = self.get("/zfs/snapshot", "read snapshots").await?;
        let snapshots: Vec<_> = decode_items::<RawSnapshot>(items, "snapshot")
            .into_iter()
            .map(snapshot_entity)
            .collect();
        debug!(count = snapshots.len(), "Listed TrueNAS snapshots");
        Ok(snapshots)
    }

    #[instrument(skip(self))]
    async fn list_pools(&self) -> Result<Vec<PoolInfo>> {
        let items: Vec<serde_json::Value> = self.get("/pool", "read pools").await?;
        let pools: Vec<_> = decode_items::<RawPool>(items, "pool")
            .into_iter()
            .map(pool_info)
            .collect();
        debug!(count = pools.len(), "Listed TrueNAS pools");
        Ok(pools)
    }

    #[instrument(skip(self))]
    async fn test_connection(&self) -> Result<()> {
        let _: serde_json::Value = self.get("/auth/me", "authenticate").await?;
        debug!(url = %self.config.url, "TrueNAS API reachable");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::BackendKind;

    #[test]
    fn test_flatten_dataset_tree() {
        let tree = serde_json::json!([
            {
                "id": "tank",
                "type": "FILESYSTEM",
                "pool": "tank",
                "children": [
                    {
                        "id": "tank/k8s",
                        "type": "FILESYSTEM",
                        "children": [
                            {
                                "id": "tank/k8s/pvc-1",
                                "type": "VOLUME",
                                "used": {"parsed": 1024, "rawvalue": "1024", "value": "1K"},
                                "volsize": {"parsed": 10737418240u64},
                                "creation": {"parsed": {"$date": 1700000000000u64}},
                                "user_properties": {
                                    "democratic-csi:csi_volume_name": {"value": "pvc-1"}
                                },
                                "children": []
                            },
                            {"type": "VOLUME", "children": []}
                        ]
                    }
                ]
            }
        ]);

        let items: Vec<serde_json::Value> = serde_json::from_value(tree).unwrap();
        let mut out = Vec::new();
        flatten_datasets(items, &mut HashSet::new(), &mut out);

        let names: Vec<_> = out.iter().map(|e| e.full_name.as_str()).collect();
        assert_eq!(names, vec!["tank", "tank/k8s", "tank/k8s/pvc-1"]);

        let pvc = &out[2];
        assert_eq!(pvc.kind, BackendKind::Volume);
        assert_eq!(pvc.name, "pvc-1");
        assert_eq!(pvc.used_bytes, 1024);
        assert_eq!(pvc.size_bytes, 10737418240);
        assert_eq!(pvc.created_at.unwrap().timestamp(), 1_700_000_000);
        assert_eq!(
            pvc.properties.get("democratic-csi:csi_volume_name").map(String::as_str),
            Some("pvc-1")
        );
        assert!(out[0].created_at.is_none());
    }

    #[test]
    fn test_flatten_skips_datasets_listed_twice() {
        let listing = serde_json::json!([
            {"id": "tank/k8s", "children": [{"id": "tank/k8s/pvc-1", "children": []}]},
            {"id": "tank/k8s/pvc-1", "children": []}
        ]);

        let items: Vec<serde_json::Value> = serde_json::from_value(listing).unwrap();
        let mut out = Vec::new();
        flatten_datasets(items, &mut HashSet::new(), &mut out);

        let names: Vec<_> = out.iter().map(|e| e.full_name.as_str()).collect();
        assert_eq!(names, vec!["tank/k8s", "tank/k8s/pvc-1"]);
    }

    #[test]
    fn test_snapshot_entity() {
        let raw: RawSnapshot = serde_json::from_value(serde_json::json!({
            "id": "tank/ds@snap1",
            "dataset": "tank/ds",
            "snapshot_name": "snap1",
            "properties": {
                "creation": {"value": "1700000000"},
                "used": {"value": "4096"},
                "referenced": {"rawvalue": "8192"}
            }
        }))
        .unwrap();

        let snap = snapshot_entity(raw);
        assert_eq!(snap.kind, BackendKind::Snapshot);
        assert_eq!(snap.name, "snap1");
        assert_eq!(snap.dataset_path, "tank/ds");
        assert_eq!(snap.created_at.unwrap().timestamp(), 1_700_000_000);
        assert_eq!(snap.used_bytes, 4096);
        assert_eq!(snap.size_bytes, 8192);
    }

    #[test]
    fn test_decode_skips_malformed() {
        let items = vec![
            serde_json::json!({"id": "tank/a@1"}),
            serde_json::json!({"name": "missing id"}),
            serde_json::json!("garbage"),
        ];
        let snaps = decode_items::<RawSnapshot>(items, "snapshot");
        assert_eq!(snaps.len(), 1);
    }

    #[test]
    fn test_pool_info() {
        let raw: RawPool = serde_json::from_value(serde_json::json!({
            "name": "tank",
            "status": "ONLINE",
            "size": 1000,
            "allocated": 400
        }))
        .unwrap();
        let pool = pool_info(raw);
        assert!(pool.healthy);
        assert_eq!(pool.free_bytes, 600);

        let raw: RawPool = serde_json::from_value(serde_json::json!({
            "name": "scratch",
            "status": "DEGRADED",
            "healthy": false
        }))
        .unwrap();
        assert!(!pool_info(raw).healthy);
    }

    #[test]
    fn test_base_url_and_truncate() {
        let config = TrueNasConfig {
            url: "https://nas.local/".into(),
            api_key: Some("key".into()),
            ..Default::default()
        };
        let gateway = TrueNasGateway::new(config).unwrap();
        assert_eq!(gateway.base_url, "https://nas.local/api/v2.0");

        assert_eq!(truncate("abcdef", 3), "abc...");
        assert_eq!(truncate("ab", 3), "ab");
    }
}
