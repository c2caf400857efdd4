//! USGS M2M client.
//!
//! Login-token authentication, scene search with a GeoJSON spatial filter,
//! and the download-options / download-request dance to obtain pre-signed
//! bundle URLs. Download URLs carry their own authorization, so no header is
//! exposed to the downloader.

use super::{ProductRef, Provider, SearchQuery};
use crate::config::ProviderEndpoints;
use crate::download::DownloadItem;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::RwLock;
use std::time::Duration;
use tracing::debug;

pub struct UsgsProvider {
    service_url: String,
    username: Option<String>,
    token: Option<String>,
    client: reqwest::Client,
    api_key: RwLock<Option<String>>,
}

impl UsgsProvider {
    pub fn new(endpoints: &ProviderEndpoints) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build USGS HTTP client")?;
        Ok(Self {
            service_url: format!("{}/", endpoints.usgs_service_url.trim_end_matches('/')),
            username: endpoints.usgs_username.clone(),
            token: endpoints.usgs_token.clone(),
            client,
            api_key: RwLock::new(None),
        })
    }

    async fn send_request(&self, endpoint: &str, data: serde_json::Value) -> Result<serde_json::Value> {
        let url = format!("{}{}", self.service_url, endpoint);
        let mut request = self.client.post(&url).json(&data);
        if let Some(key) = self.api_key.read().unwrap().clone() {
            request = request.header("X-Auth-Token", key);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("USGS request to {} failed", endpoint))?;
        if !response.status().is_success() {
            bail!("USGS {} returned {}", endpoint, response.status());
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .with_context(|| format!("Failed to parse USGS {} response", endpoint))?;
        if let Some(code) = payload.get("errorCode").filter(|c| !c.is_null()) {
            bail!(
                "USGS API error {}: {}",
                code,
                payload
                    .get("errorMessage")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown")
            );
        }
        Ok(payload.get("data").cloned().unwrap_or(serde_json::Value::Null))
    }
}

/// Extract `(entityId, productId)` pairs for available bundle products.
fn pick_bundle_downloads(options: &serde_json::Value) -> Vec<(String, String)> {
    let list = match options {
        serde_json::Value::Array(items) => items.as_slice(),
        serde_json::Value::Object(map) => map
            .get("options")
            .and_then(|v| v.as_array())
            .map(|v| v.as_slice())
            .unwrap_or(&[]),
        _ => &[],
    };

    list.iter()
        .filter_map(|item| {
            if !item.get("available").and_then(|v| v.as_bool()).unwrap_or(false) {
                return None;
            }
            let product_name = item.get("productName").and_then(|v| v.as_str()).unwrap_or("");
            if !product_name.contains("Bundle") {
                return None;
            }
            let entity = item.get("entityId").and_then(|v| v.as_str())?;
            let product = item.get("id").and_then(|v| v.as_str())?;
            Some((entity.to_string(), product.to_string()))
        })
        .collect()
}

/// Best-effort filename from a pre-signed URL path.
fn file_name_from_url(url: &str, fallback: &str) -> String {
    let path = url.split('?').next().unwrap_or(url);
    let name = path.rsplit('/').next().unwrap_or("");
    if !name.is_empty() && name.contains('.') {
        name.to_string()
    } else {
        fallback.to_string()
    }
}

#[async_trait]
impl Provider for UsgsProvider {
    fn name(&self) -> &str {
        "usgs"
    }

    async fn authenticate(&self) -> Result<()> {
        if self.api_key.read().unwrap().is_some() {
            return Ok(());
        }
        let (Some(username), Some(token)) = (&self.username, &self.token) else {
            bail!("USGS credentials are not configured.");
        };
        let data = self
            .send_request("login-token", json!({"username": username, "token": token}))
            .await?;
        let key = data
            .as_str()
            .ok_or_else(|| anyhow!("USGS login-token did not return an API key."))?;
        *self.api_key.write().unwrap() = Some(key.to_string());
        Ok(())
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<ProductRef>> {
        self.authenticate().await?;
        let aoi = query
            .aoi
            .as_ref()
            .ok_or_else(|| anyhow!("USGS search requires an AOI polygon."))?;

        let payload = json!({
            "datasetName": query.collection,
            "sceneFilter": {
                "spatialFilter": {
                    "filterType": "geojson",
                    "geoJson": aoi.to_geojson()?,
                },
                "acquisitionFilter": {
                    "start": query.start_date.to_string(),
                    "end": query.end_date.to_string(),
                },
            },
            "maxResults": 1000,
        });
        let data = self.send_request("scene-search", payload).await?;
        let scenes = data
            .get("results")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let products = scenes
            .iter()
            .filter_map(|scene| {
                let entity_id = scene.get("entityId").and_then(|v| v.as_str())?;
                let display_id = scene.get("displayId").and_then(|v| v.as_str()).unwrap_or("");
                if !query.product_type.is_empty() && !display_id.contains(&query.product_type) {
                    return None;
                }
                Some(ProductRef::new(entity_id, display_id))
            })
            .collect::<Vec<_>>();
        debug!("USGS scene search matched {} products", products.len());
        Ok(products)
    }

    async fn resolve(&self, collection: &str, product: &ProductRef) -> Result<Vec<DownloadItem>> {
        self.authenticate().await?;

        let options = self
            .send_request(
                "download-options",
                json!({"datasetName": collection, "entityIds": product.id}),
            )
            .await?;
        let downloads = pick_bundle_downloads(&options);
        if downloads.is_empty() {
            bail!("No downloadable bundle for USGS entity {}.", product.id);
        }

        let label = Utc::now().format("dl_%Y%m%d_%H%M%S").to_string();
        let request_payload = json!({
            "downloads": downloads
                .iter()
                .map(|(entity, product)| json!({"entityId": entity, "productId": product}))
                .collect::<Vec<_>>(),
            "label": label,
        });
        let result = self.send_request("download-request", request_payload).await?;
        let available = result
            .get("availableDownloads")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let items = available
            .iter()
            .enumerate()
            .filter_map(|(index, item)| {
                let url = item.get("url").and_then(|v| v.as_str())?;
                let fallback = format!("usgs_{}_{}.zip", collection, index);
                Some(DownloadItem {
                    url: url.to_string(),
                    file_name: file_name_from_url(url, &fallback),
                })
            })
            .collect::<Vec<_>>();
        if items.is_empty() {
            bail!("USGS download-request returned no immediate URLs for {}.", product.id);
        }
        Ok(items)
    }
}
