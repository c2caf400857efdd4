//! Copernicus Data Space client.
//!
//! OAuth password grant against the CDSE identity service, OData catalogue
//! search, zipper download URLs. The token is cached and re-fetched on 401
//! via the downloader's refresh hook.

use super::{ProductRef, Provider, SearchQuery};
use crate::config::ProviderEndpoints;
use crate::download::DownloadItem;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::sync::RwLock;
use std::time::Duration;
use tracing::debug;

pub struct CopernicusProvider {
    base_url: String,
    token_url: String,
    download_url: String,
    username: Option<String>,
    password: Option<String>,
    client: reqwest::Client,
    token: RwLock<Option<String>>,
}

impl CopernicusProvider {
    pub fn new(endpoints: &ProviderEndpoints) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build Copernicus HTTP client")?;
        Ok(Self {
            base_url: endpoints.copernicus_base_url.trim_end_matches('/').to_string(),
            token_url: endpoints.copernicus_token_url.clone(),
            download_url: endpoints
                .copernicus_download_url
                .trim_end_matches('/')
                .to_string(),
            username: endpoints.copernicus_username.clone(),
            password: endpoints.copernicus_password.clone(),
            client,
            token: RwLock::new(None),
        })
    }

    async fn fetch_token(&self) -> Result<String> {
        let (Some(username), Some(password)) = (&self.username, &self.password) else {
            bail!("Copernicus credentials are not configured.");
        };

        let params = [
            ("client_id", "cdse-public"),
            ("username", username.as_str()),
            ("password", password.as_str()),
            ("grant_type", "password"),
        ];
        let response = self
            .client
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .context("Copernicus token request failed")?;
        if !response.status().is_success() {
            bail!("Copernicus token endpoint returned {}", response.status());
        }
        let payload: serde_json::Value = response
            .json()
            .await
            .context("Failed to parse Copernicus token response")?;
        let token = payload
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("Copernicus token endpoint did not return access_token."))?;

        let header = format!("Bearer {}", token);
        *self.token.write().unwrap() = Some(header.clone());
        Ok(header)
    }

    fn build_filter(&self, query: &SearchQuery) -> String {
        let mut filter = format!(
            "Collection/Name eq '{}' and ContentDate/Start gt '{}T00:00:00Z' \
             and ContentDate/Start lt '{}T23:59:59Z'",
            query.collection, query.start_date, query.end_date
        );

        if !query.product_type.is_empty() {
            filter.push_str(&format!(
                " and Attributes/OData.CSC.StringAttribute/any(\
                 att:att/Name eq 'productType' and \
                 att/OData.CSC.StringAttribute/Value eq '{}')",
                query.product_type
            ));
        }
        if let Some(tile_id) = &query.tile_id {
            filter.push_str(&format!(
                " and Attributes/OData.CSC.StringAttribute/any(\
                 att:att/Name eq 'tileId' and \
                 att/OData.CSC.StringAttribute/Value eq '{}')",
                tile_id
            ));
        }
        if let Some(aoi) = &query.aoi {
            filter.push_str(&format!(
                " and OData.CSC.Intersects(area=geography'SRID=4326;{}')",
                aoi.as_wkt()
            ));
        }
        filter
    }
}

#[async_trait]
impl Provider for CopernicusProvider {
    fn name(&self) -> &str {
        "copernicus"
    }

    async fn authenticate(&self) -> Result<()> {
        if self.token.read().unwrap().is_some() {
            return Ok(());
        }
        self.fetch_token().await?;
        Ok(())
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<ProductRef>> {
        self.authenticate().await?;
        let auth = self
            .authorization()
            .ok_or_else(|| anyhow!("Copernicus token missing after authentication."))?;

        let url = format!("{}/odata/v1/Products", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("$filter", self.build_filter(query).as_str()),
                ("$orderby", "ContentDate/Start desc"),
                ("$top", "1000"),
            ])
            .header(reqwest::header::AUTHORIZATION, auth)
            .send()
            .await
            .context("Copernicus catalogue request failed")?;
        if !response.status().is_success() {
            bail!("Copernicus catalogue returned {}", response.status());
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .context("Failed to parse Copernicus catalogue response")?;
        let values = payload
            .get("value")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let products = values
            .iter()
            .filter_map(|item| {
                let id = item.get("Id").and_then(|v| v.as_str())?;
                let name = item.get("Name").and_then(|v| v.as_str()).unwrap_or(id);
                Some(ProductRef::new(id, name))
            })
            .collect::<Vec<_>>();
        debug!("Copernicus search matched {} products", products.len());
        Ok(products)
    }

    async fn resolve(&self, _collection: &str, product: &ProductRef) -> Result<Vec<DownloadItem>> {
        let url = format!("{}/odata/v1/Products({})/$value", self.download_url, product.id);
        let mut file_name = if product.title.is_empty() {
            product.id.clone()
        } else {
            product.title.clone()
        };
        if !file_name.to_ascii_lowercase().ends_with(".zip") {
            file_name.push_str(".zip");
        }
        Ok(vec![DownloadItem { url, file_name }])
    }

    fn authorization(&self) -> Option<String> {
        self.token.read().unwrap().clone()
    }

    async fn refresh_token(&self) -> Result<Option<String>> {
        Ok(Some(self.fetch_token().await?))
    }
}
