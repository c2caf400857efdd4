//! Provider abstraction and registry.
//!
//! A provider knows how to authenticate against an external catalogue,
//! search it for products and resolve a product into concrete download URLs
//! with filename hints. Everything beyond that capability set (query dialects,
//! pagination quirks) stays inside the concrete clients.

pub mod copernicus;
pub mod static_provider;
pub mod usgs;

pub use copernicus::CopernicusProvider;
pub use static_provider::StaticProvider;
pub use usgs::UsgsProvider;

use crate::download::{AuthSource, DownloadItem};
use crate::geometry::Aoi;
use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::Arc;

/// Search parameters handed to a provider. The AOI is pre-validated and
/// normalized to WKT; `collection` doubles as the dataset context for
/// product resolution.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub collection: String,
    pub product_type: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub aoi: Option<Aoi>,
    pub tile_id: Option<String>,
}

/// One provider-defined acquisition unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductRef {
    pub id: String,
    pub title: String,
}

impl ProductRef {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
        }
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Make sure credentials are usable. Idempotent; called once per job
    /// before any search or resolve.
    async fn authenticate(&self) -> Result<()>;

    async fn search(&self, query: &SearchQuery) -> Result<Vec<ProductRef>>;

    /// Resolve one product (within the given collection context) into
    /// download URLs and filename hints.
    async fn resolve(&self, collection: &str, product: &ProductRef) -> Result<Vec<DownloadItem>>;

    /// Current `Authorization` header value for downloads, if any.
    fn authorization(&self) -> Option<String> {
        None
    }

    /// Obtain a fresh `Authorization` value after a 401. `None` means this
    /// provider cannot refresh.
    async fn refresh_token(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

/// String-keyed registry of provider instances, built once at startup.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers
            .insert(provider.name().to_ascii_lowercase(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(&name.to_ascii_lowercase()).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Adapter exposing a provider's auth capability to the downloader.
pub struct ProviderAuth(pub Arc<dyn Provider>);

#[async_trait]
impl AuthSource for ProviderAuth {
    fn authorization(&self) -> Option<String> {
        self.0.authorization()
    }

    async fn refresh(&self) -> Result<Option<String>> {
        self.0.refresh_token().await
    }
}
