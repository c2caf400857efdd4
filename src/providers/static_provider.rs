//! Canned provider for tests and local development.
//!
//! Serves a fixed product list and fixed download URLs under any registered
//! name, so the whole pipeline can run against a local file server without
//! real credentials.

use super::{ProductRef, Provider, SearchQuery};
use crate::download::DownloadItem;
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;

#[derive(Default)]
pub struct StaticProvider {
    name: String,
    products: Vec<ProductRef>,
    files: HashMap<String, Vec<DownloadItem>>,
}

impl StaticProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            products: Vec::new(),
            files: HashMap::new(),
        }
    }

    /// Add a product and the files it resolves to.
    pub fn with_product(mut self, product: ProductRef, files: Vec<DownloadItem>) -> Self {
        self.files.insert(product.id.clone(), files);
        self.products.push(product);
        self
    }
}

#[async_trait]
impl Provider for StaticProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn authenticate(&self) -> Result<()> {
        Ok(())
    }

    async fn search(&self, _query: &SearchQuery) -> Result<Vec<ProductRef>> {
        Ok(self.products.clone())
    }

    async fn resolve(&self, _collection: &str, product: &ProductRef) -> Result<Vec<DownloadItem>> {
        match self.files.get(&product.id) {
            Some(files) => Ok(files.clone()),
            None => bail!("No download URL for product {}.", product.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn query() -> SearchQuery {
        SearchQuery {
            collection: "SENTINEL-2".to_string(),
            product_type: "S2MSI2A".to_string(),
            start_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2025, 1, 2).unwrap(),
            aoi: None,
            tile_id: None,
        }
    }

    #[tokio::test]
    async fn serves_configured_products() {
        let provider = StaticProvider::new("copernicus").with_product(
            ProductRef::new("p1", "Product One"),
            vec![DownloadItem {
                url: "http://localhost/p1.bin".to_string(),
                file_name: "p1.bin".to_string(),
            }],
        );

        let products = provider.search(&query()).await.unwrap();
        assert_eq!(products.len(), 1);

        let files = provider.resolve("SENTINEL-2", &products[0]).await.unwrap();
        assert_eq!(files[0].file_name, "p1.bin");

        assert!(provider
            .resolve("SENTINEL-2", &ProductRef::new("ghost", ""))
            .await
            .is_err());
    }
}
