//! Static asset catalog
//!
//! A resource that costs nothing to tear down: the catalog is plain data, so
//! its lifecycle declares no release callback and cleanup skips it entirely.

use quartermaster::{Lifecycle, ResourceKey};

/// Key for the asset catalog resource.
pub const ASSETS: ResourceKey<AssetCatalog> = ResourceKey::new("assets");

/// Immutable catalog resolving asset names to their public URLs.
#[derive(Debug, Clone)]
pub struct AssetCatalog {
    base_url: String,
}

impl AssetCatalog {
    fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { base_url }
    }

    /// Public URL for the named asset.
    #[must_use]
    pub fn url_for(&self, name: &str) -> String {
        format!("{}/{}", self.base_url, name.trim_start_matches('/'))
    }
}

/// Declares the catalog resource. No release callback: there is nothing to
/// shut down, so teardown never touches it.
pub fn lifecycle(base_url: impl Into<String>) -> Lifecycle<AssetCatalog> {
    let base_url = base_url.into();
    Lifecycle::new(move || {
        let base_url = base_url.clone();
        async move { Ok(AssetCatalog::new(base_url)) }
    })
}

#[cfg(test)]
mod tests {
    use quartermaster::Registry;

    use super::*;

    #[test]
    fn urls_join_cleanly_whatever_the_slashes() {
        let catalog = AssetCatalog::new("http://assets.local///");
        assert_eq!(catalog.url_for("logo.png"), "http://assets.local/logo.png");
        assert_eq!(
            catalog.url_for("/banners/spring.png"),
            "http://assets.local/banners/spring.png"
        );
    }

    #[test]
    fn the_catalog_lifecycle_declares_no_release() {
        assert!(!lifecycle("http://assets.local").has_release());
    }

    #[tokio::test]
    async fn an_acquired_catalog_leaves_nothing_for_teardown() {
        let registry = Registry::new();
        registry
            .register(ASSETS, lifecycle("http://assets.local/"))
            .unwrap();

        let catalog = registry.provide_one(ASSETS).await.unwrap();
        assert_eq!(catalog.url_for("logo.png"), "http://assets.local/logo.png");

        assert_eq!(registry.pending_releases(), 0);
        assert!(registry.cleanup().await.is_empty());
    }
}
