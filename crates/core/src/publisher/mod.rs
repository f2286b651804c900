//! Publisher adapter layer.
//!
//! Each platform hides its upload protocol behind [`PublisherAdapter`]. The
//! [`PublishService`] wraps the adapter call with idempotency, bounded
//! retries and a persisted attempt log.

mod apify;
mod config;
mod sanitize;
mod service;
mod types;
mod vk;
mod youtube;

pub use apify::{ApifyPublisher, ApifyTarget};
pub use config::{ApifyConfig, PlatformsConfig, PublisherConfig, VkConfig, YouTubeConfig};
pub use sanitize::{sanitize, sanitize_value};
pub use service::{resolve_video, PublishService};
pub use types::{
    is_retryable_status, AdapterError, PublishError, PublishOutcome, PublishResult, UploadRequest,
};
pub use vk::VkPublisher;
pub use youtube::YouTubePublisher;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::catalog::Destination;

/// Uniform upload contract implemented once per platform.
#[async_trait]
pub trait PublisherAdapter: Send + Sync {
    /// Lowercase platform name this adapter serves.
    fn platform(&self) -> &str;

    /// Upload the video and report where it landed.
    async fn publish(
        &self,
        destination: &Destination,
        upload: &UploadRequest,
    ) -> Result<PublishResult, AdapterError>;
}

/// Adapters keyed by lowercase platform name.
#[derive(Default, Clone)]
pub struct PublisherRegistry {
    adapters: HashMap<String, Arc<dyn PublisherAdapter>>,
}

impl PublisherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in adapter.
    pub fn from_config(config: &PlatformsConfig) -> Result<Self, AdapterError> {
        let mut registry = Self::new();
        registry.register(Arc::new(YouTubePublisher::new(config.youtube.clone())?));
        registry.register(Arc::new(ApifyPublisher::new(
            ApifyTarget::TikTok,
            config.apify.clone(),
        )?));
        registry.register(Arc::new(ApifyPublisher::new(
            ApifyTarget::Instagram,
            config.apify.clone(),
        )?));
        registry.register(Arc::new(VkPublisher::new(config.vk.clone())?));
        Ok(registry)
    }

    pub fn register(&mut self, adapter: Arc<dyn PublisherAdapter>) -> &mut Self {
        self.adapters
            .insert(adapter.platform().to_lowercase(), adapter);
        self
    }

    /// Case-insensitive lookup.
    pub fn get(&self, platform: &str) -> Option<Arc<dyn PublisherAdapter>> {
        self.adapters.get(&platform.to_lowercase()).cloned()
    }

    /// Registered platform names, sorted.
    pub fn platforms(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockPublisher;

    #[test]
    fn test_registry_lookup_is_case_insensitive() {
        let mut registry = PublisherRegistry::new();
        registry.register(Arc::new(MockPublisher::new("youtube")));
        assert!(registry.get("YouTube").is_some());
        assert!(registry.get("vk").is_none());
    }

    #[test]
    fn test_builtin_registry() {
        let registry = PublisherRegistry::from_config(&PlatformsConfig::default()).unwrap();
        assert_eq!(
            registry.platforms(),
            vec!["instagram", "tiktok", "vk", "youtube"]
        );
    }
}
