use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Retry policy of the publish service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Attempts per publish, first try included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before retry `n` is `backoff_secs[n - 1]` (last entry repeats).
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: Vec<u64>,
    /// Upper bound on a single adapter call.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_secs: default_backoff_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl PublisherConfig {
    /// Delay before the retry that follows attempt `attempt` (1-based).
    pub fn backoff_after(&self, attempt: u32) -> u64 {
        let index = (attempt.max(1) - 1) as usize;
        self.backoff_secs
            .get(index)
            .or(self.backoff_secs.last())
            .copied()
            .unwrap_or(0)
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_secs() -> Vec<u64> {
    vec![60, 300, 1200]
}

fn default_request_timeout_secs() -> u64 {
    300
}

/// Per-platform adapter settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformsConfig {
    #[serde(default)]
    pub youtube: YouTubeConfig,
    #[serde(default)]
    pub apify: ApifyConfig,
    #[serde(default)]
    pub vk: VkConfig,
    /// Sections for platforms without an adapter; rejected by validation.
    #[serde(flatten, default, skip_serializing)]
    pub unknown: BTreeMap<String, serde_json::Value>,
}

/// YouTube Data API settings. Tokens come from destination credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YouTubeConfig {
    /// OAuth client id used for token refresh.
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default = "default_youtube_upload_url")]
    pub upload_url: String,
    #[serde(default = "default_youtube_token_url")]
    pub token_url: String,
    #[serde(default = "default_upload_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for YouTubeConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            upload_url: default_youtube_upload_url(),
            token_url: default_youtube_token_url(),
            timeout_secs: default_upload_timeout_secs(),
        }
    }
}

fn default_youtube_upload_url() -> String {
    "https://www.googleapis.com/upload/youtube/v3/videos".to_string()
}

fn default_youtube_token_url() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

fn default_upload_timeout_secs() -> u64 {
    300
}

/// Automation actor settings for TikTok and Instagram uploads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApifyConfig {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_apify_base_url")]
    pub base_url: String,
    #[serde(default = "default_tiktok_actor")]
    pub tiktok_actor: String,
    #[serde(default = "default_instagram_actor")]
    pub instagram_actor: String,
    #[serde(default = "default_actor_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ApifyConfig {
    fn default() -> Self {
        Self {
            token: None,
            base_url: default_apify_base_url(),
            tiktok_actor: default_tiktok_actor(),
            instagram_actor: default_instagram_actor(),
            timeout_secs: default_actor_timeout_secs(),
        }
    }
}

fn default_apify_base_url() -> String {
    "https://api.apify.com/v2".to_string()
}

fn default_tiktok_actor() -> String {
    "adenium/tiktok-upload".to_string()
}

fn default_instagram_actor() -> String {
    "adenium/instagram-reel-upload".to_string()
}

fn default_actor_timeout_secs() -> u64 {
    180
}

/// VK API settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VkConfig {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_vk_api_version")]
    pub api_version: String,
    #[serde(default = "default_vk_base_url")]
    pub base_url: String,
    #[serde(default = "default_vk_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for VkConfig {
    fn default() -> Self {
        Self {
            access_token: None,
            api_version: default_vk_api_version(),
            base_url: default_vk_base_url(),
            timeout_secs: default_vk_timeout_secs(),
        }
    }
}

fn default_vk_api_version() -> String {
    "5.199".to_string()
}

fn default_vk_base_url() -> String {
    "https://api.vk.com/method".to_string()
}

fn default_vk_timeout_secs() -> u64 {
    120
}
