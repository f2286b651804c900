use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

use crate::dispatcher::DispatcherConfig;
use crate::media::MediaConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::processor::ProcessorConfig;
use crate::publisher::{PlatformsConfig, PublisherConfig};
use crate::selector::Penalties;
use crate::watchdog::WatchdogConfig;

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
    /// Diversity penalties of the selector.
    #[serde(default)]
    pub selector: Penalties,
    #[serde(default)]
    pub pipeline: ProcessorConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub platforms: PlatformsConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    8080
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("clipline.db")
}

/// Sanitized config for API responses (secrets replaced by flags)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub dispatcher: DispatcherConfig,
    pub watchdog: WatchdogConfig,
    pub publisher: PublisherConfig,
    pub selector: Penalties,
    pub pipeline: ProcessorConfig,
    pub media: MediaConfig,
    pub platforms: SanitizedPlatformsConfig,
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct SanitizedPlatformsConfig {
    pub youtube: SanitizedYouTubeConfig,
    pub apify: SanitizedApifyConfig,
    pub vk: SanitizedVkConfig,
}

/// Sanitized YouTube config (OAuth client hidden)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedYouTubeConfig {
    pub client_configured: bool,
    pub upload_url: String,
    pub timeout_secs: u64,
}

/// Sanitized actor config (token hidden)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedApifyConfig {
    pub token_configured: bool,
    pub base_url: String,
    pub tiktok_actor: String,
    pub instagram_actor: String,
}

/// Sanitized VK config (access token hidden)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedVkConfig {
    pub access_token_configured: bool,
    pub api_version: String,
}

fn configured(secret: &Option<String>) -> bool {
    secret.as_deref().is_some_and(|s| !s.is_empty())
}

impl From<&Config> for SanitizedConfig {
    fn from(config: &Config) -> Self {
        let platforms = &config.platforms;
        Self {
            server: config.server.clone(),
            database: config.database.clone(),
            dispatcher: config.dispatcher.clone(),
            watchdog: config.watchdog.clone(),
            publisher: config.publisher.clone(),
            selector: config.selector.clone(),
            pipeline: config.pipeline.clone(),
            media: config.media.clone(),
            platforms: SanitizedPlatformsConfig {
                youtube: SanitizedYouTubeConfig {
                    client_configured: configured(&platforms.youtube.client_id)
                        && configured(&platforms.youtube.client_secret),
                    upload_url: platforms.youtube.upload_url.clone(),
                    timeout_secs: platforms.youtube.timeout_secs,
                },
                apify: SanitizedApifyConfig {
                    token_configured: configured(&platforms.apify.token),
                    base_url: platforms.apify.base_url.clone(),
                    tiktok_actor: platforms.apify.tiktok_actor.clone(),
                    instagram_actor: platforms.apify.instagram_actor.clone(),
                },
                vk: SanitizedVkConfig {
                    access_token_configured: configured(&platforms.vk.access_token),
                    api_version: platforms.vk.api_version.clone(),
                },
            },
            orchestrator: config.orchestrator.clone(),
        }
    }
}
