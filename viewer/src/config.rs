//! Settings loaded from `slideshow.toml` and `SLIDESHOW_*` environment
//! variables.

use anyhow::{bail, Context, Result};
use config::{Config, ConfigBuilder, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Weather refreshes faster than this are clamped.
const MIN_WEATHER_REFRESH_SECS: u64 = 60;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub immich: ImmichSettings,
    #[serde(default)]
    pub playback: PlaybackSettings,
    #[serde(default)]
    pub resume: ResumeSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub weather: Option<WeatherSettings>,
    #[serde(default)]
    pub doorbell: DoorbellSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImmichSettings {
    pub url: String,
    pub api_key: String,
    /// Path prefix of the credential-injecting proxy the presenter loads
    /// media through.
    #[serde(default = "default_media_prefix")]
    pub media_prefix: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaybackSettings {
    pub image_duration_secs: u64,
    pub video_watchdog_secs: u64,
    pub prefetch_margin: usize,
    pub start_bucket: Option<String>,
    pub retry_initial_secs: u64,
    pub retry_max_secs: u64,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            image_duration_secs: 5,
            video_watchdog_secs: 60,
            prefetch_margin: 5,
            start_bucket: None,
            retry_initial_secs: 3,
            retry_max_secs: 60,
        }
    }
}

impl PlaybackSettings {
    pub fn image_duration(&self) -> Duration {
        Duration::from_secs(self.image_duration_secs)
    }

    pub fn video_watchdog(&self) -> Duration {
        Duration::from_secs(self.video_watchdog_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResumeSettings {
    pub path: PathBuf,
}

impl Default for ResumeSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("slideshow_state.json"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub dir: PathBuf,
    pub max_size_gb: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("cache"),
            max_size_gb: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WeatherSettings {
    pub api_key: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default = "default_weather_url")]
    pub base_url: String,
    #[serde(default = "default_weather_refresh")]
    pub refresh_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DoorbellSettings {
    pub ws_url: Option<String>,
    pub poll_url: Option<String>,
    /// Camera stream played inside the overlay.
    pub stream_url: Option<String>,
    pub poll_interval_secs: u64,
    pub overlay_secs: u64,
    pub reconnect_secs: u64,
}

impl Default for DoorbellSettings {
    fn default() -> Self {
        Self {
            ws_url: None,
            poll_url: None,
            stream_url: None,
            poll_interval_secs: 2,
            overlay_secs: 30,
            reconnect_secs: 5,
        }
    }
}

fn default_media_prefix() -> String {
    "/api/immich".into()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_weather_url() -> String {
    "https://api.openweathermap.org".into()
}

fn default_weather_refresh() -> u64 {
    600
}

impl Settings {
    /// Load settings. An explicit `path` must exist; otherwise
    /// `slideshow.toml` in the working directory is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name("slideshow").required(false),
        };
        Self::from_builder(Config::builder().add_source(file))
    }

    fn from_builder(
        builder: ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self> {
        let config = builder
            .add_source(
                Environment::with_prefix("SLIDESHOW")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            // Variable names used by existing deployments.
            .set_override_option("immich.url", std::env::var("IMMICH_API_URL").ok())?
            .set_override_option("immich.api_key", std::env::var("IMMICH_API_KEY").ok())?
            .build()
            .context("Failed to read configuration")?;

        let mut settings: Settings = config
            .try_deserialize()
            .context("Invalid configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&mut self) -> Result<()> {
        if self.immich.url.trim().is_empty() {
            bail!("immich.url must be set");
        }
        if self.immich.api_key.trim().is_empty() {
            bail!("immich.api_key must be set");
        }
        if self.playback.image_duration_secs == 0 {
            bail!("playback.image_duration_secs must be positive");
        }
        if self.playback.video_watchdog_secs == 0 {
            bail!("playback.video_watchdog_secs must be positive");
        }
        if let Some(weather) = self.weather.as_mut() {
            if weather.refresh_secs < MIN_WEATHER_REFRESH_SECS {
                tracing::warn!(
                    "weather.refresh_secs {} too low, using {}",
                    weather.refresh_secs,
                    MIN_WEATHER_REFRESH_SECS
                );
                weather.refresh_secs = MIN_WEATHER_REFRESH_SECS;
            }
        }
        Ok(())
    }
}
