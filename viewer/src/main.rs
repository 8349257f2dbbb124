//! Photo frame slideshow over an Immich timeline.

mod api;
mod assets;
mod cache;
mod config;
mod cursor;
mod driver;
mod error;
mod loader;
mod prefetch;
mod presenter;
mod realtime;
mod resume;
mod weather;

use crate::api::{ImmichClient, TimelineSource};
use crate::cache::{Cache, PreviewCache, WarmPreview};
use crate::config::Settings;
use crate::driver::{DriverOptions, PlaybackDriver};
use crate::prefetch::ImagePreload;
use crate::presenter::Presenter;
use crate::realtime::DoorbellOverlay;
use crate::resume::{FileResumeStore, ResumeStore};
use crate::weather::WeatherClient;
use anyhow::{Context, Result};
use clap::Parser;
use reqwest::Client;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(version, about = "Photo frame slideshow over an Immich timeline")]
struct Cli {
    /// Settings file; `slideshow.toml` is used when present
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Start at this bucket instead of the saved position
    #[arg(long)]
    start_bucket: Option<String>,

    /// Seconds each image stays on screen
    #[arg(long)]
    duration: Option<u64>,

    /// Forget the saved position before starting
    #[arg(long)]
    reset: bool,

    /// Print the timeline buckets and exit
    #[arg(long)]
    list_buckets: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(start) = cli.start_bucket {
        settings.playback.start_bucket = Some(start);
    }
    if let Some(secs) = cli.duration {
        settings.playback.image_duration_secs = secs.max(1);
    }

    let client = Client::builder()
        .timeout(Duration::from_secs(settings.immich.request_timeout_secs))
        .build()
        .context("Failed to build HTTP client")?;
    let source: Arc<dyn TimelineSource> =
        Arc::new(ImmichClient::new(client.clone(), &settings.immich)?);

    if cli.list_buckets {
        return list_buckets(source.as_ref()).await;
    }

    let resume: Arc<dyn ResumeStore> =
        Arc::new(FileResumeStore::new(settings.resume.path.clone()));
    if cli.reset {
        resume
            .clear()
            .await
            .context("Failed to clear saved position")?;
        tracing::info!("Saved position cleared");
    }

    let images = preview_cache(&settings, source.clone())?;

    let (presentation_tx, presentation_rx) = mpsc::unbounded_channel();
    let (driver, handle) = PlaybackDriver::new(
        DriverOptions::from_settings(&settings),
        source,
        resume,
        images,
        presentation_tx,
    );

    let doorbell = realtime::spawn_doorbell(&settings.doorbell, client.clone())?;
    let weather = match settings.weather.as_ref() {
        Some(forecast) => Some(weather::spawn_weather(
            WeatherClient::new(client, forecast)?,
            Duration::from_secs(forecast.refresh_secs),
        )),
        None => None,
    };

    let presenter = Presenter::new(
        handle.clone(),
        DoorbellOverlay::from_settings(&settings.doorbell),
    );
    let driver_task = tokio::spawn(driver.run());
    let presenter_task = tokio::spawn(presenter.run(presentation_rx, doorbell, weather));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");

    handle.shutdown().await;
    driver_task.await.context("Driver task failed")?;
    presenter_task.await.context("Presenter task failed")?;
    Ok(())
}

/// Next-image preloading: into the disk cache when enabled, otherwise
/// fetch-and-decode only.
fn preview_cache(
    settings: &Settings,
    source: Arc<dyn TimelineSource>,
) -> Result<Option<Arc<dyn ImagePreload>>> {
    if !settings.cache.enabled {
        tracing::debug!("Preview cache disabled, warming only");
        let warm: Arc<dyn ImagePreload> = Arc::new(WarmPreview::new(source));
        return Ok(Some(warm));
    }
    let max_bytes = settings.cache.max_size_gb.saturating_mul(1024 * 1024 * 1024);
    let cache = Cache::new(settings.cache.dir.clone(), max_bytes)?;
    let stats = cache.stats();
    tracing::info!(
        "Cache holds {} previews ({:.1} of {:.1} MB)",
        stats.item_count,
        stats.current_size as f64 / 1024.0 / 1024.0,
        stats.max_size as f64 / 1024.0 / 1024.0
    );

    let previews: Arc<dyn ImagePreload> =
        Arc::new(PreviewCache::new(Arc::new(RwLock::new(cache)), source));
    Ok(Some(previews))
}

async fn list_buckets(source: &dyn TimelineSource) -> Result<()> {
    let buckets = source.buckets().await?;
    for bucket in &buckets {
        println!("{:<24} {:>6}  {}", bucket.display_name(), bucket.item_count, bucket.id);
    }
    println!("{} buckets", buckets.len());
    Ok(())
}
