//! Playback driver.
//!
//! A single task owns the cursor and current page. Timers, media callbacks
//! and network completions all arrive as [`DriverEvent`]s on one channel and
//! are applied one at a time. Everything asynchronous is tagged, either with
//! the display generation or with a request id, so completions that arrive
//! after the driver has moved on are dropped.

use crate::api::TimelineSource;
use crate::assets::{Asset, MediaLinks, Page};
use crate::config::Settings;
use crate::cursor::{Advance, PlaybackCursor, Retreat, Step};
use crate::error::{Result, SlideshowError};
use crate::loader::{self, RetryPolicy};
use crate::prefetch::{ImagePreload, Prefetcher};
use crate::resume::{ResumeRecord, ResumeStore, ResumeWriter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    /// Startup fetches in flight.
    Loading,
    ShowingImage,
    ShowingVideo,
    /// Waiting for the next non-empty bucket.
    Advancing,
    /// Terminal: every bucket is empty.
    NoMedia,
    Stopped,
}

impl DriverState {
    fn is_showing(self) -> bool {
        matches!(self, DriverState::ShowingImage | DriverState::ShowingVideo)
    }
}

/// Why an advance happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceReason {
    Timer,
    MediaEnded,
    MediaError,
    /// Video watchdog fired.
    StuckMedia,
    Manual,
}

#[derive(Debug)]
pub enum DriverEvent {
    Next,
    Previous,
    MediaEnded {
        generation: u64,
    },
    MediaFailed {
        generation: u64,
        reason: String,
    },
    ImageTimerElapsed {
        generation: u64,
    },
    WatchdogElapsed {
        generation: u64,
    },
    PageResolved {
        request: u64,
        result: Result<Advance>,
    },
    RetryCrossing {
        request: u64,
    },
    LookaheadLoaded {
        seq: u64,
        bucket_index: usize,
        result: Result<Page>,
    },
    DetailLoaded {
        generation: u64,
        result: Result<Asset>,
    },
    ImagePreloaded {
        asset_id: String,
        result: anyhow::Result<Option<PathBuf>>,
    },
    Shutdown,
}

/// One asset on screen.
#[derive(Debug, Clone)]
pub struct Slide {
    /// Echo back in media-end/error reports.
    pub generation: u64,
    pub bucket_id: String,
    pub asset: Asset,
    pub links: MediaLinks,
    pub local_preview: Option<PathBuf>,
}

/// What the presentation layer is told.
#[derive(Debug, Clone)]
pub enum PresentationEvent {
    Loading,
    Reconnecting { attempt: u32, reason: String },
    Showing(Slide),
    DetailUpdated { generation: u64, asset: Asset },
    NoMedia,
}

/// Cloneable sender side of the driver.
#[derive(Debug, Clone)]
pub struct DriverHandle {
    tx: mpsc::Sender<DriverEvent>,
}

impl DriverHandle {
    async fn send(&self, event: DriverEvent) {
        if self.tx.send(event).await.is_err() {
            tracing::debug!("Driver already stopped");
        }
    }

    pub async fn next(&self) {
        self.send(DriverEvent::Next).await;
    }

    pub async fn previous(&self) {
        self.send(DriverEvent::Previous).await;
    }

    pub async fn media_ended(&self, generation: u64) {
        self.send(DriverEvent::MediaEnded { generation }).await;
    }

    pub async fn media_failed(&self, generation: u64, reason: impl Into<String>) {
        self.send(DriverEvent::MediaFailed {
            generation,
            reason: reason.into(),
        })
        .await;
    }

    pub async fn shutdown(&self) {
        self.send(DriverEvent::Shutdown).await;
    }

    /// A handle with no driver behind it.
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::Receiver<DriverEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (Self { tx }, rx)
    }
}

#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub image_duration: Duration,
    pub video_watchdog: Duration,
    pub prefetch_margin: usize,
    pub media_prefix: String,
    pub start_bucket: Option<String>,
    pub retry: RetryPolicy,
}

impl DriverOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            image_duration: settings.playback.image_duration(),
            video_watchdog: settings.playback.video_watchdog(),
            prefetch_margin: settings.playback.prefetch_margin,
            media_prefix: settings.immich.media_prefix.clone(),
            start_bucket: settings.playback.start_bucket.clone(),
            retry: RetryPolicy::from_settings(&settings.playback),
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

pub struct PlaybackDriver {
    options: DriverOptions,
    source: Arc<dyn TimelineSource>,
    resume: Arc<dyn ResumeStore>,
    writer: ResumeWriter,
    prefetcher: Prefetcher,
    presentation: mpsc::UnboundedSender<PresentationEvent>,
    events_tx: mpsc::Sender<DriverEvent>,
    events_rx: mpsc::Receiver<DriverEvent>,
    state: DriverState,
    playback: Option<PlaybackCursor>,
    /// Bumped on every display and every disarm.
    generation: u64,
    /// Id of the bucket crossing whose result is awaited.
    request: u64,
    crossing_attempts: u32,
    timer: Option<JoinHandle<()>>,
    detail: Option<JoinHandle<()>>,
    crossing: Option<JoinHandle<()>>,
}

impl PlaybackDriver {
    pub fn new(
        options: DriverOptions,
        source: Arc<dyn TimelineSource>,
        resume: Arc<dyn ResumeStore>,
        images: Option<Arc<dyn ImagePreload>>,
        presentation: mpsc::UnboundedSender<PresentationEvent>,
    ) -> (Self, DriverHandle) {
        let (events_tx, events_rx) = mpsc::channel(64);
        let prefetcher = Prefetcher::new(options.prefetch_margin, source.clone(), images);
        let handle = DriverHandle {
            tx: events_tx.clone(),
        };

        let writer = ResumeWriter::spawn(resume.clone());

        let driver = Self {
            options,
            source,
            resume,
            writer,
            prefetcher,
            presentation,
            events_tx,
            events_rx,
            state: DriverState::Idle,
            playback: None,
            generation: 0,
            request: 0,
            crossing_attempts: 0,
            timer: None,
            detail: None,
            crossing: None,
        };
        (driver, handle)
    }

    /// Load the timeline and play until shut down.
    pub async fn run(mut self) {
        self.state = DriverState::Loading;
        self.emit(PresentationEvent::Loading);

        let load = {
            let source = self.source.clone();
            let resume = self.resume.clone();
            let start = self.options.start_bucket.clone();
            let retry = self.options.retry;
            let presentation = self.presentation.clone();
            async move {
                loader::load_with_retry(
                    source.as_ref(),
                    resume.as_ref(),
                    start.as_deref(),
                    retry,
                    |attempt, e| {
                        let _ = presentation.send(PresentationEvent::Reconnecting {
                            attempt,
                            reason: e.to_string(),
                        });
                    },
                )
                .await
            }
        };
        tokio::pin!(load);

        let loaded = loop {
            let event = tokio::select! {
                result = &mut load => break result,
                event = self.events_rx.recv() => event,
            };
            match event {
                None | Some(DriverEvent::Shutdown) => {
                    self.teardown();
                    return;
                }
                Some(other) => tracing::debug!("Ignoring {:?} while loading", other),
            }
        };

        match loaded {
            Ok(playback) => {
                self.playback = Some(playback);
                self.show();
            }
            Err(e) => self.enter_no_media(&e),
        }

        while let Some(event) = self.events_rx.recv().await {
            if let Flow::Stop = self.handle(event) {
                break;
            }
        }
        self.teardown();
    }

    fn handle(&mut self, event: DriverEvent) -> Flow {
        match event {
            DriverEvent::Shutdown => return Flow::Stop,
            DriverEvent::Next => self.trigger(AdvanceReason::Manual, None),
            DriverEvent::Previous => self.retreat(),
            DriverEvent::ImageTimerElapsed { generation } => {
                self.trigger(AdvanceReason::Timer, Some(generation))
            }
            DriverEvent::MediaEnded { generation } => {
                self.trigger(AdvanceReason::MediaEnded, Some(generation))
            }
            DriverEvent::MediaFailed { generation, reason } => {
                if generation == self.generation {
                    tracing::warn!("Video playback error: {}", reason);
                }
                self.trigger(AdvanceReason::MediaError, Some(generation))
            }
            DriverEvent::WatchdogElapsed { generation } => {
                self.trigger(AdvanceReason::StuckMedia, Some(generation))
            }
            DriverEvent::PageResolved { request, result } => self.on_page_resolved(request, result),
            DriverEvent::RetryCrossing { request } => {
                if self.state == DriverState::Advancing && request == self.request {
                    self.start_crossing();
                }
            }
            DriverEvent::LookaheadLoaded {
                seq,
                bucket_index,
                result,
            } => self.prefetcher.accept_page(seq, bucket_index, result),
            DriverEvent::DetailLoaded { generation, result } => self.on_detail(generation, result),
            DriverEvent::ImagePreloaded { asset_id, result } => {
                self.prefetcher.finish_image(&asset_id, result)
            }
        }
        Flow::Continue
    }

    /// Move forward if `generation` still names what is on screen.
    ///
    /// The first trigger for a generation wins; the rest find a newer
    /// generation or a non-showing state and are dropped.
    fn trigger(&mut self, reason: AdvanceReason, generation: Option<u64>) {
        if !self.state.is_showing() {
            tracing::debug!("Ignoring {:?} advance while {:?}", reason, self.state);
            return;
        }
        if let Some(generation) = generation.filter(|g| *g != self.generation) {
            tracing::debug!("Ignoring stale {:?} for generation {}", reason, generation);
            return;
        }
        if reason == AdvanceReason::StuckMedia {
            tracing::warn!(
                "Video stuck for {:?}, advancing",
                self.options.video_watchdog
            );
        }

        self.disarm();
        let Some(playback) = self.playback.as_mut() else {
            return;
        };

        match playback.step() {
            Step::Within(cursor) => {
                playback.apply(Advance {
                    cursor,
                    page_changed: false,
                    new_page: None,
                });
                self.show();
            }
            Step::Cross { bucket_index } => {
                tracing::debug!("Page exhausted, crossing to bucket index {}", bucket_index);
                self.state = DriverState::Advancing;
                self.crossing_attempts = 0;
                self.emit(PresentationEvent::Loading);
                self.start_crossing();
            }
        }
    }

    fn retreat(&mut self) {
        if !self.state.is_showing() {
            return;
        }
        let Some(playback) = self.playback.as_mut() else {
            return;
        };
        match playback.retreat() {
            Retreat::Moved(_) => {
                self.disarm();
                self.show();
            }
            Retreat::NoOp => tracing::debug!("Already at the start of the bucket"),
        }
    }

    fn start_crossing(&mut self) {
        let Some(playback) = self.playback.clone() else {
            return;
        };
        let hint = self.prefetcher.take_lookahead(playback.next_bucket_index());

        self.request += 1;
        let request = self.request;
        let source = self.source.clone();
        let events = self.events_tx.clone();

        if let Some(task) = self.crossing.take() {
            task.abort();
        }
        self.crossing = Some(tokio::spawn(async move {
            let result = playback.advance(source.as_ref(), hint).await;
            let _ = events
                .send(DriverEvent::PageResolved { request, result })
                .await;
        }));
    }

    fn on_page_resolved(&mut self, request: u64, result: Result<Advance>) {
        if self.state != DriverState::Advancing || request != self.request {
            tracing::debug!("Dropping stale page resolution {}", request);
            return;
        }
        self.crossing = None;

        match result {
            Ok(advance) => {
                if let Some(playback) = self.playback.as_mut() {
                    playback.apply(advance);
                }
                self.show();
            }
            Err(SlideshowError::EmptyLibrary) => self.enter_no_media(&SlideshowError::EmptyLibrary),
            Err(e) => {
                self.crossing_attempts += 1;
                let attempt = self.crossing_attempts;
                let delay = self.options.retry.delay(attempt);
                tracing::warn!("Bucket fetch failed ({}), retrying in {:?}", e, delay);
                self.emit(PresentationEvent::Reconnecting {
                    attempt,
                    reason: e.to_string(),
                });

                self.request += 1;
                let request = self.request;
                let events = self.events_tx.clone();
                self.crossing = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = events.send(DriverEvent::RetryCrossing { request }).await;
                }));
            }
        }
    }

    fn on_detail(&mut self, generation: u64, result: Result<Asset>) {
        if generation != self.generation || !self.state.is_showing() {
            return;
        }
        self.detail = None;

        match result {
            Ok(detail) => {
                let merged = self
                    .playback
                    .as_mut()
                    .and_then(|p| p.merge_detail(detail))
                    .cloned();
                if let Some(asset) = merged {
                    self.emit(PresentationEvent::DetailUpdated { generation, asset });
                }
            }
            Err(e) => tracing::debug!("{}; keeping summary", e),
        }
    }

    /// Put the current asset on screen and arm its advance trigger.
    fn show(&mut self) {
        let Some((asset, bucket_id)) = self
            .playback
            .as_ref()
            .and_then(|p| Some((p.current()?.clone(), p.bucket().id.clone())))
        else {
            tracing::error!("Cursor points outside its page");
            return;
        };

        self.generation += 1;
        let generation = self.generation;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }

        let (state, delay, elapsed) = if asset.is_video() {
            (
                DriverState::ShowingVideo,
                self.options.video_watchdog,
                DriverEvent::WatchdogElapsed { generation },
            )
        } else {
            (
                DriverState::ShowingImage,
                self.options.image_duration,
                DriverEvent::ImageTimerElapsed { generation },
            )
        };
        self.state = state;
        let events = self.events_tx.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(elapsed).await;
        }));

        self.writer
            .save(ResumeRecord::new(bucket_id.as_str(), asset.id.as_str()));

        let source = self.source.clone();
        let events = self.events_tx.clone();
        let asset_id = asset.id.clone();
        self.detail = Some(tokio::spawn(async move {
            let result = source.asset_detail(&asset_id).await;
            let _ = events
                .send(DriverEvent::DetailLoaded { generation, result })
                .await;
        }));

        if let Some(playback) = self.playback.as_ref() {
            self.prefetcher.observe(playback, &self.events_tx);
        }

        tracing::info!(
            "Showing {} {} from {}",
            if asset.is_video() { "video" } else { "image" },
            asset.id,
            bucket_id
        );
        let local_preview = self.prefetcher.preloaded(&asset.id);
        self.emit(PresentationEvent::Showing(Slide {
            generation,
            bucket_id,
            links: MediaLinks::for_asset(&self.options.media_prefix, &asset),
            local_preview,
            asset,
        }));
    }

    /// Cancel the pending advance trigger and detail fetch.
    fn disarm(&mut self) {
        self.generation += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if let Some(detail) = self.detail.take() {
            detail.abort();
        }
    }

    fn enter_no_media(&mut self, error: &SlideshowError) {
        tracing::error!("{}", error);
        self.disarm();
        self.prefetcher.cancel_all();
        self.state = DriverState::NoMedia;
        self.emit(PresentationEvent::NoMedia);
    }

    fn teardown(&mut self) {
        self.disarm();
        if let Some(task) = self.crossing.take() {
            task.abort();
        }
        self.prefetcher.cancel_all();
        self.request += 1;
        self.state = DriverState::Stopped;
        tracing::info!("Playback stopped");
    }

    fn emit(&self, event: PresentationEvent) {
        if self.presentation.send(event).is_err() {
            tracing::debug!("Presenter gone");
        }
    }
}
