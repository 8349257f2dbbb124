//! Headless presentation layer.
//!
//! Folds driver output, weather and doorbell rings into a frame description
//! and logs it whenever it changes. Stands in for a display: videos "play"
//! for their known duration and then report end-of-media to the driver.

use crate::driver::{DriverHandle, PresentationEvent, Slide};
use crate::realtime::{DoorbellEvent, DoorbellOverlay};
use crate::weather::WeatherReading;
use chrono::{DateTime, Local};
use std::fmt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
enum Status {
    Loading,
    Reconnecting(u32),
    Playing,
    NoMedia,
}

/// Everything visible at one moment.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub notice: Option<String>,
    /// Local file or proxy URL of the still being displayed.
    pub media: Option<String>,
    pub video: Option<String>,
    pub date: Option<String>,
    pub location: Option<String>,
    pub favorite: bool,
    pub weather: Option<String>,
    pub clock: String,
    pub doorbell: bool,
    /// Camera stream shown with the doorbell overlay.
    pub doorbell_stream: Option<String>,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.clock)?;
        if let Some(notice) = &self.notice {
            write!(f, " {}", notice)?;
        }
        if let Some(media) = &self.media {
            write!(f, " {}", media)?;
        }
        if let Some(video) = &self.video {
            write!(f, " ▶ {}", video)?;
        }
        if let Some(date) = &self.date {
            write!(f, " | {}", date)?;
        }
        if self.favorite {
            write!(f, " ♥")?;
        }
        if let Some(location) = &self.location {
            write!(f, " | {}", location)?;
        }
        if let Some(weather) = &self.weather {
            write!(f, " | {}", weather)?;
        }
        if self.doorbell {
            write!(f, " | DOORBELL")?;
        }
        if let Some(stream) = &self.doorbell_stream {
            write!(f, " ▶ {}", stream)?;
        }
        Ok(())
    }
}

enum Input {
    Presentation(Option<PresentationEvent>),
    Doorbell(Option<DoorbellEvent>),
    Weather(bool),
}

pub struct Presenter {
    handle: DriverHandle,
    status: Status,
    current: Option<Slide>,
    weather: Option<WeatherReading>,
    overlay: DoorbellOverlay,
    playback: Option<JoinHandle<()>>,
}

impl Presenter {
    pub fn new(handle: DriverHandle, overlay: DoorbellOverlay) -> Self {
        Self {
            handle,
            status: Status::Loading,
            current: None,
            weather: None,
            overlay,
            playback: None,
        }
    }

    /// Run until the driver closes the presentation channel.
    pub async fn run(
        mut self,
        mut presentation: mpsc::UnboundedReceiver<PresentationEvent>,
        mut doorbell: Option<mpsc::Receiver<DoorbellEvent>>,
        mut weather: Option<watch::Receiver<Option<WeatherReading>>>,
    ) {
        loop {
            let input = tokio::select! {
                event = presentation.recv() => Input::Presentation(event),
                event = recv_doorbell(&mut doorbell) => Input::Doorbell(event),
                changed = weather_changed(&mut weather) => Input::Weather(changed),
            };

            match input {
                Input::Presentation(None) => break,
                Input::Presentation(Some(event)) => self.apply(event),
                Input::Doorbell(None) => {
                    doorbell = None;
                    continue;
                }
                Input::Doorbell(Some(event)) => {
                    if !self.doorbell(event) {
                        continue;
                    }
                }
                Input::Weather(false) => {
                    weather = None;
                    continue;
                }
                Input::Weather(true) => {
                    self.weather = weather.as_ref().and_then(|rx| (*rx.borrow()).clone());
                }
            }

            let frame = self.compose(Local::now(), Instant::now());
            tracing::info!("{}", frame);
        }

        if let Some(task) = self.playback.take() {
            task.abort();
        }
    }

    fn apply(&mut self, event: PresentationEvent) {
        match event {
            PresentationEvent::Loading => self.status = Status::Loading,
            PresentationEvent::Reconnecting { attempt, reason } => {
                tracing::debug!("Reconnecting ({})", reason);
                self.status = Status::Reconnecting(attempt);
            }
            PresentationEvent::NoMedia => {
                self.stop_playback();
                self.current = None;
                self.status = Status::NoMedia;
            }
            PresentationEvent::Showing(slide) => {
                self.stop_playback();
                self.start_playback(&slide);
                self.current = Some(slide);
                self.status = Status::Playing;
            }
            PresentationEvent::DetailUpdated { generation, asset } => {
                if let Some(slide) = self.current.as_mut().filter(|s| s.generation == generation) {
                    slide.asset = asset;
                }
            }
        }
    }

    /// Returns true when the ring changed what is on screen.
    fn doorbell(&mut self, event: DoorbellEvent) -> bool {
        match event {
            DoorbellEvent::Ring => self.overlay.ring(Instant::now()),
            DoorbellEvent::Connected | DoorbellEvent::Disconnected => {
                tracing::debug!("Doorbell relay {:?}", event);
                false
            }
        }
    }

    /// Pretend to play a video for its reported length.
    fn start_playback(&mut self, slide: &Slide) {
        if !slide.asset.is_video() {
            return;
        }
        let Some(seconds) = slide.asset.duration_seconds.filter(|s| *s > 0.0) else {
            tracing::debug!("Video {} has no duration, leaving it to the watchdog", slide.asset.id);
            return;
        };

        let handle = self.handle.clone();
        let generation = slide.generation;
        self.playback = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
            handle.media_ended(generation).await;
        }));
    }

    fn stop_playback(&mut self) {
        if let Some(task) = self.playback.take() {
            task.abort();
        }
    }

    fn compose(&self, clock: DateTime<Local>, now: Instant) -> Frame {
        let notice = match self.status {
            Status::Loading => Some("Loading…".to_string()),
            Status::Reconnecting(attempt) => Some(format!("Reconnecting (attempt {})", attempt)),
            Status::NoMedia => Some("No photos found".to_string()),
            Status::Playing => None,
        };

        let slide = self
            .current
            .as_ref()
            .filter(|_| self.status == Status::Playing);
        let media = slide.map(|s| match &s.local_preview {
            Some(path) => path.display().to_string(),
            None if s.asset.is_video() => s.links.poster.clone(),
            None => s.links.preview.clone(),
        });

        Frame {
            notice,
            media,
            video: slide.and_then(|s| s.links.video.clone()),
            date: slide.map(|s| s.asset.date_caption()),
            location: slide.and_then(|s| s.asset.location_caption()),
            favorite: slide.is_some_and(|s| s.asset.is_favorite),
            weather: self.weather.as_ref().map(WeatherReading::caption),
            clock: clock.format("%H:%M").to_string(),
            doorbell: self.overlay.is_visible(now),
            doorbell_stream: self.overlay.stream(now).map(str::to_string),
        }
    }
}

async fn recv_doorbell(rx: &mut Option<mpsc::Receiver<DoorbellEvent>>) -> Option<DoorbellEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn weather_changed(rx: &mut Option<watch::Receiver<Option<WeatherReading>>>) -> bool {
    match rx {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}
