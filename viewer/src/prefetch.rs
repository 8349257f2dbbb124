//! Lookahead fetching.
//!
//! Two independent hints: the next bucket's page when the cursor nears the
//! end of the current one, and the bytes of the next image in the page.
//! Playback never depends on either having completed.

use crate::api::TimelineSource;
use crate::assets::Page;
use crate::cursor::PlaybackCursor;
use crate::driver::DriverEvent;
use crate::error::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Loads an image ahead of display.
///
/// Returns a local path when the bytes were kept on disk.
#[async_trait]
pub trait ImagePreload: Send + Sync {
    async fn preload(&self, asset_id: &str) -> anyhow::Result<Option<PathBuf>>;
}

struct PendingPage {
    seq: u64,
    bucket_index: usize,
    handle: JoinHandle<()>,
}

struct PendingImage {
    asset_id: String,
    handle: JoinHandle<()>,
}

pub struct Prefetcher {
    margin: usize,
    source: Arc<dyn TimelineSource>,
    images: Option<Arc<dyn ImagePreload>>,
    seq: u64,
    lookahead: Option<(usize, Page)>,
    page_job: Option<PendingPage>,
    image_job: Option<PendingImage>,
    /// Last finished preload and its local copy, if one was kept.
    ready: Option<(String, Option<PathBuf>)>,
}

impl Prefetcher {
    pub fn new(
        margin: usize,
        source: Arc<dyn TimelineSource>,
        images: Option<Arc<dyn ImagePreload>>,
    ) -> Self {
        Self {
            margin,
            source,
            images,
            seq: 0,
            lookahead: None,
            page_job: None,
            image_job: None,
            ready: None,
        }
    }

    /// Called after every cursor change.
    pub fn observe(&mut self, playback: &PlaybackCursor, events: &mpsc::Sender<DriverEvent>) {
        self.observe_page(playback, events);
        self.observe_image(playback, events);
    }

    fn observe_page(&mut self, playback: &PlaybackCursor, events: &mpsc::Sender<DriverEvent>) {
        let buckets = playback.buckets();
        // With one bucket the "next" page is the current one.
        if buckets.len() < 2 {
            return;
        }

        let next = playback.next_bucket_index();
        if self.lookahead.as_ref().is_some_and(|(index, _)| *index != next) {
            self.lookahead = None;
        }
        if playback.remaining_in_page() >= self.margin || self.lookahead.is_some() {
            return;
        }
        if self.page_job.as_ref().is_some_and(|job| job.bucket_index == next) {
            return;
        }
        if let Some(job) = self.page_job.take() {
            job.handle.abort();
        }

        self.seq += 1;
        let seq = self.seq;
        let bucket_id = buckets[next].id.clone();
        let source = self.source.clone();
        let events = events.clone();
        tracing::debug!("Prefetching bucket {}", bucket_id);

        let handle = tokio::spawn(async move {
            let result = source.page(&bucket_id).await;
            let _ = events
                .send(DriverEvent::LookaheadLoaded {
                    seq,
                    bucket_index: next,
                    result,
                })
                .await;
        });
        self.page_job = Some(PendingPage {
            seq,
            bucket_index: next,
            handle,
        });
    }

    fn observe_image(&mut self, playback: &PlaybackCursor, events: &mpsc::Sender<DriverEvent>) {
        let Some(images) = self.images.clone() else {
            return;
        };

        // Videos stream; only stills are worth loading ahead.
        let Some(next) = playback.peek_next().filter(|a| a.is_image()) else {
            self.abandon_image();
            return;
        };

        let wanted = |id: &str| id == next.id;
        if self.ready.as_ref().is_some_and(|(id, _)| wanted(id))
            || self.image_job.as_ref().is_some_and(|job| wanted(&job.asset_id))
        {
            return;
        }
        self.abandon_image();

        let asset_id = next.id.clone();
        let events = events.clone();
        tracing::debug!("Preloading image {}", asset_id);

        let handle = tokio::spawn({
            let asset_id = asset_id.clone();
            async move {
                let result = images.preload(&asset_id).await;
                let _ = events
                    .send(DriverEvent::ImagePreloaded { asset_id, result })
                    .await;
            }
        });
        self.image_job = Some(PendingImage { asset_id, handle });
    }

    fn abandon_image(&mut self) {
        if let Some(job) = self.image_job.take() {
            tracing::debug!("Abandoning preload of {}", job.asset_id);
            job.handle.abort();
        }
    }

    /// Completion of a lookahead page fetch.
    pub fn accept_page(&mut self, seq: u64, bucket_index: usize, result: Result<Page>) {
        if self.page_job.as_ref().map(|job| job.seq) != Some(seq) {
            tracing::debug!("Dropping superseded lookahead {}", seq);
            return;
        }
        self.page_job = None;

        match result {
            Ok(page) => self.lookahead = Some((bucket_index, page)),
            Err(e) => tracing::debug!("Lookahead fetch failed: {}", e),
        }
    }

    /// Hand over the prefetched page for `bucket_index`, if there is one.
    pub fn take_lookahead(&mut self, bucket_index: usize) -> Option<Page> {
        if let Some(job) = self.page_job.take() {
            job.handle.abort();
        }
        match self.lookahead.take() {
            Some((index, page)) if index == bucket_index => Some(page),
            _ => None,
        }
    }

    /// Completion of an image preload.
    pub fn finish_image(&mut self, asset_id: &str, result: anyhow::Result<Option<PathBuf>>) {
        if self.image_job.as_ref().map(|job| job.asset_id.as_str()) != Some(asset_id) {
            return;
        }
        self.image_job = None;

        match result {
            Ok(path) => self.ready = Some((asset_id.to_string(), path)),
            Err(e) => tracing::warn!("Failed to preload {}: {:#}", asset_id, e),
        }
    }

    /// Local copy of an image, when its preload has finished.
    pub fn preloaded(&self, asset_id: &str) -> Option<PathBuf> {
        self.ready
            .as_ref()
            .filter(|(id, _)| id == asset_id)
            .and_then(|(_, path)| path.clone())
    }

    pub fn cancel_all(&mut self) {
        if let Some(job) = self.page_job.take() {
            job.handle.abort();
        }
        self.abandon_image();
        self.lookahead = None;
        self.ready = None;
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingPreload;
    use super::*;
    use crate::api::testing::MemorySource;
    use crate::assets::fixtures::{image, video};
    use crate::cursor::{Advance, Cursor};

    async fn playback(source: &MemorySource) -> PlaybackCursor {
        let buckets = source.buckets().await.unwrap();
        PlaybackCursor::initialize(source, buckets, None, None)
            .await
            .unwrap()
    }

    fn step_to(playback: &mut PlaybackCursor, asset_index: usize) {
        let bucket_index = playback.cursor().bucket_index;
        playback.apply(Advance {
            cursor: Cursor {
                bucket_index,
                asset_index,
            },
            page_changed: false,
            new_page: None,
        });
    }

    #[tokio::test]
    async fn fetches_next_bucket_only_near_the_end() {
        let source = Arc::new(MemorySource::new(&[
            ("b0", vec![image("a"), image("b"), image("c")]),
            ("b1", vec![image("d")]),
        ]));
        let mut playback = playback(&source).await;
        let (tx, mut rx) = mpsc::channel(8);
        let mut prefetcher = Prefetcher::new(1, source.clone(), None);

        prefetcher.observe(&playback, &tx);
        assert!(prefetcher.page_job.is_none());

        step_to(&mut playback, 2);
        prefetcher.observe(&playback, &tx);
        prefetcher.observe(&playback, &tx);

        let Some(DriverEvent::LookaheadLoaded {
            seq,
            bucket_index,
            result,
        }) = rx.recv().await
        else {
            panic!("expected lookahead");
        };
        assert_eq!(bucket_index, 1);
        prefetcher.accept_page(seq, bucket_index, result);

        assert_eq!(prefetcher.take_lookahead(1).unwrap().assets[0].id, "d");
        assert_eq!(
            source.fetches().iter().filter(|b| b.as_str() == "b1").count(),
            1
        );
    }

    #[tokio::test]
    async fn superseded_lookahead_is_dropped() {
        let source = Arc::new(MemorySource::new(&[("b0", vec![image("a")])]));
        let mut prefetcher = Prefetcher::new(5, source, None);

        prefetcher.accept_page(42, 1, Ok(Page::new("b1", vec![image("x")])));

        assert!(prefetcher.take_lookahead(1).is_none());
    }

    #[tokio::test]
    async fn preloads_next_image_once() {
        let source = Arc::new(MemorySource::new(&[("b0", vec![image("a"), image("b")])]));
        let playback = playback(&source).await;
        let preload = Arc::new(RecordingPreload::default());
        let (tx, mut rx) = mpsc::channel(8);
        let mut prefetcher = Prefetcher::new(0, source.clone(), Some(preload.clone()));

        prefetcher.observe(&playback, &tx);
        prefetcher.observe(&playback, &tx);

        let Some(DriverEvent::ImagePreloaded { asset_id, result }) = rx.recv().await else {
            panic!("expected preload completion");
        };
        prefetcher.finish_image(&asset_id, result);
        prefetcher.observe(&playback, &tx);

        assert_eq!(*preload.requested.lock().unwrap(), vec!["b".to_string()]);
        assert_eq!(
            prefetcher.preloaded("b"),
            Some(PathBuf::from("/preloaded/b"))
        );
    }

    /// Fetches without keeping a copy.
    #[derive(Default)]
    struct WarmOnly {
        calls: std::sync::Mutex<usize>,
    }

    #[async_trait]
    impl ImagePreload for WarmOnly {
        async fn preload(&self, _asset_id: &str) -> anyhow::Result<Option<PathBuf>> {
            *self.calls.lock().unwrap() += 1;
            Ok(None)
        }
    }

    #[tokio::test]
    async fn warmed_image_is_not_fetched_again() {
        let source = Arc::new(MemorySource::new(&[("b0", vec![image("a"), image("b")])]));
        let playback = playback(&source).await;
        let warm = Arc::new(WarmOnly::default());
        let (tx, mut rx) = mpsc::channel(8);
        let mut prefetcher = Prefetcher::new(0, source.clone(), Some(warm.clone()));

        prefetcher.observe(&playback, &tx);
        let Some(DriverEvent::ImagePreloaded { asset_id, result }) = rx.recv().await else {
            panic!("expected preload completion");
        };
        prefetcher.finish_image(&asset_id, result);
        prefetcher.observe(&playback, &tx);

        assert_eq!(*warm.calls.lock().unwrap(), 1);
        assert_eq!(prefetcher.preloaded("b"), None);
    }

    #[tokio::test]
    async fn skips_videos_and_abandons_superseded_preload() {
        let source = Arc::new(MemorySource::new(&[(
            "b0",
            vec![image("a"), image("b"), video("v", 2.0), image("c")],
        )]));
        let mut playback = playback(&source).await;
        let preload = Arc::new(RecordingPreload::default());
        let (tx, _rx) = mpsc::channel(8);
        let mut prefetcher = Prefetcher::new(0, source.clone(), Some(preload.clone()));

        prefetcher.observe(&playback, &tx);
        assert_eq!(prefetcher.image_job.as_ref().unwrap().asset_id, "b");

        // Next is a video: the pending preload for "b" is abandoned.
        step_to(&mut playback, 1);
        prefetcher.observe(&playback, &tx);
        assert!(prefetcher.image_job.is_none());

        // A late completion for "b" is ignored.
        prefetcher.finish_image("b", Ok(Some(PathBuf::from("/late"))));
        assert_eq!(prefetcher.preloaded("b"), None);
    }
}
