//! Startup loading with retry.
//!
//! Fetch failures are retried here, outside the cursor, with exponential
//! backoff. An empty library is final.

use crate::api::TimelineSource;
use crate::config::PlaybackSettings;
use crate::cursor::PlaybackCursor;
use crate::error::{Result, SlideshowError};
use crate::resume::ResumeStore;
use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &PlaybackSettings) -> Self {
        Self {
            initial: Duration::from_secs(settings.retry_initial_secs.max(1)),
            max: Duration::from_secs(settings.retry_max_secs.max(1)),
        }
    }

    /// Delay before retry number `attempt` (1-based), before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Base delay plus up to 20% random jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter_ms = base.as_millis() as u64 / 5;
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        base + Duration::from_millis(jitter)
    }
}

/// One attempt at building the starting cursor.
pub async fn load_playback(
    source: &dyn TimelineSource,
    resume: &dyn ResumeStore,
    start_bucket: Option<&str>,
) -> Result<PlaybackCursor> {
    let buckets = source.buckets().await?;
    tracing::info!("Timeline has {} buckets", buckets.len());

    let record = match resume.load().await {
        Ok(record) => record,
        Err(e) => {
            tracing::warn!("Failed to read resume record: {:#}", e);
            None
        }
    };

    PlaybackCursor::initialize(source, buckets, record.as_ref(), start_bucket).await
}

/// Retry [`load_playback`] until it succeeds or the library is empty.
///
/// `on_retry` is told about every failed attempt before the backoff sleep.
pub async fn load_with_retry(
    source: &dyn TimelineSource,
    resume: &dyn ResumeStore,
    start_bucket: Option<&str>,
    policy: RetryPolicy,
    mut on_retry: impl FnMut(u32, &SlideshowError),
) -> Result<PlaybackCursor> {
    let mut attempt = 0;
    loop {
        match load_playback(source, resume, start_bucket).await {
            Ok(playback) => return Ok(playback),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => {
                attempt += 1;
                let delay = policy.delay(attempt);
                tracing::warn!("Loading timeline failed ({}), retrying in {:?}", e, delay);
                on_retry(attempt, &e);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::MemorySource;
    use crate::assets::fixtures::image;
    use crate::resume::{MemoryResumeStore, ResumeRecord};
    use std::sync::Arc;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            initial: Duration::from_secs(3),
            max: Duration::from_secs(60),
        }
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = policy();
        assert_eq!(policy.base_delay(1), Duration::from_secs(3));
        assert_eq!(policy.base_delay(2), Duration::from_secs(6));
        assert_eq!(policy.base_delay(4), Duration::from_secs(24));
        assert_eq!(policy.base_delay(6), Duration::from_secs(60));
        assert_eq!(policy.base_delay(500), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_a_fifth() {
        let policy = policy();
        for attempt in 1..8 {
            let base = policy.base_delay(attempt);
            let delay = policy.delay(attempt);
            assert!(delay >= base);
            assert!(delay <= base + base / 5);
        }
    }

    #[tokio::test]
    async fn uses_resume_record_from_store() {
        let source = MemorySource::new(&[("b0", vec![image("a"), image("b")])]);
        let store = MemoryResumeStore::default();
        store.save(&ResumeRecord::new("b0", "b")).await.unwrap();

        let playback = load_playback(&source, &store, None).await.unwrap();

        assert_eq!(playback.current().unwrap().id, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn retries_fetch_failures_until_success() {
        let source = Arc::new(MemorySource::new(&[("b0", vec![image("a")])]));
        source.fail_bucket("b0");
        let store = MemoryResumeStore::default();

        let healer = {
            let source = source.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                source.heal_bucket("b0");
            })
        };

        let mut retries = Vec::new();
        let playback = load_with_retry(&*source, &store, None, policy(), |n, _| {
            retries.push(n)
        })
        .await
        .unwrap();

        healer.await.unwrap();
        assert_eq!(playback.current().unwrap().id, "a");
        assert!(retries.len() >= 2);
        assert_eq!(retries[0], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_library_is_not_retried() {
        let source = MemorySource::new(&[("b0", vec![])]);
        let store = MemoryResumeStore::default();
        let mut retries = 0;

        let err = load_with_retry(&source, &store, None, policy(), |_, _| retries += 1)
            .await
            .unwrap_err();

        assert_eq!(err, SlideshowError::EmptyLibrary);
        assert_eq!(retries, 0);
    }
}
