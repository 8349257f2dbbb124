//! Playback cursor over the bucketed timeline.
//!
//! The timeline is two-level: an ordered bucket list and, per bucket, a
//! lazily fetched page of assets. The cursor walks the concatenation of all
//! non-empty pages as an endless cycle, skipping empty buckets.

use crate::api::TimelineSource;
use crate::assets::{Asset, Bucket, Page};
use crate::error::{Result, SlideshowError};
use crate::resume::ResumeRecord;
use std::sync::Arc;

/// Position into the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub bucket_index: usize,
    pub asset_index: usize,
}

/// Outcome of a forward step.
#[derive(Debug, Clone, PartialEq)]
pub struct Advance {
    pub cursor: Cursor,
    pub page_changed: bool,
    /// Set whenever `page_changed` is.
    pub new_page: Option<Page>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retreat {
    Moved(Cursor),
    NoOp,
}

/// What a forward step needs before it can be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Next asset is in the current page.
    Within(Cursor),
    /// Current page is exhausted; resolve starting at `bucket_index`.
    Cross { bucket_index: usize },
}

/// The current position together with the page it points into.
#[derive(Debug, Clone)]
pub struct PlaybackCursor {
    buckets: Arc<[Bucket]>,
    cursor: Cursor,
    page: Page,
}

impl PlaybackCursor {
    /// Resolve the starting position.
    ///
    /// Priority: explicit start bucket, then the resume record (bucket and
    /// asset must both still exist), then the first non-empty bucket.
    pub async fn initialize(
        source: &dyn TimelineSource,
        buckets: Vec<Bucket>,
        resume: Option<&ResumeRecord>,
        start_bucket: Option<&str>,
    ) -> Result<Self> {
        let buckets: Arc<[Bucket]> = buckets.into();
        if buckets.is_empty() {
            return Err(SlideshowError::EmptyLibrary);
        }

        if let Some(start) = start_bucket {
            match buckets.iter().position(|b| b.id == start) {
                Some(index) => {
                    tracing::info!("Starting at requested bucket {}", start);
                    let (bucket_index, page) =
                        resolve_forward(source, &buckets, index, None).await?;
                    return Ok(Self::at(buckets, bucket_index, 0, page));
                }
                None => tracing::warn!("Requested start bucket {} not in timeline", start),
            }
        }

        let mut hint = None;
        if let Some(record) = resume {
            if let Some(index) = buckets.iter().position(|b| b.id == record.bucket_id) {
                let page = source.page(&record.bucket_id).await?;
                if let Some(asset_index) = page.position(&record.asset_id) {
                    tracing::info!(
                        "Resuming at {} / {}",
                        record.bucket_id,
                        record.asset_id
                    );
                    return Ok(Self::at(buckets, index, asset_index, page));
                }
                tracing::info!("Resume asset {} no longer present", record.asset_id);
                hint = Some(page);
            } else {
                tracing::info!("Resume bucket {} no longer present", record.bucket_id);
            }
        }

        let (bucket_index, page) = resolve_forward(source, &buckets, 0, hint).await?;
        Ok(Self::at(buckets, bucket_index, 0, page))
    }

    fn at(buckets: Arc<[Bucket]>, bucket_index: usize, asset_index: usize, page: Page) -> Self {
        Self {
            buckets,
            cursor: Cursor {
                bucket_index,
                asset_index,
            },
            page,
        }
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    pub fn buckets(&self) -> &Arc<[Bucket]> {
        &self.buckets
    }

    pub fn bucket(&self) -> &Bucket {
        &self.buckets[self.cursor.bucket_index]
    }

    pub fn current(&self) -> Option<&Asset> {
        self.page.get(self.cursor.asset_index)
    }

    /// Next asset within the current page, if any.
    pub fn peek_next(&self) -> Option<&Asset> {
        self.page.get(self.cursor.asset_index + 1)
    }

    /// Assets left in the current page after the current one.
    pub fn remaining_in_page(&self) -> usize {
        self.page.len().saturating_sub(self.cursor.asset_index + 1)
    }

    /// Bucket after the current one, wrapping to the first.
    pub fn next_bucket_index(&self) -> usize {
        (self.cursor.bucket_index + 1) % self.buckets.len()
    }

    pub fn step(&self) -> Step {
        if self.cursor.asset_index + 1 < self.page.len() {
            Step::Within(Cursor {
                bucket_index: self.cursor.bucket_index,
                asset_index: self.cursor.asset_index + 1,
            })
        } else {
            Step::Cross {
                bucket_index: self.next_bucket_index(),
            }
        }
    }

    /// Compute the next position, fetching pages when the current one is
    /// exhausted. Does not move the cursor; see [`PlaybackCursor::apply`].
    ///
    /// `hint` is a prefetched page that stands in for one fetch.
    pub async fn advance(
        &self,
        source: &dyn TimelineSource,
        hint: Option<Page>,
    ) -> Result<Advance> {
        match self.step() {
            Step::Within(cursor) => Ok(Advance {
                cursor,
                page_changed: false,
                new_page: None,
            }),
            Step::Cross { bucket_index } => {
                let (bucket_index, page) =
                    resolve_forward(source, &self.buckets, bucket_index, hint).await?;
                Ok(Self::crossed(bucket_index, page))
            }
        }
    }

    fn crossed(bucket_index: usize, page: Page) -> Advance {
        Advance {
            cursor: Cursor {
                bucket_index,
                asset_index: 0,
            },
            page_changed: true,
            new_page: Some(page),
        }
    }

    pub fn apply(&mut self, advance: Advance) {
        if let Some(page) = advance.new_page {
            self.page = page;
        }
        self.cursor = advance.cursor;
    }

    /// Step back within the current page. Never crosses buckets.
    pub fn retreat(&mut self) -> Retreat {
        if self.cursor.asset_index == 0 {
            return Retreat::NoOp;
        }
        self.cursor.asset_index -= 1;
        Retreat::Moved(self.cursor)
    }

    /// Merge a detail record into the current page. Returns the merged asset
    /// when the id is still present.
    pub fn merge_detail(&mut self, detail: Asset) -> Option<&Asset> {
        let index = self.page.position(&detail.id)?;
        let asset = &mut self.page.assets[index];
        asset.merge(detail);
        Some(asset)
    }
}

/// Find the first non-empty page starting at `start`, visiting every bucket
/// at most once.
///
/// `hint` is a page already fetched for one of the buckets; it is used in
/// place of a fetch when its bucket comes up.
pub async fn resolve_forward(
    source: &dyn TimelineSource,
    buckets: &[Bucket],
    start: usize,
    mut hint: Option<Page>,
) -> Result<(usize, Page)> {
    for offset in 0..buckets.len() {
        let index = (start + offset) % buckets.len();
        let bucket = &buckets[index];

        let page = match hint.take() {
            Some(page) if page.bucket_id == bucket.id => page,
            other => {
                hint = other;
                source.page(&bucket.id).await?
            }
        };

        if !page.is_empty() {
            return Ok((index, page));
        }
        tracing::debug!("Bucket {} is empty, skipping", bucket.id);
    }

    Err(SlideshowError::EmptyLibrary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::MemorySource;
    use crate::assets::fixtures::{image, video};

    fn resume(bucket: &str, asset: &str) -> ResumeRecord {
        ResumeRecord {
            bucket_id: bucket.into(),
            asset_id: asset.into(),
        }
    }

    async fn start(source: &MemorySource) -> PlaybackCursor {
        let buckets = source.buckets().await.unwrap();
        PlaybackCursor::initialize(source, buckets, None, None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn advances_within_page() {
        let source = MemorySource::new(&[("b0", vec![image("a"), image("b"), image("c")])]);
        let mut playback = start(&source).await;

        let step = playback.advance(&source, None).await.unwrap();

        assert_eq!(
            step,
            Advance {
                cursor: Cursor {
                    bucket_index: 0,
                    asset_index: 1
                },
                page_changed: false,
                new_page: None,
            }
        );
        playback.apply(step);
        assert_eq!(playback.current().unwrap().id, "b");
    }

    #[tokio::test]
    async fn crosses_into_next_non_empty_bucket() {
        let source = MemorySource::new(&[
            ("b0", vec![image("a")]),
            ("b1", vec![]),
            ("b2", vec![video("v", 3.0), image("z")]),
        ]);
        let mut playback = start(&source).await;

        let step = playback.advance(&source, None).await.unwrap();

        assert!(step.page_changed);
        assert_eq!(
            step.cursor,
            Cursor {
                bucket_index: 2,
                asset_index: 0
            }
        );
        playback.apply(step);
        assert_eq!(playback.current().unwrap().id, "v");
        assert_eq!(playback.bucket().id, "b2");
    }

    #[tokio::test]
    async fn wraps_from_last_bucket_to_first() {
        let source = MemorySource::new(&[("b0", vec![image("a")]), ("b1", vec![image("b")])]);
        let mut playback = start(&source).await;
        let step = playback.advance(&source, None).await.unwrap();
        playback.apply(step);
        assert_eq!(playback.bucket().id, "b1");

        let step = playback.advance(&source, None).await.unwrap();
        playback.apply(step);

        assert_eq!(playback.cursor(), Cursor { bucket_index: 0, asset_index: 0 });
        assert_eq!(playback.current().unwrap().id, "a");
    }

    #[tokio::test]
    async fn single_asset_library_cycles_through_empty_bucket() {
        let source = MemorySource::new(&[("2024-01", vec![image("a1")]), ("2024-02", vec![])]);
        let mut playback = start(&source).await;

        for _ in 0..3 {
            let step = playback.advance(&source, None).await.unwrap();
            assert!(step.page_changed);
            playback.apply(step);
            assert_eq!(playback.bucket().id, "2024-01");
            assert_eq!(playback.current().unwrap().id, "a1");
        }
    }

    #[tokio::test]
    async fn all_empty_library_fails_both_ways() {
        let source = MemorySource::new(&[("b0", vec![]), ("b1", vec![])]);
        let buckets = source.buckets().await.unwrap();

        let err = PlaybackCursor::initialize(&source, buckets.clone(), None, None)
            .await
            .unwrap_err();
        assert_eq!(err, SlideshowError::EmptyLibrary);

        let err = resolve_forward(&source, &buckets, 1, None).await.unwrap_err();
        assert_eq!(err, SlideshowError::EmptyLibrary);
        // One visit per bucket and no more.
        assert_eq!(source.fetches().len(), 4);
    }

    #[tokio::test]
    async fn no_buckets_is_empty_library() {
        let source = MemorySource::new(&[]);
        let err = PlaybackCursor::initialize(&source, vec![], None, None)
            .await
            .unwrap_err();
        assert_eq!(err, SlideshowError::EmptyLibrary);
    }

    #[tokio::test]
    async fn failed_fetch_is_not_treated_as_empty() {
        let source = MemorySource::new(&[
            ("b0", vec![image("a")]),
            ("b1", vec![image("b")]),
        ]);
        let playback = start(&source).await;
        source.fail_bucket("b1");

        let err = playback.advance(&source, None).await.unwrap_err();

        assert!(matches!(err, SlideshowError::FetchFailed { .. }));
    }

    #[tokio::test]
    async fn resumes_at_saved_position() {
        let source = MemorySource::new(&[
            ("b0", vec![image("a")]),
            ("b1", vec![image("b"), image("c"), image("d")]),
        ]);
        let buckets = source.buckets().await.unwrap();
        let record = resume("b1", "c");

        let playback = PlaybackCursor::initialize(&source, buckets, Some(&record), None)
            .await
            .unwrap();

        assert_eq!(playback.bucket().id, "b1");
        assert_eq!(playback.current().unwrap().id, "c");
        assert_eq!(playback.cursor(), Cursor { bucket_index: 1, asset_index: 1 });
    }

    #[tokio::test]
    async fn missing_resume_bucket_falls_back_to_first_non_empty() {
        let source = MemorySource::new(&[("b0", vec![]), ("b1", vec![image("b")])]);
        let buckets = source.buckets().await.unwrap();
        let record = resume("gone", "x");

        let playback = PlaybackCursor::initialize(&source, buckets, Some(&record), None)
            .await
            .unwrap();

        assert_eq!(playback.current().unwrap().id, "b");
    }

    #[tokio::test]
    async fn missing_resume_asset_falls_back_to_first_non_empty() {
        let source = MemorySource::new(&[("b0", vec![image("a")]), ("b1", vec![image("b")])]);
        let buckets = source.buckets().await.unwrap();
        let record = resume("b1", "deleted");

        let playback = PlaybackCursor::initialize(&source, buckets, Some(&record), None)
            .await
            .unwrap();

        assert_eq!(playback.bucket().id, "b0");
        assert_eq!(playback.current().unwrap().id, "a");
    }

    #[tokio::test]
    async fn resume_page_is_reused_when_it_is_the_fallback() {
        let source = MemorySource::new(&[("b0", vec![image("a")]), ("b1", vec![image("b")])]);
        let buckets = source.buckets().await.unwrap();
        let record = resume("b0", "deleted");

        PlaybackCursor::initialize(&source, buckets, Some(&record), None)
            .await
            .unwrap();

        assert_eq!(source.fetches(), vec!["b0".to_string()]);
    }

    #[tokio::test]
    async fn explicit_start_bucket_wins_over_resume() {
        let source = MemorySource::new(&[
            ("b0", vec![image("a")]),
            ("b1", vec![image("b")]),
            ("b2", vec![image("c"), image("d")]),
        ]);
        let buckets = source.buckets().await.unwrap();
        let record = resume("b1", "b");

        let playback = PlaybackCursor::initialize(&source, buckets, Some(&record), Some("b2"))
            .await
            .unwrap();

        assert_eq!(playback.current().unwrap().id, "c");
    }

    #[tokio::test]
    async fn unknown_start_bucket_falls_through_to_resume() {
        let source = MemorySource::new(&[("b0", vec![image("a")]), ("b1", vec![image("b")])]);
        let buckets = source.buckets().await.unwrap();
        let record = resume("b1", "b");

        let playback = PlaybackCursor::initialize(&source, buckets, Some(&record), Some("nope"))
            .await
            .unwrap();

        assert_eq!(playback.current().unwrap().id, "b");
    }

    #[tokio::test]
    async fn retreat_stays_inside_the_page() {
        let source = MemorySource::new(&[("b0", vec![image("a")]), ("b1", vec![image("b"), image("c")])]);
        let buckets = source.buckets().await.unwrap();
        let record = resume("b1", "c");
        let mut playback = PlaybackCursor::initialize(&source, buckets, Some(&record), None)
            .await
            .unwrap();

        assert_eq!(
            playback.retreat(),
            Retreat::Moved(Cursor { bucket_index: 1, asset_index: 0 })
        );
        assert_eq!(playback.retreat(), Retreat::NoOp);
        assert_eq!(playback.current().unwrap().id, "b");
    }

    #[tokio::test]
    async fn hint_replaces_fetch_for_its_bucket() {
        let source = MemorySource::new(&[("b0", vec![]), ("b1", vec![image("b")])]);
        let buckets = source.buckets().await.unwrap();
        let hint = Page::new("b0", vec![image("cached")]);

        let (index, page) = resolve_forward(&source, &buckets, 0, Some(hint)).await.unwrap();

        assert_eq!(index, 0);
        assert_eq!(page.assets[0].id, "cached");
        assert!(source.fetches().is_empty());
    }

    #[tokio::test]
    async fn advance_uses_hint_for_next_bucket() {
        let source = MemorySource::new(&[("b0", vec![image("a")]), ("b1", vec![image("b")])]);
        let playback = start(&source).await;

        let step = playback
            .advance(&source, Some(Page::new("b1", vec![image("prefetched")])))
            .await
            .unwrap();

        assert_eq!(step.new_page.unwrap().assets[0].id, "prefetched");
        assert_eq!(source.fetches(), vec!["b0".to_string()]);
    }

    #[tokio::test]
    async fn remaining_and_peek() {
        let source = MemorySource::new(&[("b0", vec![image("a"), video("v", 2.0)])]);
        let playback = start(&source).await;

        assert_eq!(playback.remaining_in_page(), 1);
        assert_eq!(playback.peek_next().unwrap().id, "v");
        assert_eq!(playback.step(), Step::Within(Cursor { bucket_index: 0, asset_index: 1 }));
    }
}
