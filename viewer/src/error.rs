//! Error types for slideshow playback.
//!
//! Only the failures the playback core reasons about live here. Peripheral
//! collaborators (config, cache, weather, doorbell) report through `anyhow`.

use thiserror::Error;

/// Failures surfaced by the timeline source, cursor and driver.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SlideshowError {
    /// Bucket list or page could not be fetched or decoded.
    ///
    /// Never interpreted as an empty bucket.
    #[error("failed to fetch {resource}: {reason}")]
    FetchFailed { resource: String, reason: String },

    /// Every bucket in the timeline yielded an empty page.
    #[error("no media found in any bucket")]
    EmptyLibrary,

    /// Detail lookup failed; callers keep the summary asset.
    #[error("detail for asset {asset_id} unavailable: {reason}")]
    AssetDetailUnavailable { asset_id: String, reason: String },
}

impl SlideshowError {
    pub fn fetch(resource: impl Into<String>, reason: impl ToString) -> Self {
        SlideshowError::FetchFailed {
            resource: resource.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether retrying the same request could succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, SlideshowError::EmptyLibrary)
    }
}

pub type Result<T> = std::result::Result<T, SlideshowError>;
