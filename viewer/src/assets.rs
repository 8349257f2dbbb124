//! Timeline data model and wire normalization.
//!
//! The timeline API answers bucket pages in two shapes: column-oriented
//! (`{id: [], fileCreatedAt: [], ...}`) and row-oriented (`{items: [...]}`).
//! Both are decoded here and normalized into [`Asset`] records.

use crate::error::{Result, SlideshowError};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;

/// A server-defined partition of the timeline.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Bucket {
    #[serde(rename = "timeBucket")]
    pub id: String,
    #[serde(rename = "count", default)]
    pub item_count: u64,
}

impl Bucket {
    pub fn new(id: impl Into<String>, item_count: u64) -> Self {
        Self {
            id: id.into(),
            item_count,
        }
    }

    /// Human readable name for bucket listings.
    pub fn display_name(&self) -> String {
        let Some(date) = self
            .id
            .get(..10)
            .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
        else {
            return self.id.clone();
        };

        use chrono::Datelike;
        match (date.month(), date.day()) {
            (1, 1) => date.format("%Y").to_string(),
            (_, 1) => date.format("%B %Y").to_string(),
            _ => date.format("%B %-d, %Y").to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    Image,
    Video,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Location {
    pub city: Option<String>,
    pub state: Option<String>,
}

impl Location {
    /// "City, State" with missing parts omitted.
    pub fn caption(&self) -> Option<String> {
        let parts: Vec<&str> = [self.city.as_deref(), self.state.as_deref()]
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .collect();
        (!parts.is_empty()).then(|| parts.join(", "))
    }
}

/// A media item from the timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Asset {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub is_favorite: bool,
    pub kind: AssetKind,
    /// Present for videos only.
    pub duration_seconds: Option<f64>,
    pub perceptual_hash: Option<String>,
    /// Motion clip attached to a still image.
    pub linked_video_id: Option<String>,
    pub location: Option<Location>,
}

impl Asset {
    pub fn is_video(&self) -> bool {
        self.kind == AssetKind::Video
    }

    pub fn is_image(&self) -> bool {
        self.kind == AssetKind::Image
    }

    /// Fold a richer record for the same id into this one.
    ///
    /// Fields the detail record leaves empty keep their summary values.
    pub fn merge(&mut self, detail: Asset) {
        if detail.id != self.id {
            return;
        }
        self.created_at = detail.created_at;
        self.is_favorite = detail.is_favorite;
        self.kind = detail.kind;
        self.duration_seconds = detail.duration_seconds.or(self.duration_seconds);
        self.perceptual_hash = detail.perceptual_hash.or(self.perceptual_hash.take());
        self.linked_video_id = detail.linked_video_id.or(self.linked_video_id.take());
        self.location = detail.location.or(self.location.take());
    }

    pub fn date_caption(&self) -> String {
        self.created_at.format("%B %-d, %Y").to_string()
    }

    pub fn location_caption(&self) -> Option<String> {
        self.location.as_ref().and_then(Location::caption)
    }
}

/// The assets of one bucket, in server order.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub bucket_id: String,
    pub assets: Vec<Asset>,
}

impl Page {
    pub fn new(bucket_id: impl Into<String>, assets: Vec<Asset>) -> Self {
        Self {
            bucket_id: bucket_id.into(),
            assets,
        }
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Asset> {
        self.assets.get(index)
    }

    pub fn position(&self, asset_id: &str) -> Option<usize> {
        self.assets.iter().position(|a| a.id == asset_id)
    }
}

/// Row-oriented asset record, as returned by the detail endpoint and by
/// `{items: [...]}` pages.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireAsset {
    id: String,
    file_created_at: DateTime<Utc>,
    #[serde(default)]
    is_favorite: bool,
    #[serde(default, rename = "type")]
    asset_type: Option<String>,
    #[serde(default)]
    is_image: Option<bool>,
    #[serde(default)]
    duration: Option<String>,
    #[serde(default)]
    thumbhash: Option<String>,
    #[serde(default)]
    live_photo_video_id: Option<String>,
    #[serde(default)]
    exif_info: Option<Location>,
}

impl From<WireAsset> for Asset {
    fn from(wire: WireAsset) -> Self {
        let kind = match (wire.asset_type.as_deref(), wire.is_image) {
            (Some("VIDEO"), _) | (None, Some(false)) => AssetKind::Video,
            _ => AssetKind::Image,
        };
        Asset {
            id: wire.id,
            created_at: wire.file_created_at,
            is_favorite: wire.is_favorite,
            kind,
            duration_seconds: video_duration(kind, wire.duration.as_deref()),
            perceptual_hash: wire.thumbhash,
            linked_video_id: wire.live_photo_video_id,
            location: wire.exif_info.filter(|l| l.caption().is_some()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ColumnPage {
    id: Vec<String>,
    #[serde(default)]
    file_created_at: Vec<DateTime<Utc>>,
    #[serde(default)]
    is_favorite: Vec<bool>,
    #[serde(default)]
    is_image: Vec<bool>,
    #[serde(default)]
    duration: Vec<Option<String>>,
    #[serde(default)]
    thumbhash: Vec<Option<String>>,
    #[serde(default)]
    live_photo_video_id: Vec<Option<String>>,
    #[serde(default)]
    city: Vec<Option<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WirePage {
    Rows { items: Vec<WireAsset> },
    Columns(ColumnPage),
    List(Vec<WireAsset>),
}

/// Decode a bucket page body in either wire shape.
pub fn normalize_page(bucket_id: &str, body: &[u8]) -> Result<Page> {
    let resource = format!("bucket {}", bucket_id);
    let wire: WirePage =
        serde_json::from_slice(body).map_err(|e| SlideshowError::fetch(&resource, e))?;

    let assets = match wire {
        WirePage::Rows { items } | WirePage::List(items) => {
            items.into_iter().map(Asset::from).collect()
        }
        WirePage::Columns(columns) => columns.into_assets(&resource)?,
    };

    Ok(Page::new(bucket_id, assets))
}

impl ColumnPage {
    fn into_assets(self, resource: &str) -> Result<Vec<Asset>> {
        let mut assets = Vec::with_capacity(self.id.len());
        for (i, id) in self.id.into_iter().enumerate() {
            let created_at = *self.file_created_at.get(i).ok_or_else(|| {
                SlideshowError::fetch(resource, "fileCreatedAt column shorter than id column")
            })?;
            // A missing isImage column means the server only lists stills.
            let kind = match self.is_image.get(i) {
                Some(false) => AssetKind::Video,
                _ => AssetKind::Image,
            };
            let column = |col: &Vec<Option<String>>| col.get(i).cloned().flatten();

            assets.push(Asset {
                id,
                created_at,
                is_favorite: self.is_favorite.get(i).copied().unwrap_or(false),
                kind,
                duration_seconds: video_duration(kind, column(&self.duration).as_deref()),
                perceptual_hash: column(&self.thumbhash),
                linked_video_id: column(&self.live_photo_video_id),
                location: column(&self.city).map(|city| Location {
                    city: Some(city),
                    state: None,
                }),
            });
        }
        Ok(assets)
    }
}

fn video_duration(kind: AssetKind, raw: Option<&str>) -> Option<f64> {
    match kind {
        AssetKind::Video => raw.and_then(parse_duration),
        AssetKind::Image => None,
    }
}

/// Parse `H:MM:SS.ffffff` (or plain seconds) into seconds.
pub fn parse_duration(raw: &str) -> Option<f64> {
    let mut total = 0.0;
    for part in raw.trim().split(':') {
        let value: f64 = part.parse().ok()?;
        total = total * 60.0 + value;
    }
    (total.is_finite() && total >= 0.0).then_some(total)
}

/// Relative URLs the presentation layer loads media from.
///
/// They point at the credential-injecting proxy, never at the upstream server.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaLinks {
    pub preview: String,
    pub poster: String,
    pub video: Option<String>,
}

impl MediaLinks {
    pub fn for_asset(prefix: &str, asset: &Asset) -> Self {
        let prefix = prefix.trim_end_matches('/');
        let preview = format!("{}/assets/{}/thumbnail?size=preview", prefix, asset.id);
        let poster = match asset.perceptual_hash.as_deref() {
            Some(hash) => format!("{}&thumbhash={}", preview, urlencoding::encode(hash)),
            None => preview.clone(),
        };
        let video = asset
            .is_video()
            .then(|| format!("{}/assets/{}/video/playback", prefix, asset.id));

        Self {
            preview,
            poster,
            video,
        }
    }
}
