//! LRU disk cache for preloaded preview images.
//!
//! Manages storing, indexing and evicting cached media bytes. Without a
//! cache, [`WarmPreview`] still fetches the next preview ahead of time.

use crate::api::TimelineSource;
use crate::prefetch::ImagePreload;
use anyhow::{Context, Result};
use async_trait::async_trait;
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use walkdir::WalkDir;

const MAX_ENTRIES: usize = 10_000;

/// Variants of an asset that can be cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaVariant {
    Preview,
}

impl MediaVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaVariant::Preview => "preview",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            MediaVariant::Preview => "jpg",
        }
    }
}

/// Metadata for a cached asset.
#[derive(Debug, Clone)]
struct CacheEntry {
    path: PathBuf,
    size: u64,
}

/// LRU cache for media bytes.
pub struct Cache {
    /// Base directory for cached files.
    cache_dir: PathBuf,
    /// Maximum cache size in bytes.
    max_size: u64,
    /// Current cache size in bytes.
    current_size: u64,
    /// LRU tracking, keyed by `<digest>:<variant>`.
    lru: LruCache<String, CacheEntry>,
}

impl Cache {
    /// Create a new cache with the given directory and size limit.
    pub fn new(cache_dir: PathBuf, max_size_bytes: u64) -> Result<Self> {
        fs::create_dir_all(&cache_dir).context("Failed to create cache directory")?;

        let mut cache = Self {
            cache_dir,
            max_size: max_size_bytes,
            current_size: 0,
            lru: LruCache::new(NonZeroUsize::new(MAX_ENTRIES).unwrap_or(NonZeroUsize::MIN)),
        };
        cache.scan_existing();

        tracing::info!(
            "Cache initialized: {:.2} MB / {:.2} MB used",
            cache.current_size as f64 / 1024.0 / 1024.0,
            cache.max_size as f64 / 1024.0 / 1024.0
        );

        Ok(cache)
    }

    /// Index files left by a previous run. Layout is `<digest>/<variant>.<ext>`.
    fn scan_existing(&mut self) {
        for entry in WalkDir::new(&self.cache_dir)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let path = entry.path().to_path_buf();
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let digest = path
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str());
            let variant = path.file_stem().and_then(|n| n.to_str());

            if let (Some(digest), Some(variant)) = (digest, variant) {
                let key = format!("{}:{}", digest, variant);
                let size = metadata.len();
                self.lru.put(key, CacheEntry { path, size });
                self.current_size += size;
            }
        }
    }

    /// Directory name for an asset; ids are not trusted as path components.
    fn digest(asset_id: &str) -> String {
        Sha256::digest(asset_id.as_bytes())
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    fn cache_key(asset_id: &str, variant: MediaVariant) -> String {
        format!("{}:{}", Self::digest(asset_id), variant.as_str())
    }

    fn cache_path(&self, asset_id: &str, variant: MediaVariant) -> PathBuf {
        self.cache_dir
            .join(Self::digest(asset_id))
            .join(format!("{}.{}", variant.as_str(), variant.extension()))
    }

    /// Path of a cached asset, if present.
    pub fn get_cached_path(&self, asset_id: &str, variant: MediaVariant) -> Option<PathBuf> {
        self.lru
            .peek(&Self::cache_key(asset_id, variant))
            .map(|entry| entry.path.clone())
    }

    /// Write bytes for an asset, evicting older entries to stay in budget.
    pub async fn store(
        &mut self,
        asset_id: &str,
        variant: MediaVariant,
        bytes: &[u8],
    ) -> Result<PathBuf> {
        let key = Self::cache_key(asset_id, variant);
        let path = self.cache_path(asset_id, variant);
        let size = bytes.len() as u64;

        if let Some(old) = self.lru.pop(&key) {
            self.current_size = self.current_size.saturating_sub(old.size);
        }

        while self.current_size + size > self.max_size {
            if !self.evict_lru() {
                tracing::warn!("Cache full and cannot evict, continuing anyway");
                break;
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create asset cache directory")?;
        }

        let mut file = tokio::fs::File::create(&path)
            .await
            .context("Failed to create cache file")?;
        file.write_all(bytes)
            .await
            .context("Failed to write cache file")?;
        file.flush().await.context("Failed to flush cache file")?;

        let entry = CacheEntry {
            path: path.clone(),
            size,
        };
        // The key was popped above, so anything returned was evicted for capacity.
        if let Some((_, evicted)) = self.lru.push(key, entry) {
            let _ = fs::remove_file(&evicted.path);
            self.current_size = self.current_size.saturating_sub(evicted.size);
        }
        self.current_size += size;

        tracing::debug!(
            "Cached {} ({:.2} KB), total: {:.2} MB",
            asset_id,
            size as f64 / 1024.0,
            self.current_size as f64 / 1024.0 / 1024.0
        );

        Ok(path)
    }

    /// Evict the least recently used item.
    fn evict_lru(&mut self) -> bool {
        let Some((_, entry)) = self.lru.pop_lru() else {
            return false;
        };
        tracing::debug!("Evicting {:?}", entry.path);

        if entry.path.exists() {
            if let Err(e) = fs::remove_file(&entry.path) {
                tracing::warn!("Failed to remove cached file: {}", e);
            }
        }
        if let Some(parent) = entry.path.parent() {
            let _ = fs::remove_dir(parent); // Ignore error if not empty
        }

        self.current_size = self.current_size.saturating_sub(entry.size);
        true
    }

    /// Mark an asset as recently used.
    pub fn touch(&mut self, asset_id: &str, variant: MediaVariant) {
        let _ = self.lru.get(&Self::cache_key(asset_id, variant));
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            current_size: self.current_size,
            max_size: self.max_size,
            item_count: self.lru.len(),
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub current_size: u64,
    pub max_size: u64,
    pub item_count: usize,
}

/// Downloads preview images into the [`Cache`] ahead of display.
pub struct PreviewCache {
    cache: Arc<RwLock<Cache>>,
    source: Arc<dyn TimelineSource>,
}

impl PreviewCache {
    pub fn new(cache: Arc<RwLock<Cache>>, source: Arc<dyn TimelineSource>) -> Self {
        Self { cache, source }
    }
}

#[async_trait]
impl ImagePreload for PreviewCache {
    async fn preload(&self, asset_id: &str) -> Result<Option<PathBuf>> {
        {
            let mut cache = self.cache.write().await;
            if let Some(path) = cache.get_cached_path(asset_id, MediaVariant::Preview) {
                if path.exists() {
                    cache.touch(asset_id, MediaVariant::Preview);
                    return Ok(Some(path));
                }
            }
        }

        // A broken preview is not worth caching.
        let bytes = fetch_decoded(self.source.as_ref(), asset_id).await?;

        let mut cache = self.cache.write().await;
        let path = cache.store(asset_id, MediaVariant::Preview, &bytes).await?;
        Ok(Some(path))
    }
}

/// Fetches and decodes the next preview without keeping it.
///
/// Warms the server and proxy caches when the disk cache is disabled.
pub struct WarmPreview {
    source: Arc<dyn TimelineSource>,
}

impl WarmPreview {
    pub fn new(source: Arc<dyn TimelineSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl ImagePreload for WarmPreview {
    async fn preload(&self, asset_id: &str) -> Result<Option<PathBuf>> {
        fetch_decoded(self.source.as_ref(), asset_id).await?;
        Ok(None)
    }
}

/// Download a preview and check that it decodes, off the async threads.
async fn fetch_decoded(source: &dyn TimelineSource, asset_id: &str) -> Result<Vec<u8>> {
    let bytes = source.preview_bytes(asset_id).await?;

    tokio::task::spawn_blocking(move || {
        image::load_from_memory(&bytes)
            .map(|img| {
                tracing::debug!("Decoded preview {}x{}", img.width(), img.height());
                bytes
            })
            .context("Preview does not decode")
    })
    .await
    .context("Decode task failed")?
}
