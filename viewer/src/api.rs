//! Media timeline API client.
//!
//! Talks to an Immich-compatible server. The playback core only sees the
//! [`TimelineSource`] trait.

use crate::assets::{normalize_page, Asset, Bucket, Page, WireAsset};
use crate::config::ImmichSettings;
use crate::error::{Result, SlideshowError};
use async_trait::async_trait;
use reqwest::Client;
use url::Url;

const TIMELINE_QUERY: [(&str, &str); 3] = [
    ("visibility", "timeline"),
    ("withPartners", "true"),
    ("withStacked", "true"),
];

/// Where buckets, pages and asset bytes come from.
#[async_trait]
pub trait TimelineSource: Send + Sync {
    /// Ordered bucket list. Order is authoritative.
    async fn buckets(&self) -> Result<Vec<Bucket>>;

    /// All assets of one bucket. An empty page is a valid answer.
    async fn page(&self, bucket_id: &str) -> Result<Page>;

    /// Superset record for one asset (location and friends).
    async fn asset_detail(&self, asset_id: &str) -> Result<Asset>;

    /// Preview-sized image bytes.
    async fn preview_bytes(&self, asset_id: &str) -> Result<Vec<u8>>;
}

/// Timeline source backed by the Immich REST API.
pub struct ImmichClient {
    client: Client,
    base_url: Url,
    api_key: String,
}

impl ImmichClient {
    pub fn new(client: Client, settings: &ImmichSettings) -> anyhow::Result<Self> {
        let mut base_url = Url::parse(&settings.url)
            .map_err(|e| anyhow::anyhow!("Invalid Immich URL {}: {}", settings.url, e))?;
        // Url::join drops the last segment unless the path ends with a slash.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            client,
            base_url,
            api_key: settings.api_key.clone(),
        })
    }

    fn endpoint(&self, path: &str, resource: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| SlideshowError::fetch(resource, e))
    }

    async fn get(&self, url: Url, query: &[(&str, &str)], resource: &str) -> Result<Vec<u8>> {
        tracing::debug!("GET {}", url);

        let response = self
            .client
            .get(url)
            .query(query)
            .header("x-api-key", &self.api_key)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| SlideshowError::fetch(resource, e))?
            .error_for_status()
            .map_err(|e| SlideshowError::fetch(resource, e))?;

        let bytes = response
            .bytes()
            .await
            .map_err(|e| SlideshowError::fetch(resource, e))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl TimelineSource for ImmichClient {
    async fn buckets(&self) -> Result<Vec<Bucket>> {
        let resource = "bucket list";
        let url = self.endpoint("api/timeline/buckets", resource)?;
        let body = self.get(url, &TIMELINE_QUERY, resource).await?;
        let buckets: Vec<Bucket> =
            serde_json::from_slice(&body).map_err(|e| SlideshowError::fetch(resource, e))?;
        tracing::debug!("Fetched {} buckets", buckets.len());
        Ok(buckets)
    }

    async fn page(&self, bucket_id: &str) -> Result<Page> {
        let resource = format!("bucket {}", bucket_id);
        let url = self.endpoint("api/timeline/bucket", &resource)?;
        let mut query = vec![("timeBucket", bucket_id)];
        query.extend_from_slice(&TIMELINE_QUERY);

        let body = self.get(url, &query, &resource).await?;
        let page = normalize_page(bucket_id, &body)?;
        tracing::debug!("Bucket {} has {} assets", bucket_id, page.len());
        Ok(page)
    }

    async fn asset_detail(&self, asset_id: &str) -> Result<Asset> {
        let unavailable = |reason: String| SlideshowError::AssetDetailUnavailable {
            asset_id: asset_id.to_string(),
            reason,
        };
        let resource = format!("asset {}", asset_id);
        let url = self
            .endpoint(&format!("api/assets/{}", asset_id), &resource)
            .map_err(|e| unavailable(e.to_string()))?;
        let body = self
            .get(url, &[], &resource)
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        let wire: WireAsset =
            serde_json::from_slice(&body).map_err(|e| unavailable(e.to_string()))?;
        Ok(wire.into())
    }

    async fn preview_bytes(&self, asset_id: &str) -> Result<Vec<u8>> {
        let resource = format!("preview {}", asset_id);
        let url = self.endpoint(&format!("api/assets/{}/thumbnail", asset_id), &resource)?;
        self.get(url, &[("size", "preview")], &resource).await
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> ImmichClient {
        let settings = ImmichSettings {
            url: server.uri(),
            api_key: "secret".into(),
            media_prefix: "/api/immich".into(),
            request_timeout_secs: 5,
        };
        ImmichClient::new(Client::new(), &settings).unwrap()
    }

    #[tokio::test]
    async fn fetches_buckets_with_api_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/timeline/buckets"))
            .and(header("x-api-key", "secret"))
            .and(query_param("visibility", "timeline"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"timeBucket": "2024-02-01T00:00:00.000Z", "count": 4},
                {"timeBucket": "2024-01-01T00:00:00.000Z", "count": 0}
            ])))
            .mount(&server)
            .await;

        let buckets = client_for(&server).buckets().await.unwrap();

        assert_eq!(
            buckets,
            vec![
                Bucket::new("2024-02-01T00:00:00.000Z", 4),
                Bucket::new("2024-01-01T00:00:00.000Z", 0),
            ]
        );
    }

    #[tokio::test]
    async fn fetches_column_page_for_bucket() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/timeline/bucket"))
            .and(query_param("timeBucket", "2024-02-01T00:00:00.000Z"))
            .and(query_param("withStacked", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": ["x"],
                "fileCreatedAt": ["2024-02-03T00:00:00Z"],
                "isImage": [true]
            })))
            .mount(&server)
            .await;

        let page = client_for(&server)
            .page("2024-02-01T00:00:00.000Z")
            .await
            .unwrap();

        assert_eq!(page.len(), 1);
        assert_eq!(page.assets[0].id, "x");
    }

    #[tokio::test]
    async fn server_error_is_fetch_failed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/timeline/bucket"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let err = client_for(&server).page("b").await.unwrap_err();

        assert!(matches!(err, SlideshowError::FetchFailed { .. }));
    }

    #[tokio::test]
    async fn detail_failure_is_detail_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/assets/a1"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = client_for(&server).asset_detail("a1").await.unwrap_err();

        assert!(matches!(err, SlideshowError::AssetDetailUnavailable { .. }));
    }

    #[tokio::test]
    async fn detail_carries_location() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/assets/a1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "a1",
                "fileCreatedAt": "2024-02-03T00:00:00Z",
                "type": "IMAGE",
                "exifInfo": {"city": "Bergen", "state": "Vestland", "country": "Norway"}
            })))
            .mount(&server)
            .await;

        let asset = client_for(&server).asset_detail("a1").await.unwrap();

        assert_eq!(asset.location_caption().as_deref(), Some("Bergen, Vestland"));
    }

    #[tokio::test]
    async fn preview_bytes_requests_preview_size() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/assets/a1/thumbnail"))
            .and(query_param("size", "preview"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1, 2, 3]))
            .mount(&server)
            .await;

        let bytes = client_for(&server).preview_bytes("a1").await.unwrap();

        assert_eq!(bytes, vec![1, 2, 3]);
    }
}
