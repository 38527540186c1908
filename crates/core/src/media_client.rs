//! Media server client (C1): a narrow trait over the subset of the Jellyfin
//! HTTP API this system needs, plus the one production adapter and a
//! deterministic in-memory double for tests.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

const MIN_REQUEST_INTERVAL: Duration = Duration::from_millis(100);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_MAX_UPLOAD_ATTEMPTS: u32 = 3;
const UPLOAD_RETRY_BASE: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum MediaClientError {
    #[error("media server returned {status}: {message}")]
    ApiError { status: u16, message: String },

    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("response parse error: {0}")]
    ParseError(String),

    #[error("item {0} not found")]
    ItemNotFound(String),

    #[error("item {0} has no poster image")]
    PosterMissing(String),

    #[error("uploaded poster failed verification: {0}")]
    UploadVerificationFailed(String),

    #[error("authentication failed: {0}")]
    AuthError(String),
}

impl MediaClientError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MediaClientError::RequestFailed(_) | MediaClientError::UploadVerificationFailed(_)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Library {
    pub id: String,
    pub name: String,
    pub collection_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: String,
    pub name: String,
    pub library_id: String,
    pub item_type: String,
    pub tags: Vec<String>,
    pub has_poster: bool,
    pub media_streams: serde_json::Value,
    pub community_rating: Option<f64>,
    pub official_rating: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    /// Set for `Episode` items; the series they belong to. `None` for
    /// movies and for the series item itself.
    pub series_id: Option<String>,
}

/// Magic numbers this system will accept for an uploaded poster. Anything
/// else fails upload verification even if Jellyfin accepted the bytes.
const JPEG_MAGIC: [u8; 3] = [0xFF, 0xD8, 0xFF];
const PNG_MAGIC: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

pub fn looks_like_image(bytes: &[u8]) -> bool {
    bytes.starts_with(&JPEG_MAGIC) || bytes.starts_with(&PNG_MAGIC)
}

/// Subset of the Jellyfin HTTP API this system depends on. Exactly one
/// production adapter ([`JellyfinClient`]) and one deterministic test
/// double ([`StubMediaServer`]) implement it.
#[async_trait]
pub trait MediaServerClient: Send + Sync {
    async fn test_connection(&self) -> Result<(), MediaClientError>;
    async fn list_libraries(&self) -> Result<Vec<Library>, MediaClientError>;
    async fn list_library_items(&self, library_id: &str) -> Result<Vec<MediaItem>, MediaClientError>;
    async fn get_item(&self, item_id: &str) -> Result<MediaItem, MediaClientError>;
    async fn get_series_episodes(&self, series_id: &str) -> Result<Vec<MediaItem>, MediaClientError>;
    async fn download_poster(&self, item_id: &str) -> Result<Vec<u8>, MediaClientError>;
    async fn upload_poster(&self, item_id: &str, image: &[u8]) -> Result<(), MediaClientError>;
    async fn get_tags(&self, item_id: &str) -> Result<Vec<String>, MediaClientError>;
    async fn add_tag(&self, item_id: &str, tag: &str) -> Result<(), MediaClientError>;
    async fn remove_tag(&self, item_id: &str, tag: &str) -> Result<(), MediaClientError>;
}

/// reqwest-backed production adapter. Jellyfin has no documented
/// rate limit but a self-imposed minimum spacing keeps a full-library scan
/// from hammering a server that also serves interactive playback.
pub struct JellyfinClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    user_id: String,
    last_request: Mutex<Option<std::time::Instant>>,
    max_upload_attempts: u32,
}

impl JellyfinClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::with_max_upload_attempts(base_url, api_key, user_id, DEFAULT_MAX_UPLOAD_ATTEMPTS)
    }

    pub fn with_max_upload_attempts(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        user_id: impl Into<String>,
        max_upload_attempts: u32,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client builds with default TLS backend");
        JellyfinClient {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            user_id: user_id.into(),
            last_request: Mutex::new(None),
            max_upload_attempts: max_upload_attempts.max(1),
        }
    }

    async fn throttle(&self) {
        let mut guard = self.last_request.lock().await;
        if let Some(last) = *guard {
            let elapsed = last.elapsed();
            if elapsed < MIN_REQUEST_INTERVAL {
                tokio::time::sleep(MIN_REQUEST_INTERVAL - elapsed).await;
            }
        }
        *guard = Some(std::time::Instant::now());
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json(&self, path: &str) -> Result<serde_json::Value, MediaClientError> {
        self.throttle().await;
        let response = self
            .client
            .get(self.url(path))
            .header("X-Emby-Token", &self.api_key)
            .send()
            .await
            .map_err(|e| MediaClientError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(MediaClientError::ApiError { status, message });
        }

        response.json().await.map_err(|e| MediaClientError::ParseError(e.to_string()))
    }

    async fn upload_poster_once(&self, item_id: &str, image: &[u8]) -> Result<(), MediaClientError> {
        self.throttle().await;
        let encoded = base64::engine::general_purpose::STANDARD.encode(image);
        let response = self
            .client
            .post(self.url(&format!("/Items/{item_id}/Images/Primary")))
            .header("X-Emby-Token", &self.api_key)
            .header("Content-Type", "image/jpeg")
            .body(encoded)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .map_err(|e| MediaClientError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(MediaClientError::ApiError { status, message });
        }

        self.throttle().await;
        let verify = self.download_poster(item_id).await?;
        if !looks_like_image(&verify) {
            return Err(MediaClientError::UploadVerificationFailed(item_id.to_string()));
        }
        Ok(())
    }

    fn item_from_json(&self, value: &serde_json::Value) -> Result<MediaItem, MediaClientError> {
        let id = value["Id"].as_str().ok_or_else(|| MediaClientError::ParseError("missing Id".into()))?;
        Ok(MediaItem {
            id: id.to_string(),
            name: value["Name"].as_str().unwrap_or_default().to_string(),
            library_id: value["ParentId"].as_str().unwrap_or_default().to_string(),
            item_type: value["Type"].as_str().unwrap_or_default().to_string(),
            tags: value["Tags"]
                .as_array()
                .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                .unwrap_or_default(),
            has_poster: value["ImageTags"].get("Primary").is_some(),
            media_streams: value["MediaStreams"].clone(),
            community_rating: value["CommunityRating"].as_f64(),
            official_rating: value["OfficialRating"].as_str().map(String::from),
            width: value["Width"].as_i64(),
            height: value["Height"].as_i64(),
            series_id: value["SeriesId"].as_str().map(String::from),
        })
    }
}

#[async_trait]
impl MediaServerClient for JellyfinClient {
    async fn test_connection(&self) -> Result<(), MediaClientError> {
        self.get_json("/System/Info").await?;
        Ok(())
    }

    async fn list_libraries(&self) -> Result<Vec<Library>, MediaClientError> {
        let body = self.get_json("/Library/VirtualFolders").await?;
        let items = body.as_array().ok_or_else(|| MediaClientError::ParseError("expected array".into()))?;
        Ok(items
            .iter()
            .filter_map(|v| {
                Some(Library {
                    id: v["ItemId"].as_str()?.to_string(),
                    name: v["Name"].as_str().unwrap_or_default().to_string(),
                    collection_type: v["CollectionType"].as_str().map(String::from),
                })
            })
            .collect())
    }

    async fn list_library_items(&self, library_id: &str) -> Result<Vec<MediaItem>, MediaClientError> {
        let path = format!(
            "/Users/{}/Items?ParentId={}&Recursive=true&Fields=Tags,MediaStreams,CommunityRating,OfficialRating",
            self.user_id, library_id
        );
        let body = self.get_json(&path).await?;
        let items = body["Items"].as_array().ok_or_else(|| MediaClientError::ParseError("missing Items".into()))?;
        items.iter().map(|v| self.item_from_json(v)).collect()
    }

    async fn get_item(&self, item_id: &str) -> Result<MediaItem, MediaClientError> {
        let path = format!("/Users/{}/Items/{item_id}?Fields=Tags,MediaStreams,CommunityRating,OfficialRating", self.user_id);
        let body = self.get_json(&path).await.map_err(|e| match e {
            MediaClientError::ApiError { status: 404, .. } => MediaClientError::ItemNotFound(item_id.to_string()),
            other => other,
        })?;
        self.item_from_json(&body)
    }

    async fn get_series_episodes(&self, series_id: &str) -> Result<Vec<MediaItem>, MediaClientError> {
        let path = format!(
            "/Shows/{series_id}/Episodes?UserId={}&Fields=Tags,MediaStreams,CommunityRating,OfficialRating",
            self.user_id
        );
        let body = self.get_json(&path).await?;
        let items = body["Items"].as_array().ok_or_else(|| MediaClientError::ParseError("missing Items".into()))?;
        items.iter().map(|v| self.item_from_json(v)).collect()
    }

    async fn download_poster(&self, item_id: &str) -> Result<Vec<u8>, MediaClientError> {
        self.throttle().await;
        let response = self
            .client
            .get(self.url(&format!("/Items/{item_id}/Images/Primary")))
            .header("X-Emby-Token", &self.api_key)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .map_err(|e| MediaClientError::RequestFailed(e.to_string()))?;

        if response.status().as_u16() == 404 {
            return Err(MediaClientError::PosterMissing(item_id.to_string()));
        }
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(MediaClientError::ApiError { status, message });
        }
        let bytes = response.bytes().await.map_err(|e| MediaClientError::RequestFailed(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    /// Up to `max_upload_attempts` tries, each separated by an exponential
    /// backoff with full jitter, before giving up on a retryable failure.
    /// A non-retryable error (e.g. the item vanished) returns immediately.
    async fn upload_poster(&self, item_id: &str, image: &[u8]) -> Result<(), MediaClientError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.upload_poster_once(item_id, image).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.max_upload_attempts && e.is_retryable() => {
                    let backoff = UPLOAD_RETRY_BASE * 2u32.pow(attempt - 1);
                    let jitter = Duration::from_millis(rand::random::<u64>() % (backoff.as_millis() as u64 + 1));
                    tracing::warn!("upload attempt {attempt} for poster {item_id} failed ({e}), retrying after {jitter:?}");
                    tokio::time::sleep(jitter).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_tags(&self, item_id: &str) -> Result<Vec<String>, MediaClientError> {
        Ok(self.get_item(item_id).await?.tags)
    }

    /// Jellyfin has no tag-patch endpoint; the full item payload must be
    /// re-fetched and re-posted with the updated tag list.
    async fn add_tag(&self, item_id: &str, tag: &str) -> Result<(), MediaClientError> {
        let path = format!("/Users/{}/Items/{item_id}", self.user_id);
        let mut body = self.get_json(&path).await?;
        let tags = body["Tags"].as_array_mut().map(std::mem::take).unwrap_or_default();
        let mut tags: Vec<String> = tags.into_iter().filter_map(|v| v.as_str().map(String::from)).collect();
        if !tags.iter().any(|t| t == tag) {
            tags.push(tag.to_string());
        }
        body["Tags"] = serde_json::json!(tags);
        self.post_item(item_id, body).await
    }

    async fn remove_tag(&self, item_id: &str, tag: &str) -> Result<(), MediaClientError> {
        let path = format!("/Users/{}/Items/{item_id}", self.user_id);
        let mut body = self.get_json(&path).await?;
        let tags = body["Tags"].as_array_mut().map(std::mem::take).unwrap_or_default();
        let tags: Vec<String> =
            tags.into_iter().filter_map(|v| v.as_str().map(String::from)).filter(|t| t != tag).collect();
        body["Tags"] = serde_json::json!(tags);
        self.post_item(item_id, body).await
    }
}

impl JellyfinClient {
    async fn post_item(&self, item_id: &str, body: serde_json::Value) -> Result<(), MediaClientError> {
        self.throttle().await;
        let response = self
            .client
            .post(self.url(&format!("/Items/{item_id}")))
            .header("X-Emby-Token", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| MediaClientError::RequestFailed(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(MediaClientError::ApiError { status, message });
        }
        Ok(())
    }
}

/// Deterministic in-memory double for tests. Holds a fixed item catalog and
/// records uploads/tag mutations so assertions can inspect them afterward.
pub struct StubMediaServer {
    pub items: std::sync::Mutex<std::collections::HashMap<String, MediaItem>>,
    pub posters: std::sync::Mutex<std::collections::HashMap<String, Vec<u8>>>,
    pub fail_upload_verification_for: std::sync::Mutex<std::collections::HashSet<String>>,
    pub fail_tag_update_for: std::sync::Mutex<std::collections::HashSet<String>>,
    pub series_episodes: std::sync::Mutex<std::collections::HashMap<String, Vec<MediaItem>>>,
}

impl StubMediaServer {
    pub fn new() -> Self {
        StubMediaServer {
            items: std::sync::Mutex::new(std::collections::HashMap::new()),
            posters: std::sync::Mutex::new(std::collections::HashMap::new()),
            fail_upload_verification_for: std::sync::Mutex::new(std::collections::HashSet::new()),
            fail_tag_update_for: std::sync::Mutex::new(std::collections::HashSet::new()),
            series_episodes: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn seed_item(&self, item: MediaItem) {
        self.items.lock().unwrap().insert(item.id.clone(), item);
    }

    pub fn seed_poster(&self, item_id: &str, bytes: Vec<u8>) {
        self.posters.lock().unwrap().insert(item_id.to_string(), bytes);
    }

    pub fn seed_series_episodes(&self, series_id: &str, episodes: Vec<MediaItem>) {
        self.series_episodes.lock().unwrap().insert(series_id.to_string(), episodes);
    }
}

impl Default for StubMediaServer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaServerClient for StubMediaServer {
    async fn test_connection(&self) -> Result<(), MediaClientError> {
        Ok(())
    }

    async fn list_libraries(&self) -> Result<Vec<Library>, MediaClientError> {
        Ok(vec![Library { id: "lib-1".into(), name: "Movies".into(), collection_type: Some("movies".into()) }])
    }

    async fn list_library_items(&self, library_id: &str) -> Result<Vec<MediaItem>, MediaClientError> {
        Ok(self.items.lock().unwrap().values().filter(|i| i.library_id == library_id).cloned().collect())
    }

    async fn get_item(&self, item_id: &str) -> Result<MediaItem, MediaClientError> {
        self.items.lock().unwrap().get(item_id).cloned().ok_or_else(|| MediaClientError::ItemNotFound(item_id.to_string()))
    }

    async fn get_series_episodes(&self, series_id: &str) -> Result<Vec<MediaItem>, MediaClientError> {
        Ok(self.series_episodes.lock().unwrap().get(series_id).cloned().unwrap_or_default())
    }

    async fn download_poster(&self, item_id: &str) -> Result<Vec<u8>, MediaClientError> {
        self.posters.lock().unwrap().get(item_id).cloned().ok_or_else(|| MediaClientError::PosterMissing(item_id.to_string()))
    }

    async fn upload_poster(&self, item_id: &str, image: &[u8]) -> Result<(), MediaClientError> {
        if self.fail_upload_verification_for.lock().unwrap().contains(item_id) {
            return Err(MediaClientError::UploadVerificationFailed(item_id.to_string()));
        }
        self.posters.lock().unwrap().insert(item_id.to_string(), image.to_vec());
        Ok(())
    }

    async fn get_tags(&self, item_id: &str) -> Result<Vec<String>, MediaClientError> {
        Ok(self.get_item(item_id).await?.tags)
    }

    async fn add_tag(&self, item_id: &str, tag: &str) -> Result<(), MediaClientError> {
        if self.fail_tag_update_for.lock().unwrap().contains(item_id) {
            return Err(MediaClientError::RequestFailed("simulated tag update failure".into()));
        }
        let mut items = self.items.lock().unwrap();
        let item = items.get_mut(item_id).ok_or_else(|| MediaClientError::ItemNotFound(item_id.to_string()))?;
        if !item.tags.iter().any(|t| t == tag) {
            item.tags.push(tag.to_string());
        }
        Ok(())
    }

    async fn remove_tag(&self, item_id: &str, tag: &str) -> Result<(), MediaClientError> {
        let mut items = self.items.lock().unwrap();
        let item = items.get_mut(item_id).ok_or_else(|| MediaClientError::ItemNotFound(item_id.to_string()))?;
        item.tags.retain(|t| t != tag);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_item(id: &str) -> MediaItem {
        MediaItem {
            id: id.into(),
            name: "Example".into(),
            library_id: "lib-1".into(),
            item_type: "Movie".into(),
            tags: vec![],
            has_poster: true,
            media_streams: serde_json::json!([]),
            community_rating: Some(7.5),
            official_rating: None,
            width: Some(1920),
            height: Some(1080),
            series_id: None,
        }
    }

    #[tokio::test]
    async fn stub_upload_round_trips_poster_bytes() {
        let server = StubMediaServer::new();
        server.seed_item(sample_item("item-1"));
        server.upload_poster("item-1", b"\xff\xd8\xffabc").await.unwrap();
        let bytes = server.download_poster("item-1").await.unwrap();
        assert_eq!(bytes, b"\xff\xd8\xffabc");
    }

    #[tokio::test]
    async fn stub_upload_honors_forced_verification_failure() {
        let server = StubMediaServer::new();
        server.seed_item(sample_item("item-1"));
        server.fail_upload_verification_for.lock().unwrap().insert("item-1".to_string());
        let err = server.upload_poster("item-1", b"\xff\xd8\xffabc").await.unwrap_err();
        assert!(matches!(err, MediaClientError::UploadVerificationFailed(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn stub_add_tag_is_idempotent() {
        let server = StubMediaServer::new();
        server.seed_item(sample_item("item-1"));
        server.add_tag("item-1", "aphrodite-overlay").await.unwrap();
        server.add_tag("item-1", "aphrodite-overlay").await.unwrap();
        let tags = server.get_tags("item-1").await.unwrap();
        assert_eq!(tags.iter().filter(|t| *t == "aphrodite-overlay").count(), 1);
    }

    #[test]
    fn magic_number_check_accepts_jpeg_and_png_rejects_other() {
        assert!(looks_like_image(b"\xff\xd8\xffrest"));
        assert!(looks_like_image(b"\x89PNG\r\n\x1a\nrest"));
        assert!(!looks_like_image(b"not an image"));
    }
}
