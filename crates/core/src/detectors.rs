//! Badge detectors and poster composer (C5 collaborators): narrow traits so
//! the poster pipeline can be exercised against deterministic stubs without
//! touching a real audio/resolution/review/awards data source or an actual
//! image compositor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::media_client::{MediaItem, MediaServerClient};

/// A series samples at most this many episodes when deriving its dominant
/// audio format — enough to outvote one oddball episode's commentary track
/// without paging through an entire long-running show.
const SERIES_AUDIO_SAMPLE_SIZE: usize = 5;

/// Series-level detector results change rarely; caching them for a day
/// avoids re-deriving the same audio/resolution/awards facts for every
/// episode of a long-running show in the same batch.
const DETECTOR_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const DETECTOR_CACHE_CAPACITY: u64 = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error("no resolution information available for {0}")]
    NoResolutionInfo(String),
    #[error("composer failed: {0}")]
    ComposerFailed(String),
    #[error("failed to list episodes for series {0}: {1}")]
    SeriesLookupFailed(String, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    Dts,
    DtsHdMa,
    DolbyDigital,
    DolbyDigitalPlus,
    DolbyAtmos,
    TrueHd,
    Pcm,
    Aac,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionTier {
    Sd,
    Hd720,
    Hd1080,
    Uhd4k,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewScore {
    pub source: String,
    pub score: f64,
    pub max_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Award {
    pub name: String,
    pub category: Option<String>,
    pub year: Option<i32>,
}

#[async_trait]
pub trait AudioDetector: Send + Sync {
    async fn detect(&self, item: &MediaItem) -> Result<Option<AudioFormat>, DetectorError>;
}

#[async_trait]
pub trait ResolutionDetector: Send + Sync {
    async fn detect(&self, item: &MediaItem) -> Result<Option<ResolutionTier>, DetectorError>;
}

#[async_trait]
pub trait ReviewDetector: Send + Sync {
    async fn detect(&self, item: &MediaItem) -> Result<Option<ReviewScore>, DetectorError>;
}

#[async_trait]
pub trait AwardsDetector: Send + Sync {
    async fn detect(&self, item: &MediaItem) -> Result<Vec<Award>, DetectorError>;
}

/// Everything the composer needs to know about one poster's badges.
#[derive(Debug, Clone, Default)]
pub struct BadgeFacts {
    pub audio: Option<AudioFormat>,
    pub resolution: Option<ResolutionTier>,
    pub review: Option<ReviewScore>,
    pub awards: Vec<Award>,
}

#[async_trait]
pub trait PosterComposer: Send + Sync {
    /// Returns the composited image bytes.
    async fn compose(&self, original: &[u8], facts: &BadgeFacts) -> Result<Vec<u8>, DetectorError>;
}

/// Score a single audio stream entry from Jellyfin's `MediaStreams` array.
/// Lossless and object-based formats (Atmos, TrueHD, DTS-HD MA, PCM) get the
/// highest base score; channel count and bitrate break ties between streams
/// that share a format, e.g. a 7.1 DTS track over a 5.1 one.
fn score_audio_stream(stream: &Value) -> Option<(AudioFormat, u32)> {
    let codec = stream["Codec"].as_str().unwrap_or_default().to_lowercase();
    let profile = stream["Profile"].as_str().unwrap_or_default().to_lowercase();
    let channels = stream["Channels"].as_u64().unwrap_or(0) as u32;
    let bitrate = stream["BitRate"].as_u64().unwrap_or(0);

    let format = match codec.as_str() {
        "truehd" if profile.contains("atmos") => AudioFormat::DolbyAtmos,
        "eac3" if profile.contains("atmos") => AudioFormat::DolbyAtmos,
        "truehd" => AudioFormat::TrueHd,
        "dts" if profile.contains("ma") || profile.contains("hd ma") => AudioFormat::DtsHdMa,
        "dts" => AudioFormat::Dts,
        "eac3" => AudioFormat::DolbyDigitalPlus,
        "ac3" => AudioFormat::DolbyDigital,
        "pcm" | "pcm_s16le" | "pcm_s24le" => AudioFormat::Pcm,
        "aac" => AudioFormat::Aac,
        _ => return None,
    };

    let base = match format {
        AudioFormat::DolbyAtmos => 100,
        AudioFormat::DtsHdMa => 95,
        AudioFormat::TrueHd => 90,
        AudioFormat::Pcm => 85,
        AudioFormat::Dts => 60,
        AudioFormat::DolbyDigitalPlus => 50,
        AudioFormat::DolbyDigital => 40,
        AudioFormat::Aac => 20,
    };
    let channel_bonus = channels * 2;
    let bitrate_bonus = (bitrate / 100_000) as u32;
    Some((format, base + channel_bonus + bitrate_bonus))
}

/// Picks the highest-scoring audio stream out of an item's own
/// `MediaStreams`, ignoring streams the scorer doesn't recognize.
fn dominant_format_for_item(item: &MediaItem) -> Option<AudioFormat> {
    item.media_streams
        .as_array()?
        .iter()
        .filter(|s| s["Type"] == "Audio")
        .filter_map(score_audio_stream)
        .max_by_key(|(_, score)| *score)
        .map(|(format, _)| format)
}

/// Reads audio format from the `MediaStreams` the media server already
/// returned with the item — no extra round trip for a movie or a single
/// episode. For a series item, samples up to
/// [`SERIES_AUDIO_SAMPLE_SIZE`] episodes and takes the quality-weighted mode
/// across them, since one show can legitimately mix formats per episode
/// (a commentary track, a remastered premiere) and no single episode's
/// answer should stand in for the whole series.
pub struct StreamAudioDetector {
    client: Arc<dyn MediaServerClient>,
}

impl StreamAudioDetector {
    pub fn new(client: Arc<dyn MediaServerClient>) -> Self {
        StreamAudioDetector { client }
    }

    async fn detect_series(&self, series_id: &str) -> Result<Option<AudioFormat>, DetectorError> {
        let episodes = self
            .client
            .get_series_episodes(series_id)
            .await
            .map_err(|e| DetectorError::SeriesLookupFailed(series_id.to_string(), e.to_string()))?;

        let mut weights: HashMap<AudioFormat, u32> = HashMap::new();
        for episode in episodes.iter().take(SERIES_AUDIO_SAMPLE_SIZE) {
            let Some(streams) = episode.media_streams.as_array() else { continue };
            if let Some((format, score)) = streams.iter().filter(|s| s["Type"] == "Audio").filter_map(score_audio_stream).max_by_key(|(_, score)| *score)
            {
                *weights.entry(format).or_insert(0) += score;
            }
        }
        Ok(weights.into_iter().max_by_key(|(_, weight)| *weight).map(|(format, _)| format))
    }
}

#[async_trait]
impl AudioDetector for StreamAudioDetector {
    async fn detect(&self, item: &MediaItem) -> Result<Option<AudioFormat>, DetectorError> {
        if item.item_type.eq_ignore_ascii_case("series") {
            return self.detect_series(&item.id).await;
        }
        Ok(dominant_format_for_item(item))
    }
}

pub struct DimensionResolutionDetector;

#[async_trait]
impl ResolutionDetector for DimensionResolutionDetector {
    async fn detect(&self, item: &MediaItem) -> Result<Option<ResolutionTier>, DetectorError> {
        let height = item.height.ok_or_else(|| DetectorError::NoResolutionInfo(item.id.clone()))?;
        Ok(Some(match height {
            h if h >= 2000 => ResolutionTier::Uhd4k,
            h if h >= 1000 => ResolutionTier::Hd1080,
            h if h >= 700 => ResolutionTier::Hd720,
            _ => ResolutionTier::Sd,
        }))
    }
}

/// Uses the `CommunityRating`/`OfficialRating` fields the media server
/// already supplies rather than calling out to an external review API.
pub struct CommunityReviewDetector;

#[async_trait]
impl ReviewDetector for CommunityReviewDetector {
    async fn detect(&self, item: &MediaItem) -> Result<Option<ReviewScore>, DetectorError> {
        Ok(item.community_rating.map(|score| ReviewScore { source: "jellyfin".into(), score, max_score: 10.0 }))
    }
}

/// No awards data source is wired in this deployment; always empty.
pub struct NoopAwardsDetector;

#[async_trait]
impl AwardsDetector for NoopAwardsDetector {
    async fn detect(&self, _item: &MediaItem) -> Result<Vec<Award>, DetectorError> {
        Ok(vec![])
    }
}

/// Wraps any [`AudioDetector`]/[`ResolutionDetector`]/[`ReviewDetector`] with
/// a moka TTL cache. Audio format is a series-level property — every
/// episode of a show shares one dominant format — so its cache is keyed by
/// series id where one is known, letting a batch that processes many
/// episodes of the same show pay for series-level detection once instead of
/// per episode. Resolution genuinely varies episode to episode (a
/// remastered pilot, a lower-bitrate finale), so it stays keyed by item id.
pub struct CachedDetectors {
    audio: Arc<dyn AudioDetector>,
    resolution: Arc<dyn ResolutionDetector>,
    review: Arc<dyn ReviewDetector>,
    awards: Arc<dyn AwardsDetector>,
    audio_cache: Cache<String, Option<AudioFormat>>,
    resolution_cache: Cache<String, Option<ResolutionTier>>,
}

impl CachedDetectors {
    pub fn new(
        audio: Arc<dyn AudioDetector>,
        resolution: Arc<dyn ResolutionDetector>,
        review: Arc<dyn ReviewDetector>,
        awards: Arc<dyn AwardsDetector>,
    ) -> Self {
        let audio_cache = Cache::builder().max_capacity(DETECTOR_CACHE_CAPACITY).time_to_live(DETECTOR_CACHE_TTL).build();
        let resolution_cache = Cache::builder().max_capacity(DETECTOR_CACHE_CAPACITY).time_to_live(DETECTOR_CACHE_TTL).build();
        CachedDetectors { audio, resolution, review, awards, audio_cache, resolution_cache }
    }

    pub async fn facts_for(&self, item: &MediaItem) -> Result<BadgeFacts, DetectorError> {
        // The series item's own id doubles as the series key; an episode
        // carries it separately in `series_id`. A standalone movie has
        // neither, so it falls back to its own id.
        let audio_cache_key = if item.item_type.eq_ignore_ascii_case("series") {
            item.id.clone()
        } else {
            item.series_id.clone().unwrap_or_else(|| item.id.clone())
        };

        let audio = match self.audio_cache.get(&audio_cache_key).await {
            Some(cached) => cached,
            None => {
                let detected = self.audio.detect(item).await?;
                self.audio_cache.insert(audio_cache_key, detected).await;
                detected
            }
        };
        let resolution = match self.resolution_cache.get(&item.id).await {
            Some(cached) => cached,
            None => {
                let detected = self.resolution.detect(item).await?;
                self.resolution_cache.insert(item.id.clone(), detected).await;
                detected
            }
        };
        let review = self.review.detect(item).await?;
        let awards = self.awards.detect(item).await?;
        Ok(BadgeFacts { audio, resolution, review, awards })
    }
}

/// Deterministic composer for tests: appends a short marker footer to the
/// original bytes rather than doing real image compositing.
pub struct StubComposer;

#[async_trait]
impl PosterComposer for StubComposer {
    async fn compose(&self, original: &[u8], facts: &BadgeFacts) -> Result<Vec<u8>, DetectorError> {
        let mut out = original.to_vec();
        out.extend_from_slice(b"|badges:");
        if facts.audio.is_some() {
            out.extend_from_slice(b"audio,");
        }
        if facts.resolution.is_some() {
            out.extend_from_slice(b"resolution,");
        }
        if facts.review.is_some() {
            out.extend_from_slice(b"review,");
        }
        if !facts.awards.is_empty() {
            out.extend_from_slice(b"awards,");
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media_client::StubMediaServer;

    fn sample_item() -> MediaItem {
        MediaItem {
            id: "item-1".into(),
            name: "Example".into(),
            library_id: "lib-1".into(),
            item_type: "Movie".into(),
            tags: vec![],
            has_poster: true,
            media_streams: serde_json::json!([{"Type": "Audio", "Codec": "truehd", "Profile": "Dolby Atmos"}]),
            community_rating: Some(8.2),
            official_rating: None,
            width: Some(3840),
            height: Some(2160),
            series_id: None,
        }
    }

    #[tokio::test]
    async fn stream_audio_detector_recognizes_atmos() {
        let detector = StreamAudioDetector::new(Arc::new(StubMediaServer::new()));
        let detected = detector.detect(&sample_item()).await.unwrap();
        assert_eq!(detected, Some(AudioFormat::DolbyAtmos));
    }

    #[tokio::test]
    async fn stream_audio_detector_picks_highest_scoring_stream() {
        let mut item = sample_item();
        item.media_streams = serde_json::json!([
            { "Type": "Audio", "Codec": "aac", "Channels": 2 },
            { "Type": "Audio", "Codec": "truehd", "Profile": "Dolby Atmos", "Channels": 8 },
            { "Type": "Audio", "Codec": "eac3", "Channels": 6 },
        ]);
        let detector = StreamAudioDetector::new(Arc::new(StubMediaServer::new()));
        let detected = detector.detect(&item).await.unwrap();
        assert_eq!(detected, Some(AudioFormat::DolbyAtmos));
    }

    #[tokio::test]
    async fn stream_audio_detector_samples_series_episodes_for_quality_weighted_mode() {
        let server = Arc::new(StubMediaServer::new());
        let mut series = sample_item();
        series.id = "series-1".into();
        series.item_type = "Series".into();

        let dts_episode = |id: &str| MediaItem {
            id: id.into(),
            media_streams: serde_json::json!([{ "Type": "Audio", "Codec": "dts", "Profile": "DTS-HD MA", "Channels": 6 }]),
            ..sample_item()
        };
        let stereo_episode = |id: &str| MediaItem {
            id: id.into(),
            media_streams: serde_json::json!([{ "Type": "Audio", "Codec": "aac", "Channels": 2 }]),
            ..sample_item()
        };
        server.seed_series_episodes(
            "series-1",
            vec![dts_episode("ep-1"), dts_episode("ep-2"), dts_episode("ep-3"), stereo_episode("ep-4")],
        );

        let detector = StreamAudioDetector::new(server);
        let detected = detector.detect(&series).await.unwrap();
        assert_eq!(detected, Some(AudioFormat::DtsHdMa));
    }

    #[tokio::test]
    async fn dimension_resolution_detector_maps_4k() {
        let detected = DimensionResolutionDetector.detect(&sample_item()).await.unwrap();
        assert_eq!(detected, Some(ResolutionTier::Uhd4k));
    }

    #[tokio::test]
    async fn cached_detectors_reuse_second_lookup() {
        let detectors = CachedDetectors::new(
            Arc::new(StreamAudioDetector::new(Arc::new(StubMediaServer::new()))),
            Arc::new(DimensionResolutionDetector),
            Arc::new(CommunityReviewDetector),
            Arc::new(NoopAwardsDetector),
        );
        let item = sample_item();
        let first = detectors.facts_for(&item).await.unwrap();
        let second = detectors.facts_for(&item).await.unwrap();
        assert_eq!(first.audio, second.audio);
        assert_eq!(first.resolution, second.resolution);
    }
}
