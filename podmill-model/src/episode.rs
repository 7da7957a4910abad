use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ChannelId, EpisodeId, SourceVideoId};

/// Extensible ledger of pipeline milestones attached to an episode row.
///
/// Stored as JSONB; updates always merge with the persisted value, existing
/// keys are preserved unless explicitly overwritten.
pub type AdditionalData = serde_json::Map<String, Value>;

/// Milestone key recording the durable location of the merged media file.
pub const KEY_VIDEO_LOCATION: &str = "videoLocation";

/// Milestone key recording the adaptive-streaming master manifest location.
pub const KEY_MASTER_MANIFEST: &str = "master_m3u8";

/// Milestone key recording the durable location of the audio-only artifact,
/// written as soon as the audio branch lands.
pub const KEY_AUDIO_LOCATION: &str = "audioLocation";

/// The durable record representing one processed piece of source media.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: EpisodeId,
    pub source_video_id: SourceVideoId,
    pub channel_id: ChannelId,

    pub title: String,
    pub description: Option<String>,
    pub host_name: Option<String>,
    pub host_description: Option<String>,
    pub country: Option<String>,
    pub genre: Option<String>,
    pub published_at: Option<DateTime<Utc>>,

    /// Durable location of the merged source file.
    pub original_media_uri: Option<String>,
    /// Master manifest location; absent until transcoding completes.
    pub manifest_uri: Option<String>,
    pub thumbnail_uri: Option<String>,

    pub guests: Vec<String>,
    pub guest_descriptions: Vec<String>,
    pub guest_image_urls: Vec<String>,
    pub topics: Vec<String>,

    pub processing_done: bool,
    pub is_synced: bool,
    pub additional_data: AdditionalData,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Episode {
    /// Whether the merged media location has been recorded.
    pub fn has_media_location(&self) -> bool {
        self.original_media_uri.is_some()
            || self.additional_data.contains_key(KEY_VIDEO_LOCATION)
    }

    /// Whether the adaptive-streaming master manifest has been recorded.
    pub fn has_manifest(&self) -> bool {
        self.manifest_uri.is_some()
            || self.additional_data.contains_key(KEY_MASTER_MANIFEST)
    }
}

/// Business fields required to create a new episode row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEpisode {
    pub source_video_id: SourceVideoId,
    pub channel_id: ChannelId,
    pub title: String,
    pub description: Option<String>,
    pub host_name: Option<String>,
    pub host_description: Option<String>,
    pub country: Option<String>,
    pub genre: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub original_media_uri: Option<String>,
    pub thumbnail_uri: Option<String>,
    #[serde(default)]
    pub additional_data: AdditionalData,
}

/// Typed partial update of an episode row.
///
/// Every field is optional; only supplied fields are touched by the generated
/// UPDATE. `additional_data` is merged into the persisted map, never used as
/// a replacement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EpisodePatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub host_name: Option<String>,
    pub host_description: Option<String>,
    pub country: Option<String>,
    pub genre: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub original_media_uri: Option<String>,
    pub manifest_uri: Option<String>,
    pub thumbnail_uri: Option<String>,
    pub processing_done: Option<bool>,
    pub is_synced: Option<bool>,
    pub additional_data: Option<AdditionalData>,
}

impl EpisodePatch {
    /// True when the patch would not touch any column.
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.host_name.is_none()
            && self.host_description.is_none()
            && self.country.is_none()
            && self.genre.is_none()
            && self.published_at.is_none()
            && self.original_media_uri.is_none()
            && self.manifest_uri.is_none()
            && self.thumbnail_uri.is_none()
            && self.processing_done.is_none()
            && self.is_synced.is_none()
            && self.additional_data.as_ref().is_none_or(|m| m.is_empty())
    }

    /// Patch recording the merged media location milestone.
    pub fn media_location(uri: impl Into<String>) -> Self {
        let uri = uri.into();
        let mut data = AdditionalData::new();
        data.insert(KEY_VIDEO_LOCATION.into(), Value::String(uri.clone()));
        Self {
            original_media_uri: Some(uri),
            additional_data: Some(data),
            ..Self::default()
        }
    }

    /// Patch recording the master manifest location and completion flag.
    pub fn manifest_location(uri: impl Into<String>) -> Self {
        let uri = uri.into();
        let mut data = AdditionalData::new();
        data.insert(KEY_MASTER_MANIFEST.into(), Value::String(uri.clone()));
        Self {
            manifest_uri: Some(uri),
            processing_done: Some(true),
            additional_data: Some(data),
            ..Self::default()
        }
    }
}

/// Merge `incoming` into `current`, overwriting colliding keys and preserving
/// everything else. This is the only sanctioned way to update the milestone
/// ledger.
pub fn merge_additional_data(
    current: &AdditionalData,
    incoming: &AdditionalData,
) -> AdditionalData {
    let mut merged = current.clone();
    for (key, value) in incoming {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_preserves_existing_keys() {
        let mut current = AdditionalData::new();
        current.insert(KEY_VIDEO_LOCATION.into(), Value::String("s3://a".into()));
        current.insert("note".into(), Value::String("keep".into()));

        let mut incoming = AdditionalData::new();
        incoming.insert(KEY_MASTER_MANIFEST.into(), Value::String("s3://m".into()));

        let merged = merge_additional_data(&current, &incoming);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged["note"], Value::String("keep".into()));
        assert_eq!(merged[KEY_VIDEO_LOCATION], Value::String("s3://a".into()));
        assert_eq!(merged[KEY_MASTER_MANIFEST], Value::String("s3://m".into()));
    }

    #[test]
    fn merge_overwrites_colliding_keys() {
        let mut current = AdditionalData::new();
        current.insert(KEY_VIDEO_LOCATION.into(), Value::String("old".into()));

        let mut incoming = AdditionalData::new();
        incoming.insert(KEY_VIDEO_LOCATION.into(), Value::String("new".into()));

        let merged = merge_additional_data(&current, &incoming);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[KEY_VIDEO_LOCATION], Value::String("new".into()));
    }

    #[test]
    fn empty_patch_reports_empty() {
        assert!(EpisodePatch::default().is_empty());
        assert!(
            EpisodePatch {
                additional_data: Some(AdditionalData::new()),
                ..EpisodePatch::default()
            }
            .is_empty()
        );
        assert!(!EpisodePatch::media_location("s3://bucket/ep.mp4").is_empty());
    }

    #[test]
    fn milestone_patches_set_ledger_keys() {
        let media = EpisodePatch::media_location("s3://bucket/ep.mp4");
        assert_eq!(
            media.additional_data.unwrap()[KEY_VIDEO_LOCATION],
            Value::String("s3://bucket/ep.mp4".into())
        );

        let manifest = EpisodePatch::manifest_location("s3://bucket/master.m3u8");
        assert_eq!(manifest.processing_done, Some(true));
        assert_eq!(
            manifest.additional_data.unwrap()[KEY_MASTER_MANIFEST],
            Value::String("s3://bucket/master.m3u8".into())
        );
    }
}
