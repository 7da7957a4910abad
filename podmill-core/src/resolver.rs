//! Pipeline state resolution: what repeated delivery of the same work item
//! should do, based on which derived artifacts the episode row records.

use podmill_model::{Episode, EpisodeId};
use tracing::debug;

/// What to run for a source identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineDecision {
    /// No usable prior state. When `existing` is set, the row is reused and
    /// updated rather than a second row being created.
    FullPipeline { existing: Option<EpisodeId> },
    /// Media is durable but the adaptive asset is not: transcode only, reuse
    /// the identity, and do not re-acquire, re-merge, or re-notify.
    ReprocessTranscode { episode_id: EpisodeId },
    /// Both artifacts recorded; idempotent re-delivery, nothing to do.
    Skip { episode_id: EpisodeId },
}

/// Classify an episode row (or its absence) into a pipeline decision.
pub fn resolve(existing: Option<&Episode>) -> PipelineDecision {
    let Some(episode) = existing else {
        return PipelineDecision::FullPipeline { existing: None };
    };

    let decision = match (episode.has_media_location(), episode.has_manifest()) {
        (true, true) => PipelineDecision::Skip {
            episode_id: episode.id,
        },
        (true, false) => PipelineDecision::ReprocessTranscode {
            episode_id: episode.id,
        },
        // A manifest without media violates the write ordering invariant;
        // rebuilding everything against the existing identity is the safe
        // recovery for that corner too.
        (false, _) => PipelineDecision::FullPipeline {
            existing: Some(episode.id),
        },
    };

    debug!(episode_id = %episode.id, ?decision, "resolved pipeline state");
    decision
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use podmill_model::{
        AdditionalData, ChannelId, SourceVideoId, KEY_MASTER_MANIFEST, KEY_VIDEO_LOCATION,
    };
    use serde_json::json;

    use super::*;

    fn episode_with_ledger(ledger: AdditionalData) -> Episode {
        Episode {
            id: EpisodeId::new(),
            source_video_id: SourceVideoId::new("src1"),
            channel_id: ChannelId::new("chan1"),
            title: "Ep".into(),
            description: None,
            host_name: None,
            host_description: None,
            country: None,
            genre: None,
            published_at: None,
            original_media_uri: None,
            manifest_uri: None,
            thumbnail_uri: None,
            guests: vec![],
            guest_descriptions: vec![],
            guest_image_urls: vec![],
            topics: vec![],
            processing_done: false,
            is_synced: false,
            additional_data: ledger,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        }
    }

    #[test]
    fn no_row_means_full_pipeline() {
        assert_eq!(
            resolve(None),
            PipelineDecision::FullPipeline { existing: None }
        );
    }

    #[test]
    fn media_without_manifest_means_reprocess_only() {
        let mut ledger = AdditionalData::new();
        ledger.insert(KEY_VIDEO_LOCATION.into(), json!("s3://media/ep.mp4"));
        let episode = episode_with_ledger(ledger);

        assert_eq!(
            resolve(Some(&episode)),
            PipelineDecision::ReprocessTranscode {
                episode_id: episode.id
            }
        );
    }

    #[test]
    fn both_keys_mean_skip() {
        let mut ledger = AdditionalData::new();
        ledger.insert(KEY_VIDEO_LOCATION.into(), json!("s3://media/ep.mp4"));
        ledger.insert(KEY_MASTER_MANIFEST.into(), json!("s3://streams/master.m3u8"));
        let episode = episode_with_ledger(ledger);

        assert_eq!(
            resolve(Some(&episode)),
            PipelineDecision::Skip {
                episode_id: episode.id
            }
        );
    }

    #[test]
    fn neither_key_reuses_the_identity() {
        let episode = episode_with_ledger(AdditionalData::new());
        assert_eq!(
            resolve(Some(&episode)),
            PipelineDecision::FullPipeline {
                existing: Some(episode.id)
            }
        );
    }

    #[test]
    fn column_level_locations_count_like_ledger_keys() {
        let mut episode = episode_with_ledger(AdditionalData::new());
        episode.original_media_uri = Some("s3://media/ep.mp4".into());
        assert_eq!(
            resolve(Some(&episode)),
            PipelineDecision::ReprocessTranscode {
                episode_id: episode.id
            }
        );

        episode.manifest_uri = Some("s3://streams/master.m3u8".into());
        assert_eq!(
            resolve(Some(&episode)),
            PipelineDecision::Skip {
                episode_id: episode.id
            }
        );
    }
}
