//! Core data model definitions shared across Podmill crates.

pub mod enrichment;
pub mod episode;
pub mod ids;

pub use enrichment::EnrichmentUpdate;
pub use episode::{
    merge_additional_data, AdditionalData, Episode, EpisodePatch, NewEpisode,
    KEY_AUDIO_LOCATION, KEY_MASTER_MANIFEST, KEY_VIDEO_LOCATION,
};
pub use ids::{ChannelId, EpisodeId, SourceVideoId};
