//! Transactional episode persistence over Postgres.

pub mod patch;
pub mod postgres;

use async_trait::async_trait;
use podmill_model::{
    ChannelId, EnrichmentUpdate, Episode, EpisodeId, EpisodePatch, NewEpisode, SourceVideoId,
};

use crate::error::Result;

pub use postgres::{GuestRecord, PostgresEpisodeStore};

/// Operations the rest of the pipeline is allowed to perform against episode
/// state. The store owns all lifecycle transitions; callers only propose
/// field values through this contract.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EpisodeStore: Send + Sync {
    async fn store_new_episode(&self, new: &NewEpisode) -> Result<EpisodeId>;

    async fn update_episode(&self, id: EpisodeId, update: &EpisodePatch) -> Result<()>;

    async fn update_episode_with_enrichment(
        &self,
        id: EpisodeId,
        enrichment: &EnrichmentUpdate,
    ) -> Result<()>;

    async fn get_episode(&self, id: EpisodeId) -> Result<Option<Episode>>;

    async fn check_episode_exists(&self, title: &str, channel_id: &ChannelId) -> Result<bool>;

    async fn check_episode_exists_by_source_id(
        &self,
        source_video_id: &SourceVideoId,
    ) -> Result<bool>;

    async fn find_by_source_id(&self, source_video_id: &SourceVideoId)
        -> Result<Option<Episode>>;

    async fn upsert_guest(&self, guest: &GuestRecord) -> Result<()>;
}

#[async_trait]
impl EpisodeStore for PostgresEpisodeStore {
    async fn store_new_episode(&self, new: &NewEpisode) -> Result<EpisodeId> {
        PostgresEpisodeStore::store_new_episode(self, new).await
    }

    async fn update_episode(&self, id: EpisodeId, update: &EpisodePatch) -> Result<()> {
        PostgresEpisodeStore::update_episode(self, id, update).await
    }

    async fn update_episode_with_enrichment(
        &self,
        id: EpisodeId,
        enrichment: &EnrichmentUpdate,
    ) -> Result<()> {
        PostgresEpisodeStore::update_episode_with_enrichment(self, id, enrichment).await
    }

    async fn get_episode(&self, id: EpisodeId) -> Result<Option<Episode>> {
        PostgresEpisodeStore::get_episode(self, id).await
    }

    async fn check_episode_exists(&self, title: &str, channel_id: &ChannelId) -> Result<bool> {
        PostgresEpisodeStore::check_episode_exists(self, title, channel_id).await
    }

    async fn check_episode_exists_by_source_id(
        &self,
        source_video_id: &SourceVideoId,
    ) -> Result<bool> {
        PostgresEpisodeStore::check_episode_exists_by_source_id(self, source_video_id).await
    }

    async fn find_by_source_id(
        &self,
        source_video_id: &SourceVideoId,
    ) -> Result<Option<Episode>> {
        PostgresEpisodeStore::find_by_source_id(self, source_video_id).await
    }

    async fn upsert_guest(&self, guest: &GuestRecord) -> Result<()> {
        PostgresEpisodeStore::upsert_guest(self, guest).await
    }
}
