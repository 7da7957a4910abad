//! The per-episode driver: resolver → acquisition & merge → persistence →
//! transcode → final update, with the exactly-once ready notification.
//!
//! Safe to invoke from any number of concurrent workers; per-episode
//! consistency comes from the store's row locks, not from anything held in
//! process. A failure for one episode never takes down workers handling
//! others — everything surfaces as an error value.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use podmill_model::{
    AdditionalData, ChannelId, EpisodeId, EpisodePatch, NewEpisode, SourceVideoId,
    KEY_AUDIO_LOCATION,
};
use serde_json::Value;
use tracing::{info, warn};
use url::Url;

use crate::acquire::{cleanup, AcquirePlan, Acquirer};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::governor::{Resource, ResourceGovernor};
use crate::ports::{EnrichmentService, ObjectStorage, ReadyNotifier, StoredObject};
use crate::resolver::{self, PipelineDecision};
use crate::store::{EpisodeStore, GuestRecord};
use crate::transcode::Transcoder;

/// Channel (show) context the caller supplies with each work item.
#[derive(Debug, Clone)]
pub struct ChannelContext {
    pub channel_id: ChannelId,
    pub show_title: String,
    pub host_name: Option<String>,
    pub host_description: Option<String>,
    pub country: Option<String>,
    pub genre: Option<String>,
}

/// What one delivery of a work item amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed {
        episode_id: EpisodeId,
        manifest_location: String,
    },
    /// Idempotent re-delivery of finished work; nothing was run.
    Skipped { episode_id: EpisodeId },
}

/// One process-wide pipeline instance, shared by all workers.
pub struct EpisodePipeline {
    config: PipelineConfig,
    governor: ResourceGovernor,
    acquirer: Acquirer,
    transcoder: Transcoder,
    store: Arc<dyn EpisodeStore>,
    storage: Arc<dyn ObjectStorage>,
    enrichment: Option<Arc<dyn EnrichmentService>>,
    notifier: Arc<dyn ReadyNotifier>,
    http: reqwest::Client,
}

impl std::fmt::Debug for EpisodePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpisodePipeline")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl EpisodePipeline {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn EpisodeStore>,
        storage: Arc<dyn ObjectStorage>,
        enrichment: Option<Arc<dyn EnrichmentService>>,
        notifier: Arc<dyn ReadyNotifier>,
    ) -> Self {
        let governor = ResourceGovernor::new(&config.governor, config.retry.clone());
        let acquirer = Acquirer::new(
            config.binaries.clone(),
            config.acquire.clone(),
            governor.clone(),
        );
        let transcoder = Transcoder::new(
            config.binaries.clone(),
            config.transcode.clone(),
            governor.clone(),
            storage.clone(),
            config.storage.stream_bucket.clone(),
        );

        Self {
            config,
            governor,
            acquirer,
            transcoder,
            store,
            storage,
            enrichment,
            notifier,
            http: reqwest::Client::new(),
        }
    }

    /// Verify external binaries before accepting work. Fatal when missing.
    pub async fn preflight(&self) -> Result<()> {
        self.acquirer.preflight().await
    }

    /// Run the pipeline for one work item.
    pub async fn process(
        &self,
        source_url: &str,
        channel: &ChannelContext,
    ) -> Result<PipelineOutcome> {
        Url::parse(source_url).map_err(|e| {
            PipelineError::InvalidMedia(format!("source url `{source_url}` did not parse: {e}"))
        })?;

        let plan = self.acquirer.plan(source_url, None).await?;
        let source_id = SourceVideoId::new(plan.metadata.id.clone());
        let existing = self.store.find_by_source_id(&source_id).await?;

        match resolver::resolve(existing.as_ref()) {
            PipelineDecision::Skip { episode_id } => {
                info!(%episode_id, source = %source_id, "episode fully processed, skipping");
                cleanup::prune_empty_dirs(&plan.work_dir, &self.config.acquire.work_root).await;
                Ok(PipelineOutcome::Skipped { episode_id })
            }
            PipelineDecision::ReprocessTranscode { episode_id } => {
                info!(%episode_id, source = %source_id, "media recorded without manifest, reprocessing transcode only");
                self.reprocess_transcode(&plan, channel, episode_id).await
            }
            PipelineDecision::FullPipeline { existing } => {
                self.full_pipeline(&plan, channel, existing).await
            }
        }
    }

    async fn full_pipeline(
        &self,
        plan: &AcquirePlan,
        channel: &ChannelContext,
        existing: Option<EpisodeId>,
    ) -> Result<PipelineOutcome> {
        let (merged, episode_id) = self
            .acquirer
            .acquire_and_merge(plan, |audio| {
                self.on_audio_ready(plan, channel, existing, audio)
            })
            .await?;

        // Merged media becomes durable before anything references it.
        let media_key = self.object_key(plan, channel, "episode.mp4");
        let media = match self
            .upload_file(&merged, &self.config.storage.media_bucket, &media_key)
            .await
        {
            Ok(media) => media,
            Err(err) => {
                self.acquirer.discard(plan).await;
                return Err(err);
            }
        };

        if let Err(err) = self
            .store
            .update_episode(episode_id, &EpisodePatch::media_location(&media.location))
            .await
        {
            self.acquirer.discard(plan).await;
            return Err(err.into_stage("persistence"));
        }

        // Exactly once per episode: only the full path sends this, and a
        // re-delivery after this point resolves to reprocess or skip.
        self.governor
            .execute(Resource::Network, "notify", || {
                self.notifier.episode_ready(episode_id, &media.location)
            })
            .await?;

        let manifest_location = self.transcode_and_record(plan, channel, episode_id, &merged).await?;

        self.acquirer.discard(plan).await;
        info!(%episode_id, manifest = %manifest_location, "episode pipeline complete");
        Ok(PipelineOutcome::Completed {
            episode_id,
            manifest_location,
        })
    }

    /// The resolver's "media without manifest" path: reuse the identity and
    /// the locally retained merged file; never re-acquire, never re-notify.
    async fn reprocess_transcode(
        &self,
        plan: &AcquirePlan,
        channel: &ChannelContext,
        episode_id: EpisodeId,
    ) -> Result<PipelineOutcome> {
        let merged = plan.merged_path();
        let usable = matches!(tokio::fs::metadata(&merged).await, Ok(meta) if meta.len() > 0);
        if !usable {
            return Err(PipelineError::InvalidMedia(format!(
                "merged media for {episode_id} is not available locally; \
                 transcode-only reprocessing refuses to re-acquire"
            ))
            .into_stage("transcode"));
        }

        let manifest_location = self.transcode_and_record(plan, channel, episode_id, &merged).await?;

        self.acquirer.discard(plan).await;
        info!(%episode_id, manifest = %manifest_location, "transcode reprocessing complete");
        Ok(PipelineOutcome::Completed {
            episode_id,
            manifest_location,
        })
    }

    /// Transcode is unconditional once a merged file exists; its manifest
    /// location lands in the store with `processing_done` before anything is
    /// reported complete. On failure the merged file is deliberately kept so
    /// a later delivery can reprocess without re-acquiring.
    async fn transcode_and_record(
        &self,
        plan: &AcquirePlan,
        channel: &ChannelContext,
        episode_id: EpisodeId,
        merged: &Path,
    ) -> Result<String> {
        let prefix = format!("{}/{}", channel.channel_id, plan.metadata.id);
        let manifest_location = self.transcoder.run(merged, plan.tier, &prefix).await?;

        self.store
            .update_episode(
                episode_id,
                &EpisodePatch::manifest_location(&manifest_location),
            )
            .await
            .map_err(|e| e.into_stage("persistence"))?;

        Ok(manifest_location)
    }

    /// The audio branch's completion pipeline, run while the video job may
    /// still be in flight: upload audio and thumbnail, establish the episode
    /// identity, then enrich. The row must exist here so every later update
    /// can target it.
    async fn on_audio_ready(
        &self,
        plan: &AcquirePlan,
        channel: &ChannelContext,
        existing: Option<EpisodeId>,
        audio: PathBuf,
    ) -> Result<EpisodeId> {
        let audio_name = audio
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio.m4a".to_string());
        let audio_key = self.object_key(plan, channel, &audio_name);
        let audio_obj = self
            .upload_file(&audio, &self.config.storage.media_bucket, &audio_key)
            .await?;

        let thumbnail_uri = self.stage_thumbnail(plan, channel).await;

        let mut ledger = AdditionalData::new();
        ledger.insert(
            KEY_AUDIO_LOCATION.to_string(),
            Value::String(audio_obj.location.clone()),
        );

        let episode_id = match existing {
            Some(id) => {
                let patch = EpisodePatch {
                    thumbnail_uri: thumbnail_uri.clone(),
                    additional_data: Some(ledger),
                    ..EpisodePatch::default()
                };
                self.store
                    .update_episode(id, &patch)
                    .await
                    .map_err(|e| e.into_stage("persistence"))?;
                id
            }
            None => {
                let new = NewEpisode {
                    source_video_id: SourceVideoId::new(plan.metadata.id.clone()),
                    channel_id: channel.channel_id.clone(),
                    title: plan.metadata.title.clone(),
                    description: plan.metadata.description.clone(),
                    host_name: channel.host_name.clone(),
                    host_description: channel.host_description.clone(),
                    country: channel.country.clone(),
                    genre: channel.genre.clone(),
                    published_at: plan.metadata.published_at(),
                    original_media_uri: None,
                    thumbnail_uri: thumbnail_uri.clone(),
                    additional_data: ledger,
                };
                // A duplicate here means another worker owns this identity:
                // propagate as-is so the caller stops instead of retrying.
                self.store.store_new_episode(&new).await?
            }
        };

        self.apply_enrichment(episode_id, plan, channel).await;
        Ok(episode_id)
    }

    /// Best-effort: a missing thumbnail never fails the episode.
    async fn stage_thumbnail(&self, plan: &AcquirePlan, channel: &ChannelContext) -> Option<String> {
        let thumb_url = plan.metadata.thumbnail.clone()?;
        let local = plan.work_dir.join("thumbnail.jpg");

        let fetched = self
            .governor
            .execute(Resource::Network, "thumbnail", || {
                let thumb_url = thumb_url.clone();
                let local = local.clone();
                async move {
                    let bytes = self
                        .http
                        .get(&thumb_url)
                        .send()
                        .await?
                        .error_for_status()?
                        .bytes()
                        .await?;
                    tokio::fs::write(&local, &bytes).await?;
                    Ok(())
                }
            })
            .await;
        if let Err(err) = fetched {
            warn!(error = %err, "thumbnail fetch failed, continuing without one");
            return None;
        }

        let key = self.object_key(plan, channel, "thumbnail.jpg");
        match self
            .upload_file(&local, &self.config.storage.media_bucket, &key)
            .await
        {
            Ok(obj) => Some(obj.location),
            Err(err) => {
                warn!(error = %err, "thumbnail upload failed, continuing without one");
                None
            }
        }
    }

    /// Best-effort guest/topic enrichment; failure is logged and the episode
    /// proceeds without it.
    async fn apply_enrichment(
        &self,
        episode_id: EpisodeId,
        plan: &AcquirePlan,
        channel: &ChannelContext,
    ) {
        let Some(service) = &self.enrichment else {
            return;
        };

        let enriched = self
            .governor
            .execute(Resource::Network, "enrichment", || {
                service.enrich(
                    &channel.show_title,
                    &plan.metadata.title,
                    plan.metadata.description.as_deref(),
                )
            })
            .await;

        let update = match enriched {
            Ok(update) => update,
            Err(err) => {
                warn!(%episode_id, error = %err, "enrichment lookup failed, continuing");
                return;
            }
        };

        if let Err(err) = self
            .store
            .update_episode_with_enrichment(episode_id, &update)
            .await
        {
            warn!(%episode_id, error = %err, "failed to persist enrichment, continuing");
            return;
        }

        for (i, name) in update.guests.iter().enumerate() {
            let guest = GuestRecord {
                name: name.clone(),
                description: update.guest_descriptions.get(i).cloned(),
                image_url: update.guest_image_urls.get(i).cloned(),
            };
            if let Err(err) = self.store.upsert_guest(&guest).await {
                warn!(guest = %guest.name, error = %err, "guest cache upsert failed");
            }
        }
    }

    async fn upload_file(&self, local: &Path, bucket: &str, key: &str) -> Result<StoredObject> {
        self.governor
            .execute(Resource::Network, "upload", || {
                self.storage.upload(local, bucket, key)
            })
            .await
    }

    fn object_key(&self, plan: &AcquirePlan, channel: &ChannelContext, name: &str) -> String {
        format!("{}/{}/{}", channel.channel_id, plan.metadata.id, name)
    }
}
