//! PostgreSQL-backed episode store.
//!
//! Ownership rule: this store owns every lifecycle transition of an episode
//! row. Orchestrator and transcoder only propose field values through the
//! update contract; they never touch the table.
//!
//! Every mutating operation runs inside an explicit transaction at a fixed
//! isolation level, takes row locks with `FOR UPDATE NOWAIT`, and is followed
//! by an independent read that compares the row against the intended values.
//! A mismatch re-runs the whole write+validate cycle a bounded number of
//! times before surfacing a validation failure.

use std::sync::RwLock;

use podmill_model::{
    AdditionalData, ChannelId, EnrichmentUpdate, Episode, EpisodeId, EpisodePatch, NewEpisode,
    SourceVideoId,
};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ConnectionMode, StoreConfig};
use crate::error::{is_lock_not_available, PipelineError, Result};
use crate::governor::{Resource, ResourceGovernor};

use super::patch::{self, BindValue, UpdateStatement};

const EPISODE_COLUMNS: &str = "id, source_video_id, channel_id, title, description, host_name, \
     host_description, country, genre, published_at, original_media_uri, manifest_uri, \
     thumbnail_uri, guests, guest_descriptions, guest_image_urls, topics, processing_done, \
     is_synced, additional_data, created_at, updated_at, deleted_at";

/// One enrichment lookup cached in the companion `guests` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestRecord {
    pub name: String,
    pub description: Option<String>,
    pub image_url: Option<String>,
}

/// The transactional persistence layer for episodes.
///
/// Explicit lifecycle: the process owner calls [`open`](Self::open) once
/// before use and [`close`](Self::close) once at shutdown; operations refuse
/// to run outside that window.
#[derive(Debug)]
pub struct PostgresEpisodeStore {
    pool: RwLock<Option<PgPool>>,
    config: StoreConfig,
    governor: ResourceGovernor,
}

impl PostgresEpisodeStore {
    pub fn new(config: StoreConfig, governor: ResourceGovernor) -> Self {
        Self {
            pool: RwLock::new(None),
            config,
            governor,
        }
    }

    /// Connect, health-check, and apply migrations.
    pub async fn open(&self) -> Result<()> {
        if self.pool.read().expect("store lock poisoned").is_some() {
            return Err(PipelineError::Internal(
                "episode store is already open".into(),
            ));
        }

        let max_connections = match self.config.mode {
            ConnectionMode::Single => 1,
            ConnectionMode::Pooled => self.config.max_connections.max(1),
        };
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(&self.config.database_url)
            .await?;

        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| {
                PipelineError::Internal(format!("episode store failed Postgres health check: {e}"))
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| PipelineError::Internal(format!("episode store migrations failed: {e}")))?;

        *self.pool.write().expect("store lock poisoned") = Some(pool);
        info!(mode = ?self.config.mode, "episode store connected to Postgres");
        Ok(())
    }

    /// Close the connection (pool). Operations refuse to run afterwards.
    pub async fn close(&self) {
        let pool = self.pool.write().expect("store lock poisoned").take();
        if let Some(pool) = pool {
            pool.close().await;
            info!("episode store closed");
        }
    }

    fn pool(&self) -> Result<PgPool> {
        self.pool
            .read()
            .expect("store lock poisoned")
            .clone()
            .ok_or(PipelineError::StoreClosed)
    }

    /// Insert a new episode row, or fail with the distinct duplicate-episode
    /// error when either business key is already owned. Duplicate means
    /// "already handled elsewhere": callers must stop, not retry.
    pub async fn store_new_episode(&self, new: &NewEpisode) -> Result<EpisodeId> {
        self.governor
            .execute(Resource::Database, "persistence", || self.insert_episode(new))
            .await
    }

    async fn insert_episode(&self, new: &NewEpisode) -> Result<EpisodeId> {
        let pool = self.pool()?;
        let mut tx = pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL READ COMMITTED")
            .execute(&mut *tx)
            .await?;

        let title_clash: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM episodes \
             WHERE title = $1 AND channel_id = $2 AND deleted_at IS NULL \
             FOR UPDATE NOWAIT",
        )
        .bind(&new.title)
        .bind(new.channel_id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_lock_error)?;

        if title_clash.is_some() {
            tx.rollback().await.ok();
            return Err(PipelineError::DuplicateEpisode(format!(
                "title `{}` already exists in channel {}",
                new.title, new.channel_id
            )));
        }

        let source_clash: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM episodes \
             WHERE source_video_id = $1 AND deleted_at IS NULL \
             FOR UPDATE NOWAIT",
        )
        .bind(new.source_video_id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_lock_error)?;

        if source_clash.is_some() {
            tx.rollback().await.ok();
            return Err(PipelineError::DuplicateEpisode(format!(
                "source video {} already has an episode",
                new.source_video_id
            )));
        }

        let id = EpisodeId::new();
        sqlx::query(
            "INSERT INTO episodes (\
                 id, source_video_id, channel_id, title, description, host_name, \
                 host_description, country, genre, published_at, original_media_uri, \
                 thumbnail_uri, additional_data\
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(id.0)
        .bind(new.source_video_id.as_str())
        .bind(new.channel_id.as_str())
        .bind(&new.title)
        .bind(&new.description)
        .bind(&new.host_name)
        .bind(&new.host_description)
        .bind(&new.country)
        .bind(&new.genre)
        .bind(new.published_at)
        .bind(&new.original_media_uri)
        .bind(&new.thumbnail_uri)
        .bind(Value::Object(new.additional_data.clone()))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(%id, source = %new.source_video_id, "stored new episode");
        Ok(id)
    }

    /// Apply a typed partial update, merging the milestone ledger, then
    /// validate the write with an independent read. The whole cycle repeats
    /// on mismatch up to the configured limit.
    pub async fn update_episode(&self, id: EpisodeId, update: &EpisodePatch) -> Result<()> {
        if update.is_empty() {
            debug!(%id, "empty patch, nothing to update");
            return Ok(());
        }

        let cycles = self.config.validation_retries.max(1);
        let mut last_mismatch: Vec<&'static str> = Vec::new();

        for attempt in 1..=cycles {
            self.governor
                .execute(Resource::Database, "persistence", || {
                    self.write_patch(id, update)
                })
                .await?;

            // Fresh read, no in-process caching: the validation must observe
            // what the database actually holds.
            let row = self
                .fetch_episode(id)
                .await?
                .ok_or_else(|| PipelineError::NotFound(id.to_string()))?;
            last_mismatch = patch::mismatches(&row, update);
            if last_mismatch.is_empty() {
                return Ok(());
            }
            warn!(
                %id,
                attempt,
                fields = ?last_mismatch,
                "post-write validation mismatch, re-running update cycle"
            );
        }

        Err(PipelineError::ValidationFailed {
            attempts: cycles,
            detail: format!("fields did not persist: {}", last_mismatch.join(", ")),
        })
    }

    async fn write_patch(&self, id: EpisodeId, update: &EpisodePatch) -> Result<()> {
        let pool = self.pool()?;
        let mut tx = pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL READ COMMITTED")
            .execute(&mut *tx)
            .await?;

        let current = lock_current_ledger(&mut tx, id).await?;
        let stmt = patch::build_update(update, &current);
        bind_update(&stmt, id).execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(())
    }

    /// Specialized update for the enrichment arrays, which must stay
    /// index-aligned across the three guest columns.
    pub async fn update_episode_with_enrichment(
        &self,
        id: EpisodeId,
        enrichment: &EnrichmentUpdate,
    ) -> Result<()> {
        if !enrichment.is_aligned() {
            return Err(PipelineError::Internal(format!(
                "enrichment arrays are not index-aligned: {} guests, {} descriptions, {} images",
                enrichment.guests.len(),
                enrichment.guest_descriptions.len(),
                enrichment.guest_image_urls.len()
            )));
        }

        let cycles = self.config.validation_retries.max(1);
        let mut last_mismatch: Vec<&'static str> = Vec::new();

        for attempt in 1..=cycles {
            self.governor
                .execute(Resource::Database, "persistence", || {
                    self.write_enrichment(id, enrichment)
                })
                .await?;

            let row = self
                .fetch_episode(id)
                .await?
                .ok_or_else(|| PipelineError::NotFound(id.to_string()))?;
            last_mismatch = patch::enrichment_mismatches(&row, enrichment);
            if last_mismatch.is_empty() {
                return Ok(());
            }
            warn!(
                %id,
                attempt,
                fields = ?last_mismatch,
                "enrichment validation mismatch, re-running update cycle"
            );
        }

        Err(PipelineError::ValidationFailed {
            attempts: cycles,
            detail: format!("fields did not persist: {}", last_mismatch.join(", ")),
        })
    }

    async fn write_enrichment(&self, id: EpisodeId, enrichment: &EnrichmentUpdate) -> Result<()> {
        let pool = self.pool()?;
        let mut tx = pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL READ COMMITTED")
            .execute(&mut *tx)
            .await?;

        let current = lock_current_ledger(&mut tx, id).await?;
        let stmt = patch::build_enrichment_update(enrichment, &current);
        bind_update(&stmt, id).execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_episode(&self, id: EpisodeId) -> Result<Option<Episode>> {
        self.governor
            .execute(Resource::Database, "persistence", || self.fetch_episode(id))
            .await
    }

    async fn fetch_episode(&self, id: EpisodeId) -> Result<Option<Episode>> {
        let pool = self.pool()?;
        let row = sqlx::query(&format!(
            "SELECT {EPISODE_COLUMNS} FROM episodes WHERE id = $1 AND deleted_at IS NULL"
        ))
        .bind(id.0)
        .fetch_optional(&pool)
        .await?;
        row.map(row_to_episode).transpose()
    }

    /// Non-locking duplicate probe by business key, for use outside
    /// transactions.
    pub async fn check_episode_exists(&self, title: &str, channel_id: &ChannelId) -> Result<bool> {
        let pool = self.pool()?;
        let found: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM episodes \
             WHERE title = $1 AND channel_id = $2 AND deleted_at IS NULL",
        )
        .bind(title)
        .bind(channel_id.as_str())
        .fetch_optional(&pool)
        .await?;
        Ok(found.is_some())
    }

    /// Non-locking duplicate probe by source identity.
    pub async fn check_episode_exists_by_source_id(
        &self,
        source_video_id: &SourceVideoId,
    ) -> Result<bool> {
        Ok(self.find_by_source_id(source_video_id).await?.is_some())
    }

    /// Fetch the full row for a source identity; what the pipeline state
    /// resolver classifies.
    pub async fn find_by_source_id(
        &self,
        source_video_id: &SourceVideoId,
    ) -> Result<Option<Episode>> {
        let pool = self.pool()?;
        let row = sqlx::query(&format!(
            "SELECT {EPISODE_COLUMNS} FROM episodes \
             WHERE source_video_id = $1 AND deleted_at IS NULL"
        ))
        .bind(source_video_id.as_str())
        .fetch_optional(&pool)
        .await?;
        row.map(row_to_episode).transpose()
    }

    /// Cache an enrichment lookup in the companion guests table.
    pub async fn upsert_guest(&self, guest: &GuestRecord) -> Result<()> {
        self.governor
            .execute(Resource::Database, "persistence", || async move {
                let pool = self.pool()?;
                sqlx::query(
                    "INSERT INTO guests (name, description, image_url) \
                     VALUES ($1, $2, $3) \
                     ON CONFLICT (name) DO UPDATE SET \
                         description = EXCLUDED.description, \
                         image_url = EXCLUDED.image_url, \
                         updated_at = NOW()",
                )
                .bind(&guest.name)
                .bind(&guest.description)
                .bind(&guest.image_url)
                .execute(&pool)
                .await?;
                Ok(())
            })
            .await
    }

    pub async fn get_guest(&self, name: &str) -> Result<Option<GuestRecord>> {
        let pool = self.pool()?;
        let row = sqlx::query("SELECT name, description, image_url FROM guests WHERE name = $1")
            .bind(name)
            .fetch_optional(&pool)
            .await?;
        row.map(|row| {
            Ok(GuestRecord {
                name: row.try_get("name")?,
                description: row.try_get("description")?,
                image_url: row.try_get("image_url")?,
            })
        })
        .transpose()
    }
}

/// `FOR UPDATE NOWAIT` the target row and return its current milestone
/// ledger; the lock holds until the surrounding transaction settles.
async fn lock_current_ledger(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    id: EpisodeId,
) -> Result<AdditionalData> {
    let row = sqlx::query(
        "SELECT additional_data FROM episodes \
         WHERE id = $1 AND deleted_at IS NULL \
         FOR UPDATE NOWAIT",
    )
    .bind(id.0)
    .fetch_optional(&mut **tx)
    .await
    .map_err(map_lock_error)?;

    let Some(row) = row else {
        return Err(PipelineError::NotFound(id.to_string()));
    };
    let ledger: Value = row.try_get("additional_data")?;
    Ok(ledger.as_object().cloned().unwrap_or_default())
}

fn bind_update(
    stmt: &UpdateStatement,
    id: EpisodeId,
) -> sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments> {
    let mut query = sqlx::query(&stmt.sql);
    for value in &stmt.values {
        query = match value {
            BindValue::Text(v) => query.bind(v.clone()),
            BindValue::Bool(v) => query.bind(*v),
            BindValue::Timestamp(v) => query.bind(*v),
            BindValue::Json(v) => query.bind(v.clone()),
            BindValue::TextArray(v) => query.bind(v.clone()),
        };
    }
    query.bind(id.0)
}

fn map_lock_error(err: sqlx::Error) -> PipelineError {
    if is_lock_not_available(&err) {
        PipelineError::LockUnavailable(err.to_string())
    } else {
        PipelineError::Database(err)
    }
}

fn row_to_episode(row: PgRow) -> Result<Episode> {
    let ledger: Value = row.try_get("additional_data")?;
    Ok(Episode {
        id: EpisodeId(row.try_get("id")?),
        source_video_id: SourceVideoId(row.try_get("source_video_id")?),
        channel_id: ChannelId(row.try_get("channel_id")?),
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        host_name: row.try_get("host_name")?,
        host_description: row.try_get("host_description")?,
        country: row.try_get("country")?,
        genre: row.try_get("genre")?,
        published_at: row.try_get("published_at")?,
        original_media_uri: row.try_get("original_media_uri")?,
        manifest_uri: row.try_get("manifest_uri")?,
        thumbnail_uri: row.try_get("thumbnail_uri")?,
        guests: row.try_get("guests")?,
        guest_descriptions: row.try_get("guest_descriptions")?,
        guest_image_urls: row.try_get("guest_image_urls")?,
        topics: row.try_get("topics")?,
        processing_done: row.try_get("processing_done")?,
        is_synced: row.try_get("is_synced")?,
        additional_data: ledger.as_object().cloned().unwrap_or_default(),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}
