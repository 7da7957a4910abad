//! Boundary traits for external collaborators.
//!
//! The pipeline consumes these ports; it never implements them beyond test
//! doubles. A failed upload does not roll back episode-store writes already
//! made for earlier milestones.

use std::path::Path;

use async_trait::async_trait;
use podmill_model::{EnrichmentUpdate, EpisodeId};

use crate::error::Result;

/// Location of an object persisted in durable storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub location: String,
}

/// Durable object storage for media, thumbnails, and every rendition file.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn upload(&self, local_path: &Path, bucket: &str, key: &str) -> Result<StoredObject>;

    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;
}

/// Guest/topic enrichment lookup. The algorithm behind it is out of scope;
/// only the result shape matters here.
#[async_trait]
pub trait EnrichmentService: Send + Sync {
    async fn enrich(
        &self,
        show_title: &str,
        episode_title: &str,
        description: Option<&str>,
    ) -> Result<EnrichmentUpdate>;
}

/// Downstream queue/notification collaborator. Receives exactly one message
/// per episode, on first-time successful persistence of a new episode with
/// its media location.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReadyNotifier: Send + Sync {
    async fn episode_ready(&self, episode_id: EpisodeId, media_uri: &str) -> Result<()>;
}
