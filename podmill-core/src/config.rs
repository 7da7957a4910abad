use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Global knobs for one pipeline process.
///
/// Constructed once by the process owner and passed into the orchestrator;
/// nothing in the pipeline reads the environment on its own. All sections
/// carry defaults so deployments can adopt new knobs incrementally.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct PipelineConfig {
    /// External tool locations, verified at startup.
    pub binaries: BinaryConfig,
    /// Acquisition and merge tuning.
    pub acquire: AcquireConfig,
    /// Multi-rendition transcode tuning.
    pub transcode: TranscodeConfig,
    /// Episode store connection and validation policy.
    pub store: StoreConfig,
    /// Named permit pool sizes.
    pub governor: GovernorConfig,
    /// Retry/backoff policy shared by all external calls.
    pub retry: RetryConfig,
    /// Object storage destinations.
    pub storage: StorageConfig,
}

/// Paths of the external tools the pipeline shells out to.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BinaryConfig {
    pub downloader: String,
    pub ffmpeg: String,
}

impl Default for BinaryConfig {
    fn default() -> Self {
        Self {
            downloader: "yt-dlp".to_string(),
            ffmpeg: "ffmpeg".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AcquireConfig {
    /// Root under which per-episode working directories are created. Cleanup
    /// prunes empty ancestors up to, but never including, this directory.
    pub work_root: PathBuf,
    /// Optional cookie jar handed to the downloader.
    pub cookie_file: Option<PathBuf>,
    /// Prefer a 1080p top rendition only when the reported source size is
    /// below this threshold; fall back to 720p otherwise.
    pub quality_threshold_bytes: u64,
    /// Wall-clock limit for the one-shot metadata fetch.
    pub metadata_timeout_secs: u64,
    /// Wall-clock limit for each acquisition job.
    pub download_timeout_secs: u64,
    /// Wall-clock limit for the merge invocation.
    pub merge_timeout_secs: u64,
}

impl Default for AcquireConfig {
    fn default() -> Self {
        Self {
            work_root: PathBuf::from("/var/lib/podmill/work"),
            cookie_file: None,
            quality_threshold_bytes: 2 * 1024 * 1024 * 1024,
            metadata_timeout_secs: 300,
            download_timeout_secs: 7_200,
            merge_timeout_secs: 1_800,
        }
    }
}

impl AcquireConfig {
    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn merge_timeout(&self) -> Duration {
        Duration::from_secs(self.merge_timeout_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TranscodeConfig {
    /// HLS segment duration in seconds.
    pub segment_seconds: u32,
    /// Wall-clock limit for the single transcode invocation.
    pub transcode_timeout_secs: u64,
    /// Override for detected CPU cores; mostly for tests and containers with
    /// misleading cgroup limits.
    pub cpu_cores_override: Option<usize>,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            segment_seconds: 6,
            transcode_timeout_secs: 14_400,
            cpu_cores_override: None,
        }
    }
}

impl TranscodeConfig {
    pub fn transcode_timeout(&self) -> Duration {
        Duration::from_secs(self.transcode_timeout_secs)
    }
}

/// How the store talks to Postgres.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    /// One long-lived connection; writers serialize on it.
    Single,
    /// Pooled connections sized by `max_connections`.
    Pooled,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    pub database_url: String,
    pub mode: ConnectionMode,
    /// Pool size when `mode` is [`ConnectionMode::Pooled`].
    pub max_connections: u32,
    /// How many times a write+validate cycle is re-run on mismatch before the
    /// validation failure is surfaced.
    pub validation_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://podmill@localhost/podmill".to_string(),
            mode: ConnectionMode::Pooled,
            max_connections: 8,
            validation_retries: 3,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GovernorConfig {
    /// Concurrent disk-bound jobs (downloads, merges).
    pub disk_permits: usize,
    /// Concurrent outbound network calls (uploads, thumbnail fetches).
    pub network_permits: usize,
    /// Concurrent database writes.
    pub database_permits: usize,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            disk_permits: 4,
            network_permits: 8,
            database_permits: 4,
        }
    }
}

/// Retry/backoff policy for external calls. Delays grow exponentially from
/// `base_delay_ms` by `multiplier` per attempt, capped at `max_delay_ms`,
/// with ±25% jitter applied on top.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Bucket receiving merged media, audio, and thumbnails.
    pub media_bucket: String,
    /// Bucket receiving HLS renditions and manifests.
    pub stream_bucket: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            media_bucket: "podmill-media".to_string(),
            stream_bucket: "podmill-streams".to_string(),
        }
    }
}
