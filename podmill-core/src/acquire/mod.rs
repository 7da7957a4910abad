//! Acquisition & merge orchestration.
//!
//! Video-only and audio-only jobs run concurrently under the disk permit.
//! The audio branch completes independently and triggers its own short
//! sequential pipeline (upload, identity resolution, persistence) supplied by
//! the caller, while the video branch is still running; both join at the
//! merge step. Every exit path disposes of temporary artifacts.

pub mod cleanup;
pub mod merge;
pub mod metadata;
pub mod progress;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, trace, warn};

use crate::config::{AcquireConfig, BinaryConfig};
use crate::error::{PipelineError, Result};
use crate::governor::{Resource, ResourceGovernor};
use crate::process;

use metadata::{select_quality_tier, QualityTier, SourceMetadata};
use progress::{ProgressEvent, ProgressTracker};

/// Everything needed to run one episode's acquisition, derived from a single
/// metadata fetch.
#[derive(Debug, Clone)]
pub struct AcquirePlan {
    pub metadata: SourceMetadata,
    pub tier: QualityTier,
    pub source_url: String,
    /// Per-episode working directory under the configured work root.
    pub work_dir: PathBuf,
}

impl AcquirePlan {
    pub fn merged_path(&self) -> PathBuf {
        self.work_dir.join("episode.mp4")
    }
}

/// Runs the acquisition jobs and the merge for one episode.
#[derive(Clone, Debug)]
pub struct Acquirer {
    binaries: BinaryConfig,
    config: AcquireConfig,
    governor: ResourceGovernor,
}

impl Acquirer {
    pub fn new(binaries: BinaryConfig, config: AcquireConfig, governor: ResourceGovernor) -> Self {
        Self {
            binaries,
            config,
            governor,
        }
    }

    /// Verify the external tools exist. Fatal before any work begins.
    pub async fn preflight(&self) -> Result<()> {
        process::ensure_binary(&self.binaries.downloader).await?;
        process::ensure_binary(&self.binaries.ffmpeg).await?;
        Ok(())
    }

    /// Resolve metadata (fetching it once if the caller has none) and set up
    /// the working directory.
    pub async fn plan(
        &self,
        source_url: &str,
        prefetched: Option<SourceMetadata>,
    ) -> Result<AcquirePlan> {
        let metadata = match prefetched {
            Some(meta) => meta,
            None => {
                let binaries = self.binaries.clone();
                let config = self.config.clone();
                let url = source_url.to_string();
                self.governor
                    .execute(Resource::Network, "metadata", || {
                        metadata::fetch_metadata(&binaries, &config, &url)
                    })
                    .await?
            }
        };

        let tier = select_quality_tier(&metadata, self.config.quality_threshold_bytes);
        let work_dir = self.config.work_root.join(&metadata.id);
        tokio::fs::create_dir_all(&work_dir).await?;

        debug!(
            source_id = %metadata.id,
            tier = ?tier,
            work_dir = %work_dir.display(),
            "acquisition planned"
        );

        Ok(AcquirePlan {
            metadata,
            tier,
            source_url: source_url.to_string(),
            work_dir,
        })
    }

    /// Acquire both streams concurrently, run `on_audio_ready` as soon as the
    /// audio artifact lands, then merge. Returns the merged path and the
    /// audio branch's result.
    ///
    /// On failure of any branch, temporary artifacts are removed and the
    /// now-empty working directory is pruned before the error propagates.
    pub async fn acquire_and_merge<T, F, Fut>(
        &self,
        plan: &AcquirePlan,
        on_audio_ready: F,
    ) -> Result<(PathBuf, T)>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        // The audio artifact path escapes the branch even when the completion
        // pipeline fails after the download, so failure cleanup can reach it.
        let audio_artifact = std::sync::Mutex::new(None::<PathBuf>);

        let video_branch = self.download_video(plan);
        let audio_branch = async {
            let audio = self.download_audio(plan).await?;
            *audio_artifact.lock().expect("audio path slot poisoned") = Some(audio.clone());
            let outcome = on_audio_ready(audio.clone()).await?;
            Ok::<_, PipelineError>((audio, outcome))
        };

        let (video_res, audio_res) = tokio::join!(video_branch, audio_branch);

        let (video, (audio, audio_outcome)) = match (video_res, audio_res) {
            (Ok(video), Ok(audio)) => (video, audio),
            (video_res, audio_res) => {
                if let Ok(path) = &video_res {
                    cleanup::remove_artifacts(&[path.as_path()]).await;
                }
                if let Some(path) = audio_artifact.lock().expect("audio path slot poisoned").take()
                {
                    cleanup::remove_artifacts(&[path.as_path()]).await;
                }
                cleanup::prune_empty_dirs(&plan.work_dir, &self.config.work_root).await;
                let err = video_res
                    .err()
                    .or(audio_res.err())
                    .unwrap_or_else(|| PipelineError::Internal("acquisition join".into()));
                return Err(err);
            }
        };

        let merged = plan.merged_path();
        if let Err(err) =
            merge::merge_streams(&self.binaries, &self.config, &video, &audio, &merged).await
        {
            cleanup::remove_artifacts(&[video.as_path(), audio.as_path(), merged.as_path()]).await;
            cleanup::prune_empty_dirs(&plan.work_dir, &self.config.work_root).await;
            return Err(err.into_stage("merge"));
        }

        // The stream-level temporaries are no longer needed once the merged
        // container validates.
        cleanup::remove_artifacts(&[video.as_path(), audio.as_path()]).await;

        info!(
            source_id = %plan.metadata.id,
            merged = %merged.display(),
            "acquisition and merge complete"
        );
        Ok((merged, audio_outcome))
    }

    /// Remove everything this plan produced. Used by callers when a later
    /// stage fails.
    pub async fn discard(&self, plan: &AcquirePlan) {
        cleanup::remove_work_dir(&plan.work_dir, &self.config.work_root).await;
    }

    async fn download_video(&self, plan: &AcquirePlan) -> Result<PathBuf> {
        let template = plan.work_dir.join("video.%(ext)s");
        let mut args = self.common_args(plan);
        args.push("-f".into());
        args.push(plan.tier.video_format().into());
        args.push("-o".into());
        args.push(template.to_string_lossy().into_owned());
        args.push(plan.source_url.clone());

        self.governor
            .execute(Resource::Disk, "acquisition", || {
                self.run_download_job("video", args.clone())
            })
            .await
    }

    async fn download_audio(&self, plan: &AcquirePlan) -> Result<PathBuf> {
        let template = plan.work_dir.join("audio.%(ext)s");
        let mut args = self.common_args(plan);
        args.push("-f".into());
        args.push("bestaudio[ext=m4a]/bestaudio".into());
        args.push("-o".into());
        args.push(template.to_string_lossy().into_owned());
        args.push(plan.source_url.clone());

        self.governor
            .execute(Resource::Disk, "acquisition", || {
                self.run_download_job("audio", args.clone())
            })
            .await
    }

    fn common_args(&self, _plan: &AcquirePlan) -> Vec<String> {
        let mut args = vec![
            "--newline".to_string(),
            "--no-playlist".to_string(),
            "--no-part".to_string(),
        ];
        if let Some(cookie_file) = &self.config.cookie_file {
            args.push("--cookies".to_string());
            args.push(cookie_file.to_string_lossy().into_owned());
        }
        args
    }

    /// Run one downloader job, streaming its stdout through the progress
    /// parser. Completion is detected by the announced artifact path, which
    /// must exist and be non-empty.
    async fn run_download_job(&self, job: &'static str, args: Vec<String>) -> Result<PathBuf> {
        let tool = self.binaries.downloader.clone();
        let mut cmd = Command::new(&tool);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(job, "spawning {:?}", cmd.as_std());
        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PipelineError::MissingBinary(tool.clone()),
            _ => PipelineError::Io(e),
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(collect_lines(stderr));

        let mut tracker = ProgressTracker::new();
        let limit = self.config.download_timeout();

        let waited = tokio::time::timeout(limit, async {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    match tracker.observe(&line) {
                        Some(ProgressEvent::Percent(pct)) => {
                            trace!(job, pct, "download progress");
                        }
                        Some(ProgressEvent::Destination(path)) => {
                            debug!(job, path = %path.display(), "artifact destination");
                        }
                        Some(ProgressEvent::AlreadyDownloaded(path)) => {
                            debug!(job, path = %path.display(), "artifact already present");
                        }
                        None => {}
                    }
                }
            }
            child.wait().await
        })
        .await;

        let status = match waited {
            Ok(status) => status?,
            Err(_) => {
                warn!(job, ?limit, "download exceeded wall-clock limit, killing");
                let _ = child.kill().await;
                return Err(PipelineError::ProcessTimeout {
                    tool,
                    timeout: limit,
                });
            }
        };

        let stderr_text = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(PipelineError::ProcessFailed {
                tool,
                status: status.code().unwrap_or(-1),
                detail: process::tail(&stderr_text, 10),
            });
        }

        let artifact = tracker.final_artifact().cloned().ok_or_else(|| {
            PipelineError::InvalidMedia(format!(
                "{job} download finished without announcing an artifact path"
            ))
        })?;

        validate_artifact(&artifact, job).await?;
        info!(job, artifact = %artifact.display(), "download complete");
        Ok(artifact)
    }
}

async fn validate_artifact(path: &Path, job: &str) -> Result<()> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.len() > 0 => Ok(()),
        Ok(_) => Err(PipelineError::InvalidMedia(format!(
            "{job} artifact {} is zero bytes",
            path.display()
        ))),
        Err(_) => Err(PipelineError::InvalidMedia(format!(
            "{job} artifact {} does not exist",
            path.display()
        ))),
    }
}

async fn collect_lines(pipe: Option<tokio::process::ChildStderr>) -> String {
    let mut out = String::new();
    if let Some(pipe) = pipe {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            out.push_str(&line);
            out.push('\n');
        }
    }
    out
}
