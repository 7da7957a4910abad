//! Multi-rendition HLS transcoding in a single tool invocation.
//!
//! One decode feeds a split/scale filter graph with a branch per rendition
//! plus a normalized audio chain, so N renditions cost one pass over the
//! source. The tool is asked to emit the master playlist; if it does not,
//! one is synthesized from whatever sub-manifests actually landed.

pub mod manifest;
pub mod renditions;

use std::path::Path;
use std::sync::Arc;

use futures::future::try_join_all;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::acquire::metadata::QualityTier;
use crate::config::{BinaryConfig, TranscodeConfig};
use crate::error::{PipelineError, Result};
use crate::governor::{Resource, ResourceGovernor};
use crate::ports::ObjectStorage;
use crate::process::run_with_timeout;

use renditions::RenditionJob;

pub const MASTER_PLAYLIST_NAME: &str = "master.m3u8";

/// How the audio branch is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AudioMode {
    /// Resample to 48 kHz stereo and encode one AAC track per rendition.
    Encode,
    /// Stream-copy the source track. Fallback for the known encoder
    /// assertion fault; trades a larger audio track for robustness.
    Copy,
}

/// Produces the adaptive asset for one merged source file and uploads it.
#[derive(Clone)]
pub struct Transcoder {
    binaries: BinaryConfig,
    config: TranscodeConfig,
    governor: ResourceGovernor,
    storage: Arc<dyn ObjectStorage>,
    stream_bucket: String,
}

impl std::fmt::Debug for Transcoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transcoder")
            .field("binaries", &self.binaries)
            .field("config", &self.config)
            .field("stream_bucket", &self.stream_bucket)
            .finish_non_exhaustive()
    }
}

impl Transcoder {
    pub fn new(
        binaries: BinaryConfig,
        config: TranscodeConfig,
        governor: ResourceGovernor,
        storage: Arc<dyn ObjectStorage>,
        stream_bucket: impl Into<String>,
    ) -> Self {
        Self {
            binaries,
            config,
            governor,
            storage,
            stream_bucket: stream_bucket.into(),
        }
    }

    /// Transcode `source` into the ladder for `tier`, upload every produced
    /// file under `key_prefix`, and return the master manifest's location.
    /// The local working directory is removed on every exit path.
    pub async fn run(&self, source: &Path, tier: QualityTier, key_prefix: &str) -> Result<String> {
        let jobs = renditions::planned_ladder(tier, self.config.cpu_cores_override);
        let work_dir = source
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("hls");
        tokio::fs::create_dir_all(&work_dir).await?;

        let result = self.run_inner(source, &jobs, &work_dir, key_prefix).await;

        match tokio::fs::remove_dir_all(&work_dir).await {
            Ok(()) => debug!(work_dir = %work_dir.display(), "removed transcode working directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                work_dir = %work_dir.display(),
                error = %e,
                "failed to remove transcode working directory"
            ),
        }

        result.map_err(|e| e.into_stage("transcode"))
    }

    async fn run_inner(
        &self,
        source: &Path,
        jobs: &[RenditionJob],
        work_dir: &Path,
        key_prefix: &str,
    ) -> Result<String> {
        self.encode(source, jobs, work_dir).await?;

        if !work_dir.join(MASTER_PLAYLIST_NAME).is_file() {
            warn!("tool did not emit a master manifest, synthesizing one");
            manifest::synthesize_master(work_dir, jobs).await?;
        }

        self.upload_all(work_dir, key_prefix).await
    }

    /// One invocation for all renditions, with the audio-copy fallback: the
    /// known AAC assertion fault triggers exactly one retry of the whole
    /// invocation with the audio branch stream-copied.
    async fn encode(&self, source: &Path, jobs: &[RenditionJob], work_dir: &Path) -> Result<()> {
        let first = self
            .invoke_tool(source, jobs, work_dir, AudioMode::Encode)
            .await;

        match first {
            Err(PipelineError::ProcessFailed { ref detail, .. })
                if is_audio_encoder_assertion(detail) =>
            {
                warn!("audio encoder assertion fault, retrying with stream-copied audio");
                self.invoke_tool(source, jobs, work_dir, AudioMode::Copy)
                    .await
            }
            other => other,
        }
    }

    async fn invoke_tool(
        &self,
        source: &Path,
        jobs: &[RenditionJob],
        work_dir: &Path,
        audio: AudioMode,
    ) -> Result<()> {
        let args = build_tool_args(source, jobs, work_dir, audio, self.config.segment_seconds);
        let binaries = self.binaries.clone();
        let limit = self.config.transcode_timeout();

        // Deliberately permit-only: the single sanctioned retry is the
        // audio-copy fallback above, not a blind re-encode of a multi-hour
        // invocation.
        self.governor
            .run_with_permit(Resource::Disk, async move {
                let mut cmd = Command::new(&binaries.ffmpeg);
                cmd.args(&args);
                run_with_timeout(cmd, &binaries.ffmpeg, limit).await.map(|_| ())
            })
            .await
    }

    /// Upload segments, sub-manifests, and the master under `key_prefix`,
    /// returning the master's public location.
    async fn upload_all(&self, work_dir: &Path, key_prefix: &str) -> Result<String> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(work_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        let has_master = names.iter().any(|n| n == MASTER_PLAYLIST_NAME);
        if !has_master {
            return Err(PipelineError::Internal(
                "master manifest was not among the produced files".into(),
            ));
        }
        names.retain(|n| n != MASTER_PLAYLIST_NAME);

        // Segments and sub-manifests first, concurrently; the master strictly
        // last so readers never see it pointing at absent files.
        let uploads = names.iter().map(|name| {
            let local = work_dir.join(name);
            let key = format!("{key_prefix}/{name}");
            let bucket = self.stream_bucket.clone();
            async move {
                self.governor
                    .execute(Resource::Network, "upload", || {
                        self.storage.upload(&local, &bucket, &key)
                    })
                    .await
            }
        });
        let uploaded = try_join_all(uploads).await?;

        let master_local = work_dir.join(MASTER_PLAYLIST_NAME);
        let master_key = format!("{key_prefix}/{MASTER_PLAYLIST_NAME}");
        let master = self
            .governor
            .execute(Resource::Network, "upload", || {
                self.storage
                    .upload(&master_local, &self.stream_bucket, &master_key)
            })
            .await?;

        info!(
            files = uploaded.len() + 1,
            master = %master.location,
            "uploaded adaptive asset"
        );
        Ok(master.location)
    }
}

/// The known audio-encoder assertion fault signature.
fn is_audio_encoder_assertion(stderr: &str) -> bool {
    stderr.contains("Assertion") && (stderr.contains("aac") || stderr.contains("audio"))
}

/// Build the full tool invocation for `jobs`.
///
/// Layout is flat: `{label}_%03d.ts` segments, `{label}.m3u8` sub-manifests,
/// `master.m3u8` at the top, all inside `work_dir`.
fn build_tool_args(
    source: &Path,
    jobs: &[RenditionJob],
    work_dir: &Path,
    audio: AudioMode,
    segment_seconds: u32,
) -> Vec<String> {
    let n = jobs.len();
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-y".into(),
        "-i".into(),
        source.to_string_lossy().into_owned(),
    ];

    // Filter graph: one decode, split into a scale branch per rendition,
    // plus one normalized audio chain split the same way when encoding.
    let mut graph = String::new();
    graph.push_str(&format!("[0:v]split={n}"));
    for i in 0..n {
        graph.push_str(&format!("[vin{i}]"));
    }
    for (i, job) in jobs.iter().enumerate() {
        let (w, h) = job
            .dimensions()
            .expect("rendition resolutions are <width>x<height>");
        graph.push_str(&format!(";[vin{i}]scale={w}:{h}[v{i}]"));
    }
    if audio == AudioMode::Encode {
        graph.push_str(&format!(
            ";[0:a]aresample=48000,aformat=sample_fmts=fltp:channel_layouts=stereo,asplit={n}"
        ));
        for i in 0..n {
            graph.push_str(&format!("[a{i}]"));
        }
    }
    args.push("-filter_complex".into());
    args.push(graph);

    for (i, job) in jobs.iter().enumerate() {
        args.push("-map".into());
        args.push(format!("[v{i}]"));
        args.push(format!("-c:v:{i}"));
        args.push("libx264".into());
        args.push(format!("-preset:v:{i}"));
        args.push("fast".into());
        args.push(format!("-b:v:{i}"));
        args.push(job.video_bitrate.clone());
        args.push(format!("-threads:v:{i}"));
        args.push(job.threads.to_string());
    }

    for (i, job) in jobs.iter().enumerate() {
        match audio {
            AudioMode::Encode => {
                args.push("-map".into());
                args.push(format!("[a{i}]"));
                args.push(format!("-c:a:{i}"));
                args.push("aac".into());
                args.push(format!("-b:a:{i}"));
                args.push(job.audio_bitrate.clone());
            }
            AudioMode::Copy => {
                args.push("-map".into());
                args.push("0:a:0".into());
                args.push(format!("-c:a:{i}"));
                args.push("copy".into());
            }
        }
    }

    let var_stream_map = jobs
        .iter()
        .enumerate()
        .map(|(i, job)| format!("v:{i},a:{i},name:{}", job.label))
        .collect::<Vec<_>>()
        .join(" ");

    args.extend([
        "-f".into(),
        "hls".into(),
        "-hls_time".into(),
        segment_seconds.to_string(),
        "-hls_playlist_type".into(),
        "vod".into(),
        "-hls_list_size".into(),
        "0".into(),
        "-hls_segment_type".into(),
        "mpegts".into(),
        "-hls_segment_filename".into(),
        work_dir.join("%v_%03d.ts").to_string_lossy().into_owned(),
        "-master_pl_name".into(),
        MASTER_PLAYLIST_NAME.into(),
        "-var_stream_map".into(),
        var_stream_map,
        work_dir.join("%v.m3u8").to_string_lossy().into_owned(),
    ]);

    args
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    use super::*;
    use crate::config::{GovernorConfig, RetryConfig};
    use crate::ports::{MockObjectStorage, StoredObject};
    use crate::transcode::renditions::{allocate_threads, ladder_for};

    fn jobs_720() -> Vec<RenditionJob> {
        let mut jobs = ladder_for(QualityTier::Hd720);
        allocate_threads(8, &mut jobs);
        jobs
    }

    #[test]
    fn args_split_once_and_name_every_variant() {
        let jobs = jobs_720();
        let args = build_tool_args(
            Path::new("/work/src1/episode.mp4"),
            &jobs,
            Path::new("/work/src1/hls"),
            AudioMode::Encode,
            6,
        );
        let joined = args.join(" ");

        assert!(joined.contains("[0:v]split=3[vin0][vin1][vin2]"));
        assert!(joined.contains("asplit=3"));
        assert!(joined.contains("v:0,a:0,name:720p v:1,a:1,name:480p v:2,a:2,name:360p"));
        assert!(joined.contains("-master_pl_name master.m3u8"));
        // Thread budgets reach the encoder per stream.
        assert!(joined.contains("-threads:v:0 3"));
        assert!(joined.contains("-threads:v:2 2"));
    }

    #[test]
    fn copy_mode_drops_the_audio_filter_chain() {
        let jobs = jobs_720();
        let args = build_tool_args(
            Path::new("/in.mp4"),
            &jobs,
            Path::new("/out"),
            AudioMode::Copy,
            6,
        );
        let joined = args.join(" ");

        assert!(!joined.contains("asplit"));
        assert!(!joined.contains("aresample"));
        assert!(joined.contains("-c:a:0 copy"));
        assert!(joined.contains("-map 0:a:0"));
    }

    #[test]
    fn assertion_signature_detection() {
        assert!(is_audio_encoder_assertion(
            "Assertion failed: (cbits[i] < 8) in aac encoder"
        ));
        assert!(!is_audio_encoder_assertion("Generic encode failure"));
        assert!(!is_audio_encoder_assertion("Assertion in h264 core"));
    }

    fn test_governor() -> ResourceGovernor {
        ResourceGovernor::new(
            &GovernorConfig::default(),
            RetryConfig {
                max_attempts: 1,
                base_delay_ms: 1,
                multiplier: 2.0,
                max_delay_ms: 2,
            },
        )
    }

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    /// Stand-in encoder: writes variant playlists and one segment each into
    /// the output directory (derived from the final argument) but never a
    /// master, exercising the synthesis fallback.
    const FAKE_ENCODER_NO_MASTER: &str = r#"#!/bin/sh
for a; do last=$a; done
dir=$(dirname "$last")
for name in 720p 480p 360p; do
  printf '#EXTM3U\n' > "$dir/$name.m3u8"
  printf seg > "$dir/${name}_000.ts"
done
"#;

    #[tokio::test]
    async fn missing_master_is_synthesized_and_uploaded_last() {
        let tmp = tempfile::tempdir().unwrap();
        let encoder = write_script(tmp.path(), "fake-ffmpeg.sh", FAKE_ENCODER_NO_MASTER);
        let source = tmp.path().join("work/src1/episode.mp4");
        tokio::fs::create_dir_all(source.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&source, b"merged").await.unwrap();

        let mut storage = MockObjectStorage::new();
        storage
            .expect_upload()
            .times(7)
            .returning(|_, bucket, key| {
                Ok(StoredObject {
                    location: format!("https://cdn.example/{bucket}/{key}"),
                })
            });

        let transcoder = Transcoder::new(
            BinaryConfig {
                downloader: "yt-dlp".into(),
                ffmpeg: encoder.to_string_lossy().into_owned(),
            },
            TranscodeConfig {
                cpu_cores_override: Some(8),
                ..TranscodeConfig::default()
            },
            test_governor(),
            Arc::new(storage),
            "streams",
        );

        let master = transcoder
            .run(&source, QualityTier::Hd720, "shows/acme/src1")
            .await
            .unwrap();

        assert_eq!(
            master,
            "https://cdn.example/streams/shows/acme/src1/master.m3u8"
        );
        // Working directory is gone, merged source still present.
        assert!(!source.parent().unwrap().join("hls").exists());
        assert!(source.exists());
    }

    #[tokio::test]
    async fn workdir_is_removed_even_when_the_tool_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let encoder = write_script(
            tmp.path(),
            "fake-ffmpeg.sh",
            "#!/bin/sh\necho 'kaboom' >&2\nexit 1\n",
        );
        let source = tmp.path().join("work/src1/episode.mp4");
        tokio::fs::create_dir_all(source.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&source, b"merged").await.unwrap();

        let transcoder = Transcoder::new(
            BinaryConfig {
                downloader: "yt-dlp".into(),
                ffmpeg: encoder.to_string_lossy().into_owned(),
            },
            TranscodeConfig {
                cpu_cores_override: Some(8),
                ..TranscodeConfig::default()
            },
            test_governor(),
            Arc::new(MockObjectStorage::new()),
            "streams",
        );

        let err = transcoder
            .run(&source, QualityTier::Hd720, "shows/acme/src1")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Stage {
                stage: "transcode",
                ..
            }
        ));
        assert!(!source.parent().unwrap().join("hls").exists());
        assert!(source.exists(), "merged source is the caller's to clean up");
    }
}
