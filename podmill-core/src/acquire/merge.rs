//! Stream-copy merge of the video-only and audio-only artifacts.

use std::path::Path;

use tokio::process::Command;
use tracing::info;

use crate::config::{AcquireConfig, BinaryConfig};
use crate::error::{PipelineError, Result};
use crate::process::run_with_timeout;

/// Merge `video` and `audio` into `output` without re-encoding.
///
/// Inputs are validated before the tool is spawned and the output is
/// validated after it exits; a zero exit code alone is not proof of success.
pub async fn merge_streams(
    binaries: &BinaryConfig,
    acquire: &AcquireConfig,
    video: &Path,
    audio: &Path,
    output: &Path,
) -> Result<()> {
    validate_input(video, "video").await?;
    validate_input(audio, "audio").await?;

    let mut cmd = Command::new(&binaries.ffmpeg);
    cmd.arg("-hide_banner")
        .arg("-y")
        .arg("-i")
        .arg(video)
        .arg("-i")
        .arg(audio)
        .arg("-c")
        .arg("copy")
        // Normalize timestamps so the stream-copied container starts at zero.
        .arg("-fflags")
        .arg("+genpts")
        .arg("-avoid_negative_ts")
        .arg("make_zero")
        .arg("-movflags")
        .arg("+faststart")
        .arg(output);

    run_with_timeout(cmd, &binaries.ffmpeg, acquire.merge_timeout()).await?;

    let merged_len = match tokio::fs::metadata(output).await {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    };
    if merged_len == 0 {
        return Err(PipelineError::InvalidMedia(format!(
            "merge output {} is missing or empty despite a clean tool exit",
            output.display()
        )));
    }

    info!(
        output = %output.display(),
        bytes = merged_len,
        "merged video and audio streams"
    );
    Ok(())
}

async fn validate_input(path: &Path, label: &str) -> Result<()> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.len() > 0 => Ok(()),
        Ok(_) => Err(PipelineError::InvalidMedia(format!(
            "{label} input {} is zero bytes",
            path.display()
        ))),
        Err(_) => Err(PipelineError::InvalidMedia(format!(
            "{label} input {} is missing",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AcquireConfig;

    fn binaries_with_ffmpeg(ffmpeg: &str) -> BinaryConfig {
        BinaryConfig {
            downloader: "yt-dlp".into(),
            ffmpeg: ffmpeg.into(),
        }
    }

    #[tokio::test]
    async fn zero_byte_audio_fails_before_tool_spawn() {
        let tmp = tempfile::tempdir().unwrap();
        let video = tmp.path().join("video.mp4");
        let audio = tmp.path().join("audio.m4a");
        tokio::fs::write(&video, b"not-really-video").await.unwrap();
        tokio::fs::write(&audio, b"").await.unwrap();

        // A nonexistent tool proves no spawn happened: a spawn attempt would
        // surface MissingBinary, validation surfaces InvalidMedia.
        let err = merge_streams(
            &binaries_with_ffmpeg("no-such-merge-tool"),
            &AcquireConfig::default(),
            &video,
            &audio,
            &tmp.path().join("out.mp4"),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, PipelineError::InvalidMedia(_)));
    }

    #[tokio::test]
    async fn missing_video_fails_before_tool_spawn() {
        let tmp = tempfile::tempdir().unwrap();
        let audio = tmp.path().join("audio.m4a");
        tokio::fs::write(&audio, b"aac").await.unwrap();

        let err = merge_streams(
            &binaries_with_ffmpeg("no-such-merge-tool"),
            &AcquireConfig::default(),
            &tmp.path().join("video.mp4"),
            &audio,
            &tmp.path().join("out.mp4"),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, PipelineError::InvalidMedia(_)));
    }

    #[tokio::test]
    async fn clean_exit_without_output_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let video = tmp.path().join("video.mp4");
        let audio = tmp.path().join("audio.m4a");
        tokio::fs::write(&video, b"v").await.unwrap();
        tokio::fs::write(&audio, b"a").await.unwrap();

        // `true` exits zero and writes nothing; post-validation must fail.
        let err = merge_streams(
            &binaries_with_ffmpeg("true"),
            &AcquireConfig::default(),
            &video,
            &audio,
            &tmp.path().join("out.mp4"),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, PipelineError::InvalidMedia(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonempty_output_passes_post_validation() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let video = tmp.path().join("video.mp4");
        let audio = tmp.path().join("audio.m4a");
        tokio::fs::write(&video, b"v").await.unwrap();
        tokio::fs::write(&audio, b"a").await.unwrap();

        // Stand-in merge tool: writes a byte to its final argument.
        let fake_tool = tmp.path().join("fake-merge.sh");
        tokio::fs::write(&fake_tool, "#!/bin/sh\nfor a; do last=$a; done\necho data > \"$last\"\n")
            .await
            .unwrap();
        let mut perms = std::fs::metadata(&fake_tool).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&fake_tool, perms).unwrap();

        let output = tmp.path().join("out.mp4");
        merge_streams(
            &binaries_with_ffmpeg(fake_tool.to_str().unwrap()),
            &AcquireConfig::default(),
            &video,
            &audio,
            &output,
        )
        .await
        .unwrap();

        assert!(output.metadata().unwrap().len() > 0);
    }
}
