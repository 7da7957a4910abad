//! Master manifest synthesis and bitrate arithmetic.
//!
//! The transcoding tool is asked to emit the master playlist itself; this
//! module is the fallback when it does not, and the home of the
//! `<number><k|m>` bitrate parsing both paths share.

use std::path::Path;

use tracing::{info, warn};

use super::renditions::RenditionJob;
use crate::error::{PipelineError, Result};

/// Parse a bitrate string with an optional `k`/`m` suffix to bits per second.
pub fn parse_bitrate(raw: &str) -> Option<u64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lower = trimmed.to_ascii_lowercase();
    let (digits, multiplier) = match lower.strip_suffix('k') {
        Some(head) => (head, 1_000u64),
        None => match lower.strip_suffix('m') {
            Some(head) => (head, 1_000_000u64),
            None => (lower.as_str(), 1u64),
        },
    };
    let value: f64 = digits.parse().ok()?;
    if value < 0.0 {
        return None;
    }
    Some((value * multiplier as f64).round() as u64)
}

/// Estimated total bandwidth of one rendition: video plus audio bitrate.
pub fn estimated_bandwidth(job: &RenditionJob) -> u64 {
    parse_bitrate(&job.video_bitrate).unwrap_or(0) + parse_bitrate(&job.audio_bitrate).unwrap_or(0)
}

/// Sub-manifest filename for a rendition label in the flat HLS layout.
pub fn variant_playlist_name(label: &str) -> String {
    format!("{label}.m3u8")
}

/// Build master manifest content for the renditions whose sub-manifests are
/// actually present in `dir`, preserving ladder order and skipping the rest.
pub fn synthesize_master_content(dir: &Path, jobs: &[RenditionJob]) -> String {
    let mut content = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");

    for job in jobs {
        let playlist = variant_playlist_name(&job.label);
        if !dir.join(&playlist).is_file() {
            warn!(
                rendition = %job.label,
                "sub-manifest missing, omitting from master"
            );
            continue;
        }
        content.push_str(&format!(
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}\n{}\n",
            estimated_bandwidth(job),
            job.resolution,
            playlist
        ));
    }

    content
}

/// Write a synthesized master manifest into `dir`. Fails when no rendition
/// survived, since a master without variants is useless.
pub async fn synthesize_master(dir: &Path, jobs: &[RenditionJob]) -> Result<()> {
    let content = synthesize_master_content(dir, jobs);
    if !content.contains("#EXT-X-STREAM-INF") {
        return Err(PipelineError::InvalidMedia(format!(
            "no rendition sub-manifests found under {}",
            dir.display()
        )));
    }

    let master = dir.join(super::MASTER_PLAYLIST_NAME);
    tokio::fs::write(&master, &content).await?;
    info!(master = %master.display(), "synthesized master manifest");
    Ok(())
}
