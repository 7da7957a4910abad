//! One-shot source metadata fetch and quality tier selection.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::{AcquireConfig, BinaryConfig};
use crate::error::{PipelineError, Result};
use crate::process::run_with_timeout;

/// Source metadata as reported by the downloader's JSON dump. Fetched once
/// per episode and reused for naming, tier selection, and persistence.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceMetadata {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub uploader: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    /// `YYYYMMDD` as emitted by the tool.
    #[serde(default)]
    pub upload_date: Option<String>,
    #[serde(default)]
    pub filesize: Option<u64>,
    #[serde(default)]
    pub filesize_approx: Option<u64>,
    #[serde(default)]
    pub duration: Option<f64>,
}

impl SourceMetadata {
    /// Best available size estimate for the source media.
    pub fn reported_size(&self) -> Option<u64> {
        self.filesize.or(self.filesize_approx)
    }

    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.upload_date.as_deref()?;
        let date = NaiveDate::parse_from_str(raw, "%Y%m%d").ok()?;
        Some(date.and_hms_opt(0, 0, 0)?.and_utc())
    }

    /// Title reduced to a filesystem-safe directory/file stem.
    pub fn safe_title(&self) -> String {
        let mut out = String::with_capacity(self.title.len());
        for c in self.title.chars() {
            match c {
                '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => out.push('_'),
                c if c.is_control() => {}
                c => out.push(c),
            }
        }
        let trimmed = out.trim().trim_matches('.');
        let mut safe: String = trimmed.chars().take(120).collect();
        if safe.is_empty() {
            safe.push_str("untitled");
        }
        safe
    }
}

/// Target top rendition for the transcode ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityTier {
    Hd1080,
    Hd720,
}

impl QualityTier {
    pub fn target_height(self) -> u32 {
        match self {
            QualityTier::Hd1080 => 1080,
            QualityTier::Hd720 => 720,
        }
    }

    /// Format selector handed to the downloader for the video-only job.
    pub fn video_format(self) -> &'static str {
        match self {
            QualityTier::Hd1080 => "bestvideo[height<=1080][ext=mp4]/bestvideo[height<=1080]",
            QualityTier::Hd720 => "bestvideo[height<=720][ext=mp4]/bestvideo[height<=720]",
        }
    }
}

/// Prefer the 1080p target only when the reported source size stays under the
/// configured threshold; large sources drop to 720p.
pub fn select_quality_tier(metadata: &SourceMetadata, threshold_bytes: u64) -> QualityTier {
    match metadata.reported_size() {
        Some(size) if size < threshold_bytes => QualityTier::Hd1080,
        Some(_) => QualityTier::Hd720,
        // No size reported: assume the conservative target.
        None => QualityTier::Hd720,
    }
}

/// Fetch metadata for `source_url` with a single `--dump-json` invocation.
pub async fn fetch_metadata(
    binaries: &BinaryConfig,
    acquire: &AcquireConfig,
    source_url: &str,
) -> Result<SourceMetadata> {
    let mut cmd = Command::new(&binaries.downloader);
    cmd.arg("--dump-json").arg("--no-playlist");
    if let Some(cookie_file) = &acquire.cookie_file {
        cmd.arg("--cookies").arg(cookie_file);
    }
    cmd.arg(source_url);

    let output = run_with_timeout(cmd, &binaries.downloader, acquire.metadata_timeout()).await?;

    let metadata: SourceMetadata = serde_json::from_str(output.stdout.trim()).map_err(|e| {
        PipelineError::InvalidMedia(format!("metadata dump for {source_url} did not parse: {e}"))
    })?;

    debug!(
        source_id = %metadata.id,
        size = ?metadata.reported_size(),
        "fetched source metadata"
    );
    info!(title = %metadata.title, "resolved source metadata");
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(filesize: Option<u64>, filesize_approx: Option<u64>) -> SourceMetadata {
        SourceMetadata {
            id: "abc123".into(),
            title: "Episode One".into(),
            description: None,
            channel: None,
            channel_id: None,
            uploader: None,
            thumbnail: None,
            upload_date: None,
            filesize,
            filesize_approx,
            duration: None,
        }
    }

    #[test]
    fn small_sources_get_the_1080_tier() {
        let meta = metadata(Some(500), None);
        assert_eq!(select_quality_tier(&meta, 1_000), QualityTier::Hd1080);
    }

    #[test]
    fn large_or_unsized_sources_fall_back_to_720() {
        let meta = metadata(Some(5_000), None);
        assert_eq!(select_quality_tier(&meta, 1_000), QualityTier::Hd720);

        let meta = metadata(None, None);
        assert_eq!(select_quality_tier(&meta, 1_000), QualityTier::Hd720);
    }

    #[test]
    fn approx_size_is_used_when_exact_is_missing() {
        let meta = metadata(None, Some(900));
        assert_eq!(meta.reported_size(), Some(900));
        assert_eq!(select_quality_tier(&meta, 1_000), QualityTier::Hd1080);
    }

    #[test]
    fn upload_date_parses_to_midnight_utc() {
        let mut meta = metadata(None, None);
        meta.upload_date = Some("20240315".into());
        let parsed = meta.published_at().unwrap();
        assert_eq!(parsed.to_rfc3339(), "2024-03-15T00:00:00+00:00");

        meta.upload_date = Some("not-a-date".into());
        assert!(meta.published_at().is_none());
    }

    #[test]
    fn titles_are_reduced_to_safe_stems() {
        let mut meta = metadata(None, None);
        meta.title = "War & Peace: Part 1/2 <director's cut>".into();
        assert_eq!(meta.safe_title(), "War & Peace_ Part 1_2 _director's cut_");

        meta.title = " ... ".into();
        assert_eq!(meta.safe_title(), "untitled");
    }
}
