//! Fixed-pattern parsing of the downloader's textual output.
//!
//! The tool's stdout is the only contract it offers: progress percentages and
//! the final artifact path both arrive as free-form lines. The patterns live
//! here and nowhere else, so a tool upgrade is a one-file change.

use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Regex;

/// `[download]  45.2% of 1.21GiB at 5.45MiB/s ETA 01:23`
static DOWNLOAD_PERCENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[download\]\s+(\d{1,3}(?:\.\d+)?)%").unwrap());

/// `[download] Destination: /work/ep/video.f137.mp4`
static DOWNLOAD_DESTINATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[download\]\s+Destination:\s+(.+)$").unwrap());

/// `[ExtractAudio] Destination: /work/ep/audio.m4a`
static POSTPROCESS_DESTINATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[(?:ExtractAudio|ffmpeg)\]\s+Destination:\s+(.+)$").unwrap());

/// `[Merger] Merging formats into "/work/ep/full.mp4"`
static MERGER_DESTINATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^\[Merger\]\s+Merging formats into\s+"(.+)"$"#).unwrap());

/// `[download] /work/ep/video.mp4 has already been downloaded`
static ALREADY_DOWNLOADED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[download\]\s+(.+?)\s+has already been downloaded").unwrap());

/// One observation parsed out of a downloader output line.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Completion percentage of the current fragment/file.
    Percent(f32),
    /// The tool announced where it is writing an artifact.
    Destination(PathBuf),
    /// The artifact already existed from an earlier run.
    AlreadyDownloaded(PathBuf),
}

/// Parse a single output line against the known patterns.
pub fn parse_line(line: &str) -> Option<ProgressEvent> {
    let line = line.trim_end();

    if let Some(caps) = DOWNLOAD_DESTINATION.captures(line) {
        return Some(ProgressEvent::Destination(sanitize_artifact_path(&caps[1])));
    }
    if let Some(caps) = POSTPROCESS_DESTINATION.captures(line) {
        return Some(ProgressEvent::Destination(sanitize_artifact_path(&caps[1])));
    }
    if let Some(caps) = MERGER_DESTINATION.captures(line) {
        return Some(ProgressEvent::Destination(sanitize_artifact_path(&caps[1])));
    }
    if let Some(caps) = ALREADY_DOWNLOADED.captures(line) {
        return Some(ProgressEvent::AlreadyDownloaded(sanitize_artifact_path(
            &caps[1],
        )));
    }
    if let Some(caps) = DOWNLOAD_PERCENT.captures(line) {
        if let Ok(pct) = caps[1].parse::<f32>() {
            return Some(ProgressEvent::Percent(pct.min(100.0)));
        }
    }

    None
}

/// Strip quoting and control characters from a tool-reported path before it
/// touches the filesystem.
pub fn sanitize_artifact_path(raw: &str) -> PathBuf {
    let trimmed = raw
        .trim()
        .trim_matches('"')
        .trim_matches('\'')
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>();
    PathBuf::from(trimmed)
}

/// Accumulates observations across a whole download job and resolves the
/// final artifact path once the process exits.
///
/// The tool may announce several destinations (fragment files, then the
/// post-processed output); the last one wins. An "already downloaded" notice
/// also identifies the artifact.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    last_destination: Option<PathBuf>,
    last_percent: f32,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, line: &str) -> Option<ProgressEvent> {
        let event = parse_line(line)?;
        match &event {
            ProgressEvent::Destination(path) | ProgressEvent::AlreadyDownloaded(path) => {
                self.last_destination = Some(path.clone());
            }
            ProgressEvent::Percent(pct) => {
                self.last_percent = *pct;
            }
        }
        Some(event)
    }

    pub fn percent(&self) -> f32 {
        self.last_percent
    }

    /// The artifact path the tool last announced, if any.
    pub fn final_artifact(&self) -> Option<&PathBuf> {
        self.last_destination.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_percent_lines() {
        assert_eq!(
            parse_line("[download]  45.2% of 1.21GiB at 5.45MiB/s ETA 01:23"),
            Some(ProgressEvent::Percent(45.2))
        );
        assert_eq!(
            parse_line("[download] 100% of 1.21GiB in 03:12"),
            Some(ProgressEvent::Percent(100.0))
        );
    }

    #[test]
    fn parses_download_destination() {
        assert_eq!(
            parse_line("[download] Destination: /work/ep/video.f137.mp4"),
            Some(ProgressEvent::Destination(PathBuf::from(
                "/work/ep/video.f137.mp4"
            )))
        );
    }

    #[test]
    fn parses_postprocessor_destinations() {
        assert_eq!(
            parse_line("[ExtractAudio] Destination: /work/ep/audio.m4a"),
            Some(ProgressEvent::Destination(PathBuf::from(
                "/work/ep/audio.m4a"
            )))
        );
        assert_eq!(
            parse_line("[ffmpeg] Destination: /work/ep/audio.mp3"),
            Some(ProgressEvent::Destination(PathBuf::from(
                "/work/ep/audio.mp3"
            )))
        );
    }

    #[test]
    fn parses_merger_destination() {
        assert_eq!(
            parse_line(r#"[Merger] Merging formats into "/work/ep/full.mp4""#),
            Some(ProgressEvent::Destination(PathBuf::from("/work/ep/full.mp4")))
        );
    }

    #[test]
    fn parses_already_downloaded() {
        assert_eq!(
            parse_line("[download] /work/ep/video.mp4 has already been downloaded"),
            Some(ProgressEvent::AlreadyDownloaded(PathBuf::from(
                "/work/ep/video.mp4"
            )))
        );
    }

    #[test]
    fn ignores_unrelated_lines() {
        assert_eq!(parse_line("[info] Downloading 1 format(s): 137+140"), None);
        assert_eq!(parse_line("WARNING: unable to extract uploader"), None);
        assert_eq!(parse_line(""), None);
    }

    #[test]
    fn sanitizes_quotes_and_control_chars() {
        assert_eq!(
            sanitize_artifact_path("\"/work/ep/full.mp4\"\r"),
            PathBuf::from("/work/ep/full.mp4")
        );
        assert_eq!(
            sanitize_artifact_path("/work/ep/\u{0007}odd.mp4"),
            PathBuf::from("/work/ep/odd.mp4")
        );
    }

    #[test]
    fn tracker_keeps_last_destination() {
        let mut tracker = ProgressTracker::new();
        tracker.observe("[download] Destination: /work/ep/video.f137.mp4");
        tracker.observe("[download]  12.0% of 800MiB at 3MiB/s ETA 04:00");
        tracker.observe(r#"[Merger] Merging formats into "/work/ep/full.mp4""#);

        assert_eq!(
            tracker.final_artifact(),
            Some(&PathBuf::from("/work/ep/full.mp4"))
        );
        assert_eq!(tracker.percent(), 12.0);
    }
}
