//! Rendition ladders and per-encoder thread budgeting.

use crate::acquire::metadata::QualityTier;
use crate::governor::ResourceGovernor;

/// One bitrate/resolution variant of the adaptive asset, plus its encoder
/// thread allocation. Transient: consumed within a single transcode
/// invocation and discarded after upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenditionJob {
    pub label: String,
    pub resolution: String,
    pub video_bitrate: String,
    pub audio_bitrate: String,
    pub threads: usize,
}

impl RenditionJob {
    fn new(label: &str, resolution: &str, video_bitrate: &str, audio_bitrate: &str) -> Self {
        Self {
            label: label.to_string(),
            resolution: resolution.to_string(),
            video_bitrate: video_bitrate.to_string(),
            audio_bitrate: audio_bitrate.to_string(),
            threads: 0,
        }
    }

    /// `1920x1080` → `(1920, 1080)`.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        let (w, h) = self.resolution.split_once('x')?;
        Some((w.parse().ok()?, h.parse().ok()?))
    }
}

/// The ladder generated beneath a top rendition. Highest quality first; the
/// order is preserved through encoding, manifests, and upload.
pub fn ladder_for(tier: QualityTier) -> Vec<RenditionJob> {
    match tier {
        QualityTier::Hd1080 => vec![
            RenditionJob::new("1080p", "1920x1080", "5000k", "192k"),
            RenditionJob::new("720p", "1280x720", "2800k", "128k"),
            RenditionJob::new("480p", "854x480", "1400k", "128k"),
            RenditionJob::new("360p", "640x360", "800k", "96k"),
        ],
        QualityTier::Hd720 => vec![
            RenditionJob::new("720p", "1280x720", "2800k", "128k"),
            RenditionJob::new("480p", "854x480", "1400k", "128k"),
            RenditionJob::new("360p", "640x360", "800k", "96k"),
        ],
    }
}

/// Distribute `total_cores` across `jobs`.
///
/// Every encoder receives a floor of 2 threads; the remainder is dealt out
/// from the top rendition down so the sum equals the core count exactly
/// whenever `total_cores >= 2 * jobs.len()`. Hosts smaller than the floor
/// keep the floor and oversubscribe.
pub fn allocate_threads(total_cores: usize, jobs: &mut [RenditionJob]) {
    if jobs.is_empty() {
        return;
    }
    let floor = 2usize;
    for job in jobs.iter_mut() {
        job.threads = floor;
    }
    let committed = floor * jobs.len();
    if total_cores <= committed {
        return;
    }
    let mut remainder = total_cores - committed;
    let mut i = 0;
    while remainder > 0 {
        jobs[i % jobs.len()].threads += 1;
        remainder -= 1;
        i += 1;
    }
}

/// Ladder with thread budgets for this host (or the configured override).
pub fn planned_ladder(tier: QualityTier, cores_override: Option<usize>) -> Vec<RenditionJob> {
    let cores = cores_override.unwrap_or_else(ResourceGovernor::cpu_bound_permits);
    let mut jobs = ladder_for(tier);
    allocate_threads(cores, &mut jobs);
    jobs
}
