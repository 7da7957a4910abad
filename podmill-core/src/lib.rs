//! # Podmill Core
//!
//! Core library for the Podmill episode pipeline: ingest long-form source
//! media, produce a multi-rendition HLS asset, and durably record the result
//! as an episode row — exactly once, under partial failure and any number of
//! concurrent workers.
//!
//! ## Architecture
//!
//! - [`governor`]: named permit pools and the shared retry/backoff policy
//!   every external call runs under
//! - [`acquire`]: concurrent video/audio acquisition, validated stream-copy
//!   merge, and cleanup discipline
//! - [`transcode`]: single-invocation multi-rendition HLS transcoding with
//!   master-manifest fallback
//! - [`store`]: transactional Postgres episode persistence with row-locked
//!   duplicate detection and post-write validation
//! - [`resolver`]: classification of prior episode state into skip /
//!   reprocess / full-pipeline decisions
//! - [`pipeline`]: the per-episode driver tying the above together
//! - [`ports`]: boundary traits for object storage, enrichment, and the
//!   downstream ready notification

pub mod acquire;
pub mod config;
pub mod error;
pub mod governor;
pub mod pipeline;
pub mod ports;
pub mod process;
pub mod resolver;
pub mod store;
pub mod transcode;

pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use pipeline::{ChannelContext, EpisodePipeline, PipelineOutcome};
