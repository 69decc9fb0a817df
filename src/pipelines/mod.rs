//! # Pipelines

pub mod endora;

pub use endora::{load_ema_weights, sampling_checkpoint, VideoSampler};
