//! # Latent video diffusion
//!
//! Training and sampling core of EnDora, a video diffusion model working in
//! the latent space of a frame auto-encoder, using Torch via
//! [tch-rs](https://github.com/LaurentMazare/tch-rs).
//!
//! This library includes:
//! - Noise schedules with timestep respacing, the forward process and the
//!   hybrid training loss with a representation alignment term.
//! - Ancestral (DDPM) and accelerated (DDIM) samplers, with classifier-free
//!   guidance.
//! - A training session with an exponential moving average of the weights
//!   and checkpointing.
//!
//! The backbone, the auto-encoder and the feature extractor are loaded from
//! TorchScript exports.

pub mod config;
pub mod diffusion;
pub mod error;
pub mod guidance;
pub mod models;
pub mod pipelines;
pub mod schedulers;
pub mod train;
pub mod utils;
pub mod video;

pub use error::{Error, Result};
