//! # Models
//!
//! The networks used in the diffusion loop are external: the denoising
//! backbone, the latent video codec and the frozen self-supervised feature
//! extractor. This module defines the narrow interfaces through which the
//! diffusion core reaches them, together with the conditioning bundle passed
//! to the backbone.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use tch::Tensor;

pub mod scripted;
pub mod vae;

pub use vae::DiagonalGaussianDistribution;

/// Layers of the ViT feature extractor used for representation alignment.
pub const DEFAULT_FEATURE_LAYERS: [i64; 4] = [2, 5, 8, 11];

/// How the backbone projects its hidden states onto the feature extractor
/// activations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlignmentMode {
    #[serde(rename = "type0")]
    Type0,
    #[serde(rename = "type1")]
    Type1,
    #[serde(rename = "type2")]
    Type2,
    #[serde(rename = "type_cnn")]
    TypeCnn,
}

impl AlignmentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Type0 => "type0",
            Self::Type1 => "type1",
            Self::Type2 => "type2",
            Self::TypeCnn => "type_cnn",
        }
    }
}

impl Default for AlignmentMode {
    fn default() -> Self {
        Self::TypeCnn
    }
}

/// Everything the backbone is conditioned on besides the noisy latent and
/// the timestep. Leaving every field unset gives unconditional generation.
#[derive(Debug)]
pub struct Conditioning {
    /// Class labels, one per batch element.
    pub labels: Option<Tensor>,
    /// Classifier-free guidance scale, guidance is off when unset or `<= 1`.
    pub guidance_scale: Option<f64>,
    /// Whether the backbone runs in half precision.
    pub use_fp16: bool,
    /// Latent of the reference (mask) video, shaped like the sample.
    pub reference_latent: Option<Tensor>,
    /// Frozen feature extractor activations for the clean frames, one tensor
    /// per entry of `feature_layers`.
    pub features: Option<Vec<Tensor>>,
    pub feature_layers: Vec<i64>,
    /// Representation alignment variant, no alignment term when unset.
    pub mode: Option<AlignmentMode>,
}

impl Default for Conditioning {
    fn default() -> Self {
        Self {
            labels: None,
            guidance_scale: None,
            use_fp16: false,
            reference_latent: None,
            features: None,
            feature_layers: DEFAULT_FEATURE_LAYERS.to_vec(),
            mode: None,
        }
    }
}

impl Conditioning {
    pub fn with_reference(reference_latent: Tensor) -> Self {
        Self { reference_latent: Some(reference_latent), ..Default::default() }
    }

    pub fn shallow_clone(&self) -> Self {
        Self {
            labels: self.labels.as_ref().map(Tensor::shallow_clone),
            guidance_scale: self.guidance_scale,
            use_fp16: self.use_fp16,
            reference_latent: self.reference_latent.as_ref().map(Tensor::shallow_clone),
            features: self
                .features
                .as_ref()
                .map(|fs| fs.iter().map(Tensor::shallow_clone).collect()),
            feature_layers: self.feature_layers.clone(),
            mode: self.mode,
        }
    }
}

/// What the backbone returns for a batch of noisy latents.
#[derive(Debug)]
pub struct ModelOutput {
    /// Shaped `(batch, frame, channel, h, w)`. With a learned variance the
    /// channel axis holds the noise prediction followed by the variance
    /// values.
    pub prediction: Tensor,
    /// Projected hidden states to align with `Conditioning::features`.
    pub aligned_features: Option<Vec<Tensor>>,
}

impl From<Tensor> for ModelOutput {
    fn from(prediction: Tensor) -> Self {
        Self { prediction, aligned_features: None }
    }
}

/// The diffusion backbone: given a noisy latent, the timesteps and the
/// conditioning, predicts the noise (and optionally the variance).
pub trait DenoisingModel {
    fn forward(&self, xs: &Tensor, timesteps: &Tensor, cond: &Conditioning) -> Result<ModelOutput>;
}

impl<F> DenoisingModel for F
where
    F: Fn(&Tensor, &Tensor, &Conditioning) -> Result<ModelOutput>,
{
    fn forward(&self, xs: &Tensor, timesteps: &Tensor, cond: &Conditioning) -> Result<ModelOutput> {
        self(xs, timesteps, cond)
    }
}

/// A frozen image encoder exposing some of its intermediate activations.
pub trait FeatureExtractor {
    /// Runs `images` of shape `(n, 3, h, w)` and returns the activations of
    /// the requested blocks, in the order of `layers`.
    fn extract_layers(&self, images: &Tensor, layers: &[i64]) -> Result<Vec<Tensor>>;
}

/// Maps pixel frames to latent distributions and latents back to pixels.
/// Scaling by [`vae::LATENT_SCALE`] is left to the caller.
pub trait LatentCodec {
    fn encode(&self, xs: &Tensor) -> Result<DiagonalGaussianDistribution>;
    fn decode(&self, xs: &Tensor) -> Result<Tensor>;
}
