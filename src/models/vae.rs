//! # Latent video codec helpers.
//!
//! The auto-encoder works on individual frames: videos are folded into the
//! batch dimension before encoding and unfolded afterwards. Latents are kept
//! scaled by [`LATENT_SCALE`] so that they have roughly unit variance.
use super::LatentCodec;
use crate::error::{Error, Result};
use tch::Tensor;

/// Scaling applied to the auto-encoder latents before diffusion.
pub const LATENT_SCALE: f64 = 0.18215;

/// The latent distribution returned by the encoder, parameterized by its
/// mean and log-variance stacked along the channel dimension.
#[derive(Debug)]
pub struct DiagonalGaussianDistribution {
    mean: Tensor,
    std: Tensor,
}

impl DiagonalGaussianDistribution {
    pub fn new(parameters: &Tensor) -> Result<Self> {
        let size = parameters.size();
        if size.len() < 2 || size[1] % 2 != 0 {
            return Err(Error::shape("latent distribution moments", &[-1, 2, -1, -1], &size));
        }
        let channels = size[1] / 2;
        let mean = parameters.narrow(1, 0, channels);
        let logvar = parameters.narrow(1, channels, channels).clamp(-30., 20.);
        let std = (logvar * 0.5).exp();
        Ok(Self { mean, std })
    }

    pub fn sample(&self) -> Tensor {
        let sample = Tensor::randn_like(&self.mean);
        &self.mean + &self.std * sample
    }
}

/// Encodes a `(batch, frame, 3, h, w)` video into scaled latents shaped
/// `(batch, frame, channel, h / 8, w / 8)`.
pub fn encode_video<C: LatentCodec + ?Sized>(codec: &C, video: &Tensor) -> Result<Tensor> {
    let size = video.size();
    if size.len() != 5 {
        return Err(Error::shape("video to encode", &[-1, -1, 3, -1, -1], &size));
    }
    let (b, f) = (size[0], size[1]);
    let frames = video.flatten(0, 1);
    let latents = codec.encode(&frames)?.sample() * LATENT_SCALE;
    Ok(unfold_frames(&latents, b, f))
}

/// Decodes scaled latents back to a `(batch, frame, 3, h, w)` video.
pub fn decode_video<C: LatentCodec + ?Sized>(codec: &C, latents: &Tensor) -> Result<Tensor> {
    let size = latents.size();
    if size.len() != 5 {
        return Err(Error::shape("latents to decode", &[-1, -1, 4, -1, -1], &size));
    }
    let (b, f) = (size[0], size[1]);
    let frames = codec.decode(&(latents.flatten(0, 1) / LATENT_SCALE))?;
    Ok(unfold_frames(&frames, b, f))
}

fn unfold_frames(xs: &Tensor, b: i64, f: i64) -> Tensor {
    let mut shape = vec![b, f];
    shape.extend_from_slice(&xs.size()[1..]);
    xs.reshape(shape.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    /// Halves the resolution and keeps 2 channels, the log-variance being
    /// very negative so that sampling is close to the mean.
    struct PoolCodec;

    impl LatentCodec for PoolCodec {
        fn encode(&self, xs: &Tensor) -> Result<DiagonalGaussianDistribution> {
            let mean = xs.narrow(1, 0, 2).slice(2, 0, None, 2).slice(3, 0, None, 2);
            let logvar = Tensor::full_like(&mean, -30.);
            DiagonalGaussianDistribution::new(&Tensor::cat(&[mean, logvar], 1))
        }

        fn decode(&self, xs: &Tensor) -> Result<Tensor> {
            let (n, c, h, w) = xs.size4()?;
            let xs = xs
                .unsqueeze(3)
                .unsqueeze(5)
                .expand([n, c, h, 2, w, 2], false)
                .reshape([n, c, 2 * h, 2 * w]);
            Ok(Tensor::cat(&[&xs, &xs.narrow(1, 0, 1)], 1))
        }
    }

    #[test]
    fn encode_decode_folds_frames() -> Result<()> {
        let video = Tensor::ones([2, 3, 3, 8, 8], (Kind::Float, Device::Cpu));
        let latents = encode_video(&PoolCodec, &video)?;
        assert_eq!(latents.size(), [2, 3, 2, 4, 4]);
        let mean = latents.mean(Kind::Float).double_value(&[]);
        assert!((mean - LATENT_SCALE).abs() < 1e-4, "{mean}");

        let decoded = decode_video(&PoolCodec, &latents)?;
        assert_eq!(decoded.size(), [2, 3, 3, 8, 8]);
        let max_err = (decoded - &video).abs().max().double_value(&[]);
        assert!(max_err < 1e-4, "{max_err}");
        Ok(())
    }

    #[test]
    fn odd_moments_are_rejected() {
        let params = Tensor::zeros([1, 3, 2, 2], (Kind::Float, Device::Cpu));
        assert!(DiagonalGaussianDistribution::new(&params).is_err());
    }
}
