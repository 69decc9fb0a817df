//! TorchScript-backed implementations of the model traits.
//!
//! The networks are exported from PyTorch with `torch.jit.script` and loaded
//! here through libtorch, so the diffusion loop stays independent of their
//! architecture.
use super::{Conditioning, DenoisingModel, DiagonalGaussianDistribution, FeatureExtractor};
use super::{LatentCodec, ModelOutput};
use crate::error::{Error, Result};
use std::path::Path;
use tch::{nn, CModule, Device, IValue, Kind, Tensor};

fn optional(xs: Option<&Tensor>, kind: Option<Kind>) -> IValue {
    match (xs, kind) {
        (Some(xs), Some(kind)) => IValue::Tensor(xs.to_kind(kind)),
        (Some(xs), None) => IValue::Tensor(xs.shallow_clone()),
        (None, _) => IValue::None,
    }
}

fn tensor_list(module: &'static str, value: IValue) -> Result<Vec<Tensor>> {
    match value {
        IValue::TensorList(tensors) => Ok(tensors),
        IValue::Tuple(values) | IValue::GenericList(values) => values
            .into_iter()
            .map(|value| match value {
                IValue::Tensor(tensor) => Ok(tensor),
                other => Err(Error::ScriptedOutput {
                    module,
                    reason: format!("expected a tensor in the list, got {other:?}"),
                }),
            })
            .collect(),
        other => Err(Error::ScriptedOutput {
            module,
            reason: format!("expected a list of tensors, got {other:?}"),
        }),
    }
}

/// The denoising backbone, with its parameters registered in a `VarStore` so
/// that they can be optimized.
///
/// The scripted `forward` is called as
/// `forward(x, t, y: Optional[Tensor], y_image: Optional[Tensor], mode: Optional[str])`
/// and returns either the prediction or a `(prediction, aligned_features)`
/// tuple.
pub struct ScriptedBackbone {
    module: tch::TrainableCModule,
}

impl ScriptedBackbone {
    pub fn load<P: AsRef<Path>>(path: P, vs_path: nn::Path) -> Result<Self> {
        let module = tch::TrainableCModule::load(path, vs_path)?;
        Ok(Self { module })
    }

    pub fn set_train(&mut self) {
        self.module.set_train()
    }

    pub fn set_eval(&mut self) {
        self.module.set_eval()
    }
}

impl DenoisingModel for ScriptedBackbone {
    fn forward(&self, xs: &Tensor, timesteps: &Tensor, cond: &Conditioning) -> Result<ModelOutput> {
        let kind = if cond.use_fp16 { Some(Kind::Half) } else { None };
        let inputs = [
            optional(Some(xs), kind),
            IValue::Tensor(timesteps.shallow_clone()),
            optional(cond.labels.as_ref(), None),
            optional(cond.reference_latent.as_ref(), kind),
            match cond.mode {
                Some(mode) => IValue::String(mode.as_str().to_string()),
                None => IValue::None,
            },
        ];
        let output = self.module.forward_is(&inputs)?;
        let (prediction, aligned_features) = match output {
            IValue::Tensor(prediction) => (prediction, None),
            IValue::Tuple(mut values) if values.len() == 2 => {
                let features = values.pop().map(|v| tensor_list("backbone", v)).transpose()?;
                match values.pop() {
                    Some(IValue::Tensor(prediction)) => (prediction, features),
                    other => {
                        return Err(Error::ScriptedOutput {
                            module: "backbone",
                            reason: format!("expected a prediction tensor, got {other:?}"),
                        })
                    }
                }
            }
            other => {
                return Err(Error::ScriptedOutput {
                    module: "backbone",
                    reason: format!("unexpected output {other:?}"),
                })
            }
        };
        let prediction = prediction.to_kind(xs.kind());
        Ok(ModelOutput { prediction, aligned_features })
    }
}

/// The frozen latent video codec, exposing `encode` (returning the
/// concatenated mean and log-variance) and `decode` methods.
pub struct ScriptedCodec {
    module: CModule,
    device: Device,
    kind: Kind,
}

impl ScriptedCodec {
    pub fn load<P: AsRef<Path>>(path: P, device: Device) -> Result<Self> {
        let mut module = CModule::load_on_device(path, device)?;
        module.set_eval();
        Ok(Self { module, device, kind: Kind::Float })
    }

    /// Runs the codec in half precision.
    pub fn half(mut self) -> Self {
        self.module.to(self.device, Kind::Half, false);
        self.kind = Kind::Half;
        self
    }
}

impl LatentCodec for ScriptedCodec {
    fn encode(&self, xs: &Tensor) -> Result<DiagonalGaussianDistribution> {
        let inputs = [xs.to_device(self.device).to_kind(self.kind)];
        let params = tch::no_grad(|| self.module.method_ts("encode", &inputs))?;
        DiagonalGaussianDistribution::new(&params.to_device(xs.device()).to_kind(Kind::Float))
    }

    fn decode(&self, xs: &Tensor) -> Result<Tensor> {
        let inputs = [xs.to_device(self.device).to_kind(self.kind)];
        let frames = tch::no_grad(|| self.module.method_ts("decode", &inputs))?;
        Ok(frames.to_device(xs.device()).to_kind(Kind::Float))
    }
}

/// The frozen self-supervised ViT, exposing a
/// `get_special_layers(images, layers: List[int])` method.
pub struct ScriptedFeatureExtractor {
    module: CModule,
    device: Device,
}

impl ScriptedFeatureExtractor {
    pub fn load<P: AsRef<Path>>(path: P, device: Device) -> Result<Self> {
        let mut module = CModule::load_on_device(path, device)?;
        module.set_eval();
        Ok(Self { module, device })
    }
}

impl FeatureExtractor for ScriptedFeatureExtractor {
    fn extract_layers(&self, images: &Tensor, layers: &[i64]) -> Result<Vec<Tensor>> {
        let inputs =
            [IValue::Tensor(images.to_device(self.device)), IValue::IntList(layers.to_vec())];
        let output = tch::no_grad(|| self.module.method_is("get_special_layers", &inputs))?;
        let features = tensor_list("feature extractor", output)?;
        if features.len() != layers.len() {
            return Err(Error::ScriptedOutput {
                module: "feature extractor",
                reason: format!("asked for {} layers, got {}", layers.len(), features.len()),
            });
        }
        Ok(features.into_iter().map(|f| f.to_device(images.device())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_lists_are_unpacked() -> Result<()> {
        let a = Tensor::from_slice(&[1f32]);
        let b = Tensor::from_slice(&[2f32]);
        let list = IValue::GenericList(vec![IValue::Tensor(a.shallow_clone()), IValue::Tensor(b)]);
        let tensors = tensor_list("test", list)?;
        assert_eq!(tensors.len(), 2);
        assert!(tensors[0].equal(&a));
        let tuple = IValue::Tuple(vec![IValue::Tensor(a)]);
        assert_eq!(tensor_list("test", tuple)?.len(), 1);
        Ok(())
    }

    #[test]
    fn non_tensor_outputs_are_rejected() {
        let res = tensor_list("test", IValue::Int(3));
        assert!(matches!(res, Err(Error::ScriptedOutput { module: "test", .. })));
        let res = tensor_list("test", IValue::GenericList(vec![IValue::Double(1.0)]));
        assert!(matches!(res, Err(Error::ScriptedOutput { .. })));
    }

    #[test]
    fn missing_optional_inputs_are_none() {
        assert!(matches!(optional(None, Some(Kind::Half)), IValue::None));
        let xs = Tensor::zeros([2], (Kind::Float, Device::Cpu));
        match optional(Some(&xs), Some(Kind::Half)) {
            IValue::Tensor(t) => assert_eq!(t.kind(), Kind::Half),
            other => panic!("unexpected {other:?}"),
        }
    }
}
