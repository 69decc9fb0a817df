//! Checkpoint files: the EMA parameters under `ema.<name>` plus the number of
//! optimizer steps under `meta.train_steps`, stored with `Tensor::save_multi`.
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tch::{nn, Tensor};
use tracing::{info, warn};

const EMA_PREFIX: &str = "ema.";
const TRAIN_STEPS_KEY: &str = "meta.train_steps";

/// `<dir>/0001000.pt` for step 1000.
pub fn checkpoint_path<P: AsRef<Path>>(dir: P, train_steps: usize) -> PathBuf {
    dir.as_ref().join(format!("{train_steps:07}.pt"))
}

/// Writes the EMA tensors and the step count to `path`.
pub fn save<P: AsRef<Path>>(
    path: P,
    ema: &BTreeMap<String, Tensor>,
    train_steps: usize,
) -> Result<()> {
    let mut named: Vec<(String, Tensor)> = ema
        .iter()
        .map(|(name, tensor)| (format!("{EMA_PREFIX}{name}"), tensor.to_device(tch::Device::Cpu)))
        .collect();
    named.push((TRAIN_STEPS_KEY.to_string(), Tensor::from(train_steps as i64)));
    Tensor::save_multi(named.as_slice(), path.as_ref())?;
    Ok(())
}

#[derive(Debug)]
pub struct Checkpoint {
    pub path: PathBuf,
    /// The EMA parameters, or every tensor of a plain parameter file.
    pub ema: BTreeMap<String, Tensor>,
    pub train_steps: Option<usize>,
}

impl Checkpoint {
    /// Reads a checkpoint. When some tensors carry the `ema.` prefix only
    /// those are kept, otherwise the file is a plain parameter dict and every
    /// tensor is taken as a parameter.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::MissingCheckpoint(Some(path.to_path_buf())));
        }
        let mut ema = BTreeMap::new();
        let mut plain = BTreeMap::new();
        let mut train_steps = None;
        for (name, tensor) in Tensor::load_multi(path)? {
            if name == TRAIN_STEPS_KEY {
                train_steps = usize::try_from(tensor.int64_value(&[])).ok();
            } else if let Some(param) = name.strip_prefix(EMA_PREFIX) {
                ema.insert(param.to_string(), tensor);
            } else {
                plain.insert(name, tensor);
            }
        }
        if ema.is_empty() {
            info!("No EMA entries in {path:?}, reading {} plain parameters", plain.len());
            ema = plain;
        } else {
            for name in plain.keys() {
                warn!("Ignoring checkpoint entry {name}");
            }
        }
        Ok(Self { path: path.to_path_buf(), ema, train_steps })
    }

    /// The step to resume from: the stored step count, or the number the
    /// file is named after.
    pub fn resume_step(&self) -> Option<usize> {
        self.train_steps.or_else(|| step_from_file_name(&self.path))
    }
}

fn step_from_file_name(path: &Path) -> Option<usize> {
    path.file_stem()?.to_str()?.parse().ok()
}

/// The checkpoint with the highest step number in `dir`, if any.
pub fn latest_checkpoint<P: AsRef<Path>>(dir: P) -> Result<Option<PathBuf>> {
    let mut latest: Option<(usize, PathBuf)> = None;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().map_or(true, |ext| ext != "pt") {
            continue;
        }
        if let Some(step) = step_from_file_name(&path) {
            if latest.as_ref().map_or(true, |(best, _)| step > *best) {
                latest = Some((step, path));
            }
        }
    }
    Ok(latest.map(|(_, path)| path))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    pub ignored: usize,
}

impl LoadReport {
    /// Percentage of the checkpoint tensors that made it into the model.
    pub fn loaded_percent(&self) -> f64 {
        let total = self.loaded + self.ignored;
        if total == 0 {
            return 0.;
        }
        100. * self.loaded as f64 / total as f64
    }
}

/// Copies the tensors whose names and shapes match a variable of `vs`,
/// logging every tensor that was left out. Variables absent from `tensors`
/// keep their current values.
pub fn load_intersection(vs: &nn::VarStore, tensors: &BTreeMap<String, Tensor>) -> LoadReport {
    let _no_grad_guard = tch::no_grad_guard();
    let mut variables = vs.variables();
    let mut report = LoadReport { loaded: 0, ignored: 0 };
    for (name, value) in tensors {
        match variables.get_mut(name) {
            Some(var) if var.size() == value.size() => {
                var.copy_(value);
                report.loaded += 1;
            }
            Some(var) => {
                warn!("Ignoring {name}: shape {:?} vs {:?}", value.size(), var.size());
                report.ignored += 1;
            }
            None => {
                warn!("Ignoring {name}");
                report.ignored += 1;
            }
        }
    }
    info!("Successfully loaded {:.1}% of the checkpoint weights", report.loaded_percent());
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    fn tensors(pairs: &[(&str, f64)]) -> BTreeMap<String, Tensor> {
        pairs
            .iter()
            .map(|(name, v)| {
                (name.to_string(), Tensor::full([2, 2], *v, (Kind::Float, Device::Cpu)))
            })
            .collect()
    }

    #[test]
    fn round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = checkpoint_path(dir.path(), 1500);
        assert!(path.ends_with("0001500.pt"));
        save(&path, &tensors(&[("blocks_0_attn_temp_weight", 1.5), ("final_bias", -2.)]), 1500)?;

        let checkpoint = Checkpoint::load(&path)?;
        assert_eq!(checkpoint.train_steps, Some(1500));
        assert_eq!(checkpoint.resume_step(), Some(1500));
        assert_eq!(checkpoint.ema.len(), 2);
        assert_eq!(checkpoint.ema["final_bias"].double_value(&[1, 1]), -2.);
        Ok(())
    }

    #[test]
    fn resume_step_falls_back_to_file_name() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("0020000.pt");
        let named = vec![("ema.w".to_string(), Tensor::zeros([1], (Kind::Float, Device::Cpu)))];
        Tensor::save_multi(named.as_slice(), &path)?;
        let checkpoint = Checkpoint::load(&path)?;
        assert_eq!(checkpoint.train_steps, None);
        assert_eq!(checkpoint.resume_step(), Some(20000));
        Ok(())
    }

    #[test]
    fn plain_parameter_file_is_read_whole() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pretrained.pt");
        let named = vec![
            ("blocks_0_mlp_bias".to_string(), Tensor::full([2], 7., (Kind::Float, Device::Cpu))),
            ("final_bias".to_string(), Tensor::zeros([3], (Kind::Float, Device::Cpu))),
        ];
        Tensor::save_multi(named.as_slice(), &path)?;
        let checkpoint = Checkpoint::load(&path)?;
        assert_eq!(checkpoint.ema.len(), 2);
        assert_eq!(checkpoint.ema["blocks_0_mlp_bias"].double_value(&[1]), 7.);
        assert_eq!(checkpoint.train_steps, None);

        let mixed = dir.path().join("mixed.pt");
        let named = vec![
            ("ema.w".to_string(), Tensor::ones([1], (Kind::Float, Device::Cpu))),
            ("w".to_string(), Tensor::zeros([1], (Kind::Float, Device::Cpu))),
        ];
        Tensor::save_multi(named.as_slice(), &mixed)?;
        let checkpoint = Checkpoint::load(&mixed)?;
        assert_eq!(checkpoint.ema.len(), 1);
        assert_eq!(checkpoint.ema["w"].double_value(&[0]), 1.);
        Ok(())
    }

    #[test]
    fn missing_checkpoint() {
        let res = Checkpoint::load("/nonexistent/0001000.pt");
        assert!(matches!(res, Err(Error::MissingCheckpoint(Some(_)))));
    }

    #[test]
    fn latest_checkpoint_by_step() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        assert_eq!(latest_checkpoint(dir.path())?, None);
        for step in [1000, 12000, 3000] {
            save(checkpoint_path(dir.path(), step), &tensors(&[("w", 0.)]), step)?;
        }
        std::fs::write(dir.path().join("notes.txt"), "")?;
        assert_eq!(latest_checkpoint(dir.path())?, Some(checkpoint_path(dir.path(), 12000)));
        Ok(())
    }

    #[test]
    fn intersection_skips_unknown_and_mismatched() {
        let vs = nn::VarStore::new(Device::Cpu);
        let _a = vs.root().var("a", &[2, 2], nn::Init::Const(0.));
        let _b = vs.root().var("b", &[3], nn::Init::Const(0.));
        let _c = vs.root().var("c", &[2, 2], nn::Init::Const(9.));
        let report = load_intersection(&vs, &tensors(&[("a", 4.), ("b", 1.), ("z", 1.)]));
        assert_eq!(report, LoadReport { loaded: 1, ignored: 2 });
        assert!((report.loaded_percent() - 100. / 3.).abs() < 1e-9);
        let vars = vs.variables();
        assert_eq!(vars["a"].double_value(&[0, 1]), 4.);
        assert_eq!(vars["b"].double_value(&[0]), 0.);
        assert_eq!(vars["c"].double_value(&[0, 0]), 9.);
    }
}
