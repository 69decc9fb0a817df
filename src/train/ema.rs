//! Exponential moving average of the backbone parameters.
//!
//! The averaged copy is what gets checkpointed and what sampling runs with.
use std::collections::BTreeMap;
use tch::{nn, Tensor};

pub const DEFAULT_EMA_DECAY: f64 = 0.9999;

#[derive(Debug)]
pub struct Ema {
    shadow: BTreeMap<String, Tensor>,
    decay: f64,
}

impl Ema {
    /// Starts the average from a copy of the current parameters.
    pub fn new(vs: &nn::VarStore, decay: f64) -> Self {
        let _no_grad_guard = tch::no_grad_guard();
        let shadow = vs
            .variables()
            .into_iter()
            .map(|(name, param)| (name, param.detach().copy()))
            .collect();
        Self { shadow, decay }
    }

    /// `shadow = decay * shadow + (1 - decay) * param` for every parameter.
    pub fn update(&mut self, vs: &nn::VarStore) {
        self.update_with_decay(vs, self.decay)
    }

    /// Same as [`Ema::update`] with an explicit decay, `0` copies the
    /// parameters.
    pub fn update_with_decay(&mut self, vs: &nn::VarStore, decay: f64) {
        let _no_grad_guard = tch::no_grad_guard();
        for (name, param) in vs.variables() {
            match self.shadow.get_mut(&name) {
                Some(shadow) => {
                    let averaged = &*shadow * decay + param.detach() * (1. - decay);
                    shadow.copy_(&averaged);
                }
                None => {
                    self.shadow.insert(name, param.detach().copy());
                }
            }
        }
    }

    pub fn tensors(&self) -> &BTreeMap<String, Tensor> {
        &self.shadow
    }

    /// Replaces averaged values by the ones in `tensors` for the names both
    /// know about. Returns the number of tensors copied.
    pub fn load(&mut self, tensors: &BTreeMap<String, Tensor>) -> usize {
        let _no_grad_guard = tch::no_grad_guard();
        let mut loaded = 0;
        for (name, shadow) in self.shadow.iter_mut() {
            if let Some(value) = tensors.get(name) {
                if value.size() == shadow.size() {
                    shadow.copy_(value);
                    loaded += 1;
                }
            }
        }
        loaded
    }
}
