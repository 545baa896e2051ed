//! Adam optimizer with serializable moment state.
//!
//! The update follows AdamW: bias-corrected first and second moments plus
//! an optional decoupled weight decay. Gradients come from a
//! [`GradientBuffer`] instead of a single `backward()` result so that the
//! discriminator can step once over two accumulated passes.

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor, Var};

use crate::config::GanConfig;
use crate::error::{GanError, Result};
use crate::gradient::GradientBuffer;
use crate::model::{decode_tensors, encode_tensors};

const STEP_KEY: &str = "step";

/// Hyperparameters of one [`Adam`] instance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizerConfig {
    /// Learning rate.
    pub learning_rate: f64,
    /// First-moment decay.
    pub beta1: f64,
    /// Second-moment decay.
    pub beta2: f64,
    /// Denominator epsilon.
    pub eps: f64,
    /// Decoupled weight decay. Zero disables it.
    pub weight_decay: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 2e-4,
            beta1: 0.5,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

impl From<&GanConfig> for OptimizerConfig {
    fn from(config: &GanConfig) -> Self {
        Self {
            learning_rate: config.learning_rate,
            beta1: config.beta1,
            beta2: config.beta2,
            ..Self::default()
        }
    }
}

/// Adam over a fixed set of named variables.
pub struct Adam {
    config: OptimizerConfig,
    /// First moment estimates
    m: BTreeMap<String, Tensor>,
    /// Second moment estimates
    v: BTreeMap<String, Tensor>,
    /// Step counter for bias correction
    t: usize,
}

impl Adam {
    /// Create an optimizer with empty moment state.
    pub fn new(config: OptimizerConfig) -> Self {
        Self {
            config,
            m: BTreeMap::new(),
            v: BTreeMap::new(),
            t: 0,
        }
    }

    /// Number of steps taken, including steps restored from a checkpoint.
    pub fn step_count(&self) -> usize {
        self.t
    }

    /// Current learning rate.
    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    /// Change the learning rate for subsequent steps.
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    /// Apply one update to every variable in `vars` that has a gradient in
    /// `grads`. Variables without a gradient are left untouched.
    pub fn step(&mut self, vars: &[(String, Var)], grads: &GradientBuffer) -> Result<()> {
        self.t += 1;
        let OptimizerConfig {
            learning_rate: lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.config;

        let bc1 = bias_correction(beta1, self.t);
        let bc2 = bias_correction(beta2, self.t);

        for (name, var) in vars {
            let Some(grad) = grads.get(name) else {
                continue;
            };

            let (m, v) = match (self.m.get(name), self.v.get(name)) {
                (Some(m), Some(v)) => (m.clone(), v.clone()),
                _ => (
                    Tensor::zeros(var.dims(), DType::F32, var.device())?,
                    Tensor::zeros(var.dims(), DType::F32, var.device())?,
                ),
            };

            // m = b1 * m + (1 - b1) * g
            let m_new = ((&m * beta1)? + (grad * (1.0 - beta1))?)?;
            // v = b2 * v + (1 - b2) * g^2
            let v_new = ((&v * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;

            let m_hat = (&m_new / bc1)?;
            let v_hat = (&v_new / bc2)?;
            let update = ((&m_hat / (v_hat.sqrt()? + eps)?)? * lr)?;

            let weights = var.as_tensor();
            let mut next = (weights - &update)?;
            if weight_decay > 0.0 {
                next = (next - (weights * (lr * weight_decay))?)?;
            }
            var.set(&next)?;

            self.m.insert(name.clone(), m_new);
            self.v.insert(name.clone(), v_new);
        }

        Ok(())
    }

    /// Serialize the moment estimates and step counter.
    pub fn state_blob(&self) -> Result<Vec<u8>> {
        let mut tensors = BTreeMap::new();
        for (name, m) in &self.m {
            tensors.insert(format!("m.{name}"), m.clone());
        }
        for (name, v) in &self.v {
            tensors.insert(format!("v.{name}"), v.clone());
        }
        tensors.insert(
            STEP_KEY.to_string(),
            Tensor::new(&[self.t as i64], &Device::Cpu)?,
        );
        encode_tensors(&tensors)
    }

    /// Replace the optimizer state with one produced by [`Adam::state_blob`].
    pub fn load_state(&mut self, blob: &[u8], device: &Device) -> Result<()> {
        let tensors = decode_tensors(blob, device)?;
        let step = tensors
            .get(STEP_KEY)
            .ok_or_else(|| GanError::checkpoint("optimizer state has no step counter"))?
            .to_vec1::<i64>()?;
        let step = *step
            .first()
            .ok_or_else(|| GanError::checkpoint("optimizer step counter is empty"))?;

        let mut m = BTreeMap::new();
        let mut v = BTreeMap::new();
        for (key, tensor) in tensors {
            if let Some(name) = key.strip_prefix("m.") {
                m.insert(name.to_string(), tensor);
            } else if let Some(name) = key.strip_prefix("v.") {
                v.insert(name.to_string(), tensor);
            }
        }
        if m.len() != v.len() || m.keys().ne(v.keys()) {
            return Err(GanError::checkpoint(
                "optimizer state has unpaired moment tensors",
            ));
        }

        self.m = m;
        self.v = v;
        self.t = usize::try_from(step)
            .map_err(|_| GanError::checkpoint(format!("invalid optimizer step {step}")))?;
        Ok(())
    }
}

/// `1 - beta^t`, saturating the exponent instead of wrapping.
fn bias_correction(beta: f64, t: usize) -> f64 {
    1.0 - beta.powi(i32::try_from(t).unwrap_or(i32::MAX))
}
