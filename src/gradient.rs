//! Explicit gradient accumulation.
//!
//! candle returns a fresh [`GradStore`] from every `backward()` call. The
//! adversarial protocol needs the discriminator's real-data and fake-data
//! passes to land in one buffer before a single optimizer step, so each
//! network gets a [`GradientBuffer`] that the trainer zeroes and fills
//! explicitly.

use std::collections::BTreeMap;

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};

use crate::error::Result;

/// Accumulated gradients for one network, keyed by parameter name.
#[derive(Debug, Default)]
pub struct GradientBuffer {
    grads: BTreeMap<String, Tensor>,
    passes: usize,
}

impl GradientBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every accumulated gradient.
    pub fn zero(&mut self) {
        self.grads.clear();
        self.passes = 0;
    }

    /// Add the gradients that `store` holds for `vars` to the buffer.
    ///
    /// Parameters absent from `store` are skipped; gradients the store
    /// holds for other tensors (for instance the other network) are
    /// ignored.
    pub fn accumulate(&mut self, store: &GradStore, vars: &[(String, Var)]) -> Result<()> {
        for (name, var) in vars {
            let Some(grad) = store.get(var.as_tensor()) else {
                continue;
            };
            let grad = grad.detach();
            let summed = match self.grads.remove(name) {
                Some(existing) => (existing + grad)?,
                None => grad,
            };
            self.grads.insert(name.clone(), summed);
        }
        self.passes += 1;
        Ok(())
    }

    /// Accumulated gradient for `name`, if any pass produced one.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.grads.get(name)
    }

    /// Number of `accumulate` calls since the last `zero`.
    pub fn passes(&self) -> usize {
        self.passes
    }

    /// True when no gradient has been accumulated.
    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    /// Global L2 norm of the accumulated gradients.
    pub fn norm(&self) -> Result<f32> {
        let mut total = 0.0f32;
        for grad in self.grads.values() {
            let sq: f32 = grad.sqr()?.sum_all()?.to_scalar()?;
            total += sq;
        }
        Ok(total.sqrt())
    }
}
