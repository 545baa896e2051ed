//! Binary cross-entropy on discriminator logits.

use candle_core::{Result, Tensor};

/// Label value for real images.
pub const REAL_LABEL: f64 = 1.0;
/// Label value for generated images.
pub const FAKE_LABEL: f64 = 0.0;

/// Mean binary cross-entropy between `sigmoid(logits)` and a constant
/// `target` for every element.
///
/// Uses `max(x, 0) - x * t + ln(1 + exp(-|x|))`, which stays finite for
/// large logits of either sign.
pub fn bce_with_logits(logits: &Tensor, target: f64) -> Result<Tensor> {
    let positive = logits.relu()?;
    let weighted = logits.affine(target, 0.0)?;
    let soft = ((logits.abs()?.neg()?.exp()? + 1.0)?).log()?;
    ((positive - weighted)? + soft)?.mean_all()
}

/// Mean of `sigmoid(logits)`: the average probability the discriminator
/// assigns to "real".
pub fn mean_probability(logits: &Tensor) -> Result<f32> {
    candle_nn::ops::sigmoid(logits)?
        .mean_all()?
        .to_dtype(candle_core::DType::F32)?
        .to_scalar::<f32>()
}
