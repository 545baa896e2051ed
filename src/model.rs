//! Generator and discriminator networks.
//!
//! Both networks are small MLPs whose parameters live in a candle
//! [`VarMap`]. Weights are drawn from the trainer's seeded RNG rather than
//! candle's device RNG so that a seed fully determines initialisation.
//!
//! The trainer only relies on the [`Network`] trait: forward evaluation,
//! the named trainable variables, and parameter snapshots as opaque
//! safetensors blobs.

use std::collections::BTreeMap;

use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::{Linear, VarMap};
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::config::{GanConfig, ImageSettings};
use crate::error::{GanError, Result};

/// Whether gradients may flow from the discriminator back into the
/// tensor it is evaluated on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradientFlow {
    /// Evaluate a detached view: the generator receives no gradient.
    Blocked,
    /// Keep the graph intact so the generator can be trained through
    /// the discriminator.
    Tracked,
}

/// A differentiable network the trainer can optimise and checkpoint.
pub trait Network {
    /// Forward evaluation.
    fn forward(&self, xs: &Tensor) -> Result<Tensor>;

    /// Variable store holding the trainable parameters.
    fn var_map(&self) -> &VarMap;

    /// Trainable variables sorted by name.
    fn named_vars(&self) -> Result<Vec<(String, Var)>> {
        let data = self
            .var_map()
            .data()
            .lock()
            .map_err(|_| GanError::config("variable map lock poisoned"))?;
        let mut vars: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(vars)
    }

    /// Total number of trainable scalars.
    fn parameter_count(&self) -> Result<usize> {
        Ok(self
            .named_vars()?
            .iter()
            .map(|(_, var)| var.elem_count())
            .sum())
    }

    /// Snapshot of every parameter as a safetensors byte buffer.
    fn export_parameters(&self) -> Result<Vec<u8>> {
        let tensors: BTreeMap<String, Tensor> = self
            .named_vars()?
            .into_iter()
            .map(|(name, var)| (name, var.as_tensor().detach()))
            .collect();
        encode_tensors(&tensors)
    }

    /// Overwrite every parameter from a buffer produced by
    /// [`Network::export_parameters`].
    ///
    /// # Errors
    ///
    /// Fails if a parameter is missing from the blob or has another shape.
    fn import_parameters(&self, blob: &[u8]) -> Result<()> {
        let vars = self.named_vars()?;
        let device = vars
            .first()
            .map(|(_, var)| var.device().clone())
            .unwrap_or(Device::Cpu);
        let loaded = decode_tensors(blob, &device)?;
        for (name, var) in &vars {
            let value = loaded
                .get(name)
                .ok_or_else(|| GanError::checkpoint(format!("parameter '{name}' missing")))?;
            if value.dims() != var.dims() {
                return Err(GanError::shape_mismatch(
                    format!("{name} {:?}", var.dims()),
                    format!("{:?}", value.dims()),
                ));
            }
            var.set(value)?;
        }
        Ok(())
    }
}

/// Encode named tensors as a safetensors buffer.
pub(crate) fn encode_tensors(tensors: &BTreeMap<String, Tensor>) -> Result<Vec<u8>> {
    let bytes = safetensors::serialize(tensors.iter(), &None)?;
    Ok(bytes)
}

/// Decode a safetensors buffer onto `device`.
pub(crate) fn decode_tensors(
    blob: &[u8],
    device: &Device,
) -> Result<std::collections::HashMap<String, Tensor>> {
    Ok(candle_core::safetensors::load_buffer(blob, device)?)
}

/// Register a `(rows, cols)` weight drawn from `N(0, std)` and a zero bias
/// under `prefix`, returning the linear layer that shares their storage.
fn seeded_linear<R: Rng>(
    var_map: &VarMap,
    prefix: &str,
    in_dim: usize,
    out_dim: usize,
    std: f64,
    rng: &mut R,
    device: &Device,
) -> Result<Linear> {
    let normal = Normal::new(0.0f32, std as f32)
        .map_err(|e| GanError::config(format!("invalid init std {std}: {e}")))?;
    let values: Vec<f32> = (0..in_dim * out_dim).map(|_| normal.sample(rng)).collect();
    let weight = Var::from_tensor(&Tensor::from_vec(values, (out_dim, in_dim), device)?)?;
    let bias = Var::zeros(out_dim, DType::F32, device)?;

    let mut data = var_map
        .data()
        .lock()
        .map_err(|_| GanError::config("variable map lock poisoned"))?;
    data.insert(format!("{prefix}.weight"), weight.clone());
    data.insert(format!("{prefix}.bias"), bias.clone());

    Ok(Linear::new(
        weight.as_tensor().clone(),
        Some(bias.as_tensor().clone()),
    ))
}

fn leaky_relu(xs: &Tensor, slope: f64) -> candle_core::Result<Tensor> {
    xs.maximum(&xs.affine(slope, 0.0)?)
}

/// Maps latent noise `(B, latent_dim)` to images `(B, C, H, W)` in `[-1, 1]`.
pub struct Generator {
    var_map: VarMap,
    layers: Vec<Linear>,
    image: ImageSettings,
    latent_dim: usize,
}

impl Generator {
    /// Build a generator for `config`, drawing weights from `rng`.
    pub fn new<R: Rng>(config: &GanConfig, rng: &mut R, device: &Device) -> Result<Self> {
        let var_map = VarMap::new();
        let hidden = config.model.generator_hidden;
        let std = config.model.init_std;
        let dims = [
            config.latent_dim,
            hidden,
            hidden * 2,
            config.image.pixels(),
        ];
        let layers = dims
            .windows(2)
            .enumerate()
            .map(|(i, pair)| {
                seeded_linear(&var_map, &format!("gen.fc{i}"), pair[0], pair[1], std, &mut *rng, device)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            var_map,
            layers,
            image: config.image,
            latent_dim: config.latent_dim,
        })
    }

    /// Latent dimensionality expected by [`Network::forward`].
    pub fn latent_dim(&self) -> usize {
        self.latent_dim
    }
}

impl Network for Generator {
    fn forward(&self, noise: &Tensor) -> Result<Tensor> {
        let (batch, latent) = noise.dims2()?;
        if latent != self.latent_dim {
            return Err(GanError::shape_mismatch(
                format!("[{batch}, {}]", self.latent_dim),
                format!("{:?}", noise.dims()),
            ));
        }

        let last = self.layers.len() - 1;
        let mut xs = noise.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            xs = layer.forward(&xs)?;
            xs = if i == last { xs.tanh()? } else { xs.relu()? };
        }
        let ImageSettings {
            channels,
            height,
            width,
        } = self.image;
        Ok(xs.reshape((batch, channels, height, width))?)
    }

    fn var_map(&self) -> &VarMap {
        &self.var_map
    }
}

/// Scores images `(B, C, H, W)` with one real/fake logit each, `(B, 1)`.
pub struct Discriminator {
    var_map: VarMap,
    layers: Vec<Linear>,
    image: ImageSettings,
    slope: f64,
}

impl Discriminator {
    /// Build a discriminator for `config`, drawing weights from `rng`.
    pub fn new<R: Rng>(config: &GanConfig, rng: &mut R, device: &Device) -> Result<Self> {
        let var_map = VarMap::new();
        let hidden = config.model.discriminator_hidden;
        let std = config.model.init_std;
        let dims = [config.image.pixels(), hidden * 2, hidden, 1];
        let layers = dims
            .windows(2)
            .enumerate()
            .map(|(i, pair)| {
                seeded_linear(&var_map, &format!("disc.fc{i}"), pair[0], pair[1], std, &mut *rng, device)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            var_map,
            layers,
            image: config.image,
            slope: config.model.leaky_slope,
        })
    }

    /// Evaluate `images`, optionally through a gradient-blocking view.
    pub fn discriminate(&self, images: &Tensor, flow: GradientFlow) -> Result<Tensor> {
        match flow {
            GradientFlow::Blocked => self.forward(&images.detach()),
            GradientFlow::Tracked => self.forward(images),
        }
    }
}

impl Network for Discriminator {
    fn forward(&self, images: &Tensor) -> Result<Tensor> {
        let dims = images.dims();
        let ImageSettings {
            channels,
            height,
            width,
        } = self.image;
        if dims.len() != 4 || dims[1..] != [channels, height, width] {
            return Err(GanError::shape_mismatch(
                format!("[B, {channels}, {height}, {width}]"),
                format!("{dims:?}"),
            ));
        }

        let last = self.layers.len() - 1;
        let mut xs = images.flatten_from(1)?;
        for (i, layer) in self.layers.iter().enumerate() {
            xs = layer.forward(&xs)?;
            if i != last {
                xs = leaky_relu(&xs, self.slope)?;
            }
        }
        Ok(xs)
    }

    fn var_map(&self) -> &VarMap {
        &self.var_map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn small_config() -> GanConfig {
        let mut config = GanConfig::default();
        config.latent_dim = 8;
        config.image = ImageSettings {
            channels: 1,
            height: 4,
            width: 4,
        };
        config.model.generator_hidden = 6;
        config.model.discriminator_hidden = 5;
        config
    }

    #[test]
    fn test_generator_output_shape() {
        let config = small_config();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let generator = Generator::new(&config, &mut rng, &Device::Cpu).unwrap();

        let noise = Tensor::zeros((3, 8), DType::F32, &Device::Cpu).unwrap();
        let images = generator.forward(&noise).unwrap();
        assert_eq!(images.dims(), &[3, 1, 4, 4]);
    }

    #[test]
    fn test_generator_rejects_wrong_latent() {
        let config = small_config();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let generator = Generator::new(&config, &mut rng, &Device::Cpu).unwrap();

        let noise = Tensor::zeros((3, 9), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            generator.forward(&noise),
            Err(GanError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_discriminator_output_shape_and_validation() {
        let config = small_config();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let disc = Discriminator::new(&config, &mut rng, &Device::Cpu).unwrap();

        let images = Tensor::zeros((2, 1, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let logits = disc.discriminate(&images, GradientFlow::Tracked).unwrap();
        assert_eq!(logits.dims(), &[2, 1]);

        let wrong = Tensor::zeros((2, 3, 4, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            disc.forward(&wrong),
            Err(GanError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_same_seed_same_weights() {
        let config = small_config();
        let a = Generator::new(&config, &mut ChaCha8Rng::seed_from_u64(9), &Device::Cpu).unwrap();
        let b = Generator::new(&config, &mut ChaCha8Rng::seed_from_u64(9), &Device::Cpu).unwrap();
        assert_eq!(a.export_parameters().unwrap(), b.export_parameters().unwrap());
    }

    #[test]
    fn test_blocked_flow_stops_generator_gradient() {
        let config = small_config();
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let generator = Generator::new(&config, &mut rng, &Device::Cpu).unwrap();
        let disc = Discriminator::new(&config, &mut rng, &Device::Cpu).unwrap();
        let noise = Tensor::ones((2, 8), DType::F32, &Device::Cpu).unwrap();
        let fake = generator.forward(&noise).unwrap();
        let gen_vars = generator.named_vars().unwrap();
        let disc_vars = disc.named_vars().unwrap();

        let blocked = disc
            .discriminate(&fake, GradientFlow::Blocked)
            .unwrap()
            .sum_all()
            .unwrap()
            .backward()
            .unwrap();
        assert!(gen_vars.iter().all(|(_, v)| blocked.get(v.as_tensor()).is_none()));
        assert!(disc_vars.iter().any(|(_, v)| blocked.get(v.as_tensor()).is_some()));

        let tracked = disc
            .discriminate(&fake, GradientFlow::Tracked)
            .unwrap()
            .sum_all()
            .unwrap()
            .backward()
            .unwrap();
        assert!(gen_vars.iter().any(|(_, v)| tracked.get(v.as_tensor()).is_some()));
    }

    #[test]
    fn test_parameter_blob_roundtrip() {
        let config = small_config();
        let source = Discriminator::new(&config, &mut ChaCha8Rng::seed_from_u64(3), &Device::Cpu)
            .unwrap();
        let target = Discriminator::new(&config, &mut ChaCha8Rng::seed_from_u64(4), &Device::Cpu)
            .unwrap();
        assert_ne!(
            source.export_parameters().unwrap(),
            target.export_parameters().unwrap()
        );

        target
            .import_parameters(&source.export_parameters().unwrap())
            .unwrap();
        assert_eq!(
            source.export_parameters().unwrap(),
            target.export_parameters().unwrap()
        );
    }

    #[test]
    fn test_import_rejects_foreign_blob() {
        let config = small_config();
        let generator =
            Generator::new(&config, &mut ChaCha8Rng::seed_from_u64(5), &Device::Cpu).unwrap();
        let disc =
            Discriminator::new(&config, &mut ChaCha8Rng::seed_from_u64(6), &Device::Cpu).unwrap();
        let blob = generator.export_parameters().unwrap();
        assert!(disc.import_parameters(&blob).is_err());
    }

    #[test]
    fn test_parameter_count() {
        let config = small_config();
        let disc =
            Discriminator::new(&config, &mut ChaCha8Rng::seed_from_u64(7), &Device::Cpu).unwrap();
        // 16 -> 10 -> 5 -> 1
        let expected = (16 * 10 + 10) + (10 * 5 + 5) + (5 + 1);
        assert_eq!(disc.parameter_count().unwrap(), expected);
    }
}
