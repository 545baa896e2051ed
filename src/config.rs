//! Configuration parsing and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::checkpoint::BEST_CHECKPOINT_NAME;
use crate::error::{GanError, Result};

/// Main configuration for a DCGAN training run.
///
/// # Example
///
/// ```rust
/// use dcgan_rs::GanConfig;
///
/// # fn main() -> dcgan_rs::Result<()> {
/// let yaml = r#"
/// batch_size: 16
/// latent_dim: 32
/// max_epoch: 5
/// data_dir: ./data/faces
/// "#;
/// let config = GanConfig::from_yaml(yaml)?;
/// config.validate()?;
/// assert_eq!(config.learning_rate, 2e-4);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GanConfig {
    /// Experiment name, used in log lines.
    #[serde(default = "default_exp_name")]
    pub exp_name: String,

    /// Images per batch. Also the number of fixed evaluation samples.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Adam learning rate shared by both networks.
    #[serde(default = "default_lr")]
    pub learning_rate: f64,

    /// Adam first-moment decay.
    #[serde(default = "default_beta1")]
    pub beta1: f64,

    /// Adam second-moment decay.
    #[serde(default = "default_beta2")]
    pub beta2: f64,

    /// Dimensionality of the generator's latent input.
    #[serde(default = "default_latent_dim")]
    pub latent_dim: usize,

    /// Exclusive upper bound on the epoch index.
    #[serde(default = "default_max_epoch")]
    pub max_epoch: usize,

    /// Directory holding checkpoints.
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,

    /// File name of the rolling checkpoint inside `checkpoint_dir`.
    #[serde(default = "default_checkpoint_file")]
    pub checkpoint_file: String,

    /// Directory receiving telemetry (scalars, sample grids).
    #[serde(default = "default_summary_dir")]
    pub summary_dir: PathBuf,

    /// Directory of training images. Required for `dcgan train` unless a
    /// synthetic dataset is requested.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Random seed. A random one is drawn (and logged) when absent.
    #[serde(default)]
    pub seed: Option<u64>,

    /// Train on CUDA when available.
    #[serde(default)]
    pub cuda: bool,

    /// Emit telemetry every N steps within an epoch.
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,

    /// Show a progress bar on stderr.
    #[serde(default = "default_true")]
    pub progress_bar: bool,

    /// Image geometry.
    #[serde(default)]
    pub image: ImageSettings,

    /// Network sizes.
    #[serde(default)]
    pub model: ModelSettings,
}

fn default_exp_name() -> String {
    "dcgan".into()
}
fn default_batch_size() -> usize {
    64
}
fn default_lr() -> f64 {
    2e-4
}
fn default_beta1() -> f64 {
    0.5
}
fn default_beta2() -> f64 {
    0.999
}
fn default_latent_dim() -> usize {
    100
}
fn default_max_epoch() -> usize {
    25
}
fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("./experiments/dcgan/checkpoints")
}
fn default_checkpoint_file() -> String {
    "checkpoint.bin".into()
}
fn default_summary_dir() -> PathBuf {
    PathBuf::from("./experiments/dcgan/summaries")
}
fn default_log_interval() -> usize {
    100
}
fn default_true() -> bool {
    true
}

impl Default for GanConfig {
    fn default() -> Self {
        Self {
            exp_name: default_exp_name(),
            batch_size: default_batch_size(),
            learning_rate: default_lr(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            latent_dim: default_latent_dim(),
            max_epoch: default_max_epoch(),
            checkpoint_dir: default_checkpoint_dir(),
            checkpoint_file: default_checkpoint_file(),
            summary_dir: default_summary_dir(),
            data_dir: None,
            seed: None,
            cuda: false,
            log_interval: default_log_interval(),
            progress_bar: true,
            image: ImageSettings::default(),
            model: ModelSettings::default(),
        }
    }
}

/// Geometry of the images the networks consume and produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSettings {
    /// Colour channels (1 = grayscale, 3 = RGB).
    #[serde(default = "default_channels")]
    pub channels: usize,
    /// Height in pixels.
    #[serde(default = "default_image_side")]
    pub height: usize,
    /// Width in pixels.
    #[serde(default = "default_image_side")]
    pub width: usize,
}

fn default_channels() -> usize {
    3
}
fn default_image_side() -> usize {
    64
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            channels: default_channels(),
            height: default_image_side(),
            width: default_image_side(),
        }
    }
}

impl ImageSettings {
    /// Number of scalar values in one image.
    #[must_use]
    pub fn pixels(&self) -> usize {
        self.channels * self.height * self.width
    }
}

/// Hidden sizes and initialisation of the two networks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Hidden width of the generator MLP.
    #[serde(default = "default_hidden")]
    pub generator_hidden: usize,
    /// Hidden width of the discriminator MLP.
    #[serde(default = "default_hidden")]
    pub discriminator_hidden: usize,
    /// Negative slope of the discriminator's leaky ReLU.
    #[serde(default = "default_leaky_slope")]
    pub leaky_slope: f64,
    /// Standard deviation of the normal weight initialisation.
    #[serde(default = "default_init_std")]
    pub init_std: f64,
}

fn default_hidden() -> usize {
    256
}
fn default_leaky_slope() -> f64 {
    0.2
}
fn default_init_std() -> f64 {
    0.02
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            generator_hidden: default_hidden(),
            discriminator_hidden: default_hidden(),
            leaky_slope: default_leaky_slope(),
            init_std: default_init_std(),
        }
    }
}

impl GanConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Full path of the rolling checkpoint.
    #[must_use]
    pub fn checkpoint_path(&self) -> PathBuf {
        self.checkpoint_dir.join(&self.checkpoint_file)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`GanError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(GanError::config("batch_size must be > 0"));
        }
        if self.latent_dim == 0 {
            return Err(GanError::config("latent_dim must be > 0"));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(GanError::config("learning_rate must be a positive number"));
        }
        for (name, beta) in [("beta1", self.beta1), ("beta2", self.beta2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(GanError::config(format!("{name} must be in [0, 1)")));
            }
        }
        if self.log_interval == 0 {
            return Err(GanError::config("log_interval must be > 0"));
        }
        if self.checkpoint_file.is_empty() {
            return Err(GanError::config("checkpoint_file is required"));
        }
        if self.checkpoint_file == BEST_CHECKPOINT_NAME {
            return Err(GanError::config(format!(
                "checkpoint_file may not be the reserved name {BEST_CHECKPOINT_NAME}"
            )));
        }
        if !matches!(self.image.channels, 1 | 3) {
            return Err(GanError::config("image.channels must be 1 or 3"));
        }
        if self.image.height == 0 || self.image.width == 0 {
            return Err(GanError::config("image.height and image.width must be > 0"));
        }
        if self.model.generator_hidden == 0 || self.model.discriminator_hidden == 0 {
            return Err(GanError::config("model hidden sizes must be > 0"));
        }
        if !(self.model.init_std.is_finite() && self.model.init_std > 0.0) {
            return Err(GanError::config("model.init_std must be a positive number"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = GanConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_size, 64);
        assert_eq!(config.latent_dim, 100);
        assert_eq!(config.log_interval, 100);
        assert_eq!(config.beta1, 0.5);
        assert_eq!(config.checkpoint_file, "checkpoint.bin");
    }

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let config = GanConfig::from_yaml("max_epoch: 3\n").unwrap();
        assert_eq!(config.max_epoch, 3);
        assert_eq!(config.batch_size, 64);
        assert_eq!(config.image, ImageSettings::default());
        assert!(config.seed.is_none());
    }

    #[test]
    fn test_yaml_overrides() {
        let yaml = r#"
exp_name: faces
batch_size: 8
latent_dim: 16
seed: 7
cuda: true
image:
  channels: 1
  height: 28
  width: 28
model:
  generator_hidden: 32
"#;
        let config = GanConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.exp_name, "faces");
        assert_eq!(config.seed, Some(7));
        assert!(config.cuda);
        assert_eq!(config.image.pixels(), 28 * 28);
        assert_eq!(config.model.generator_hidden, 32);
        assert_eq!(config.model.discriminator_hidden, 256);
    }

    #[test]
    fn test_validation_rejects_bad_fields() {
        let cases: [(fn(&mut GanConfig), &str); 11] = [
            (|c| c.batch_size = 0, "batch_size"),
            (|c| c.latent_dim = 0, "latent_dim"),
            (|c| c.learning_rate = 0.0, "learning_rate"),
            (|c| c.beta1 = 1.0, "beta1"),
            (|c| c.beta2 = -0.1, "beta2"),
            (|c| c.log_interval = 0, "log_interval"),
            (|c| c.checkpoint_file = String::new(), "checkpoint_file"),
            (|c| c.checkpoint_file = BEST_CHECKPOINT_NAME.into(), "reserved"),
            (|c| c.image.channels = 2, "channels"),
            (|c| c.image.width = 0, "width"),
            (|c| c.model.discriminator_hidden = 0, "hidden"),
        ];

        for (mutate, needle) in cases {
            let mut config = GanConfig::default();
            mutate(&mut config);
            let err = config.validate().unwrap_err();
            assert!(
                err.to_string().contains(needle),
                "expected '{needle}' in '{err}'"
            );
        }
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let mut config = GanConfig::default();
        config.seed = Some(1234);
        config.data_dir = Some(PathBuf::from("/data/celeba"));
        config.to_file(&path).unwrap();

        let loaded = GanConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_checkpoint_path_joins_dir_and_file() {
        let config = GanConfig {
            checkpoint_dir: PathBuf::from("/tmp/ckpt"),
            checkpoint_file: "run.bin".into(),
            ..GanConfig::default()
        };
        assert_eq!(config.checkpoint_path(), PathBuf::from("/tmp/ckpt/run.bin"));
    }
}
