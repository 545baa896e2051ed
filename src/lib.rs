//! # dcgan-rs
//!
//! Adversarial training orchestration for DCGAN-style image models on
//! candle.
//!
//! A generator and a discriminator are optimised in alternation over a
//! dataset of images, with a checkpoint at every epoch boundary, running
//! loss averages, and periodic scalar and sample-image telemetry.
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Write a sample configuration
//! dcgan init dcgan.yaml
//!
//! # Validate it
//! dcgan validate dcgan.yaml
//!
//! # Train (Ctrl-C stops cleanly and keeps the last epoch checkpoint)
//! dcgan train dcgan.yaml
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use candle_core::Device;
//! use dcgan_rs::data::ImageFolder;
//! use dcgan_rs::telemetry::SummaryWriter;
//! use dcgan_rs::{AdversarialTrainer, GanConfig};
//!
//! # fn main() -> dcgan_rs::Result<()> {
//! let mut config = GanConfig::from_file("dcgan.yaml")?;
//! config.seed = Some(dcgan_rs::trainer::resolve_seed(config.seed));
//! let seed = config.seed.unwrap_or_default();
//!
//! let data = ImageFolder::open("./data/celeba", config.image, config.batch_size, seed, Device::Cpu)?;
//! let telemetry = SummaryWriter::create(&config.summary_dir)?;
//!
//! let mut trainer = AdversarialTrainer::new(config, data, telemetry)?;
//! trainer.run()?;
//! trainer.finalize()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Custom collaborators
//!
//! Any [`data::DataSource`] and [`telemetry::TelemetrySink`] can drive the
//! trainer. [`data::TensorDataset`] and [`telemetry::InMemoryTelemetry`]
//! keep everything in memory:
//!
//! ```rust
//! use candle_core::Device;
//! use dcgan_rs::config::ImageSettings;
//! use dcgan_rs::data::TensorDataset;
//! use dcgan_rs::telemetry::InMemoryTelemetry;
//! use dcgan_rs::{AdversarialTrainer, GanConfig};
//!
//! # fn main() -> dcgan_rs::Result<()> {
//! let dir = tempfile::tempdir()?;
//! let config = GanConfig {
//!     batch_size: 2,
//!     latent_dim: 4,
//!     max_epoch: 1,
//!     seed: Some(1),
//!     progress_bar: false,
//!     image: ImageSettings { channels: 1, height: 2, width: 2 },
//!     checkpoint_dir: dir.path().join("ckpt"),
//!     summary_dir: dir.path().join("summaries"),
//!     ..GanConfig::default()
//! };
//! let data = TensorDataset::synthetic(config.image, 2, 3, 0, &Device::Cpu)?;
//!
//! let mut trainer = AdversarialTrainer::new(config, data, InMemoryTelemetry::new())?;
//! trainer.run()?;
//! assert_eq!(trainer.current_iteration(), 3);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod gradient;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod telemetry;
pub mod trainer;

pub use checkpoint::{CheckpointStore, TrainingState};
pub use config::GanConfig;
pub use error::{GanError, Result};
pub use trainer::{AdversarialTrainer, CancellationToken, RunOutcome, StepOutput};
