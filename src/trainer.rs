//! Adversarial training loop.
//!
//! [`AdversarialTrainer`] owns both networks, their optimizers and
//! gradient buffers, the data source and the telemetry sink. One step
//! updates the discriminator on a real and a generated batch, then the
//! generator through the freshly updated discriminator. Every completed
//! epoch is checkpointed; a checkpoint found at construction is resumed.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use indicatif::{ProgressBar, ProgressStyle};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::checkpoint::{CheckpointStore, TrainingState};
use crate::config::{GanConfig, ImageSettings};
use crate::data::DataSource;
use crate::error::{GanError, Result};
use crate::gradient::GradientBuffer;
use crate::loss::{bce_with_logits, mean_probability, FAKE_LABEL, REAL_LABEL};
use crate::metrics::MetricAggregator;
use crate::model::{Discriminator, Generator, GradientFlow, Network};
use crate::optimizer::{Adam, OptimizerConfig};
use crate::telemetry::TelemetrySink;

/// Scalar series emitted at every log interval.
pub const GENERATOR_LOSS_SERIES: &str = "epoch/generator_loss";
/// Scalar series emitted at every log interval.
pub const DISCRIMINATOR_LOSS_SERIES: &str = "epoch/discriminator_loss";

/// Cooperative stop request shared between the trainer and a signal
/// handler.
///
/// ```
/// use dcgan_rs::CancellationToken;
///
/// let token = CancellationToken::new();
/// let handle = token.clone();
/// handle.cancel();
/// assert!(token.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop. The trainer reacts before its next step.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// True once [`CancellationToken::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Losses and discriminator diagnostics of one step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutput {
    /// BCE of the discriminator on the real batch.
    pub discriminator_loss_real: f32,
    /// BCE of the discriminator on the generated batch.
    pub discriminator_loss_fake: f32,
    /// `discriminator_loss_real + discriminator_loss_fake`.
    pub discriminator_loss: f32,
    /// BCE of the generator against the "real" label.
    pub generator_loss: f32,
    /// Mean discriminator probability on the real batch.
    pub d_real_mean: f32,
    /// Mean discriminator probability on the generated batch, before the
    /// discriminator update.
    pub d_fake_mean: f32,
    /// Mean discriminator probability on the generated batch, after the
    /// discriminator update.
    pub d_generator_mean: f32,
}

/// Result of the discriminator half of a step.
#[derive(Debug, Clone)]
pub struct DiscriminatorStep {
    /// Generated batch, still attached to the generator's graph.
    pub fake: Tensor,
    /// BCE on the real batch.
    pub loss_real: f32,
    /// BCE on the generated batch.
    pub loss_fake: f32,
    /// Mean probability on the real batch.
    pub real_mean: f32,
    /// Mean probability on the generated batch.
    pub fake_mean: f32,
}

/// Result of the generator half of a step.
#[derive(Debug, Clone, Copy)]
pub struct GeneratorStep {
    /// BCE against the "real" label.
    pub loss: f32,
    /// Mean probability of the updated discriminator on the generated batch.
    pub mean: f32,
}

/// How a call to [`AdversarialTrainer::run`] or
/// [`AdversarialTrainer::train_one_epoch`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every requested step ran.
    Completed,
    /// A [`CancellationToken`] stopped training between steps.
    Cancelled,
}

/// Pick the training device.
pub fn select_device(use_cuda: bool) -> Device {
    if use_cuda {
        match Device::cuda_if_available(0) {
            Ok(device @ Device::Cuda(_)) => {
                tracing::info!("Program will run on GPU (CUDA device 0)");
                device
            }
            Ok(_) => {
                tracing::warn!("CUDA requested but not available; running on CPU");
                Device::Cpu
            }
            Err(err) => {
                tracing::warn!("CUDA init failed ({err}); running on CPU");
                Device::Cpu
            }
        }
    } else {
        if candle_core::utils::cuda_is_available() {
            tracing::warn!("A CUDA device is available; set `cuda: true` to use it");
        }
        tracing::info!("Program will run on CPU");
        Device::Cpu
    }
}

/// Configured seed, or a random one in `1..=10000`.
pub fn resolve_seed(seed: Option<u64>) -> u64 {
    match seed {
        Some(seed) => seed,
        None => {
            let seed = rand::thread_rng().gen_range(1..=10_000);
            tracing::info!("No seed configured, using random seed {seed}");
            seed
        }
    }
}

fn sample_normal<R: Rng>(
    rng: &mut R,
    batch: usize,
    latent_dim: usize,
    device: &Device,
) -> Result<Tensor> {
    let values: Vec<f32> = (0..batch * latent_dim)
        .map(|_| rng.sample(StandardNormal))
        .collect();
    Ok(Tensor::from_vec(values, (batch, latent_dim), device)?)
}

fn scalar(loss: &Tensor) -> Result<f32> {
    Ok(loss.to_dtype(DType::F32)?.to_scalar::<f32>()?)
}

/// Freshly initialised networks, optimizers and RNG for a seed.
struct Components {
    rng: ChaCha8Rng,
    generator: Generator,
    discriminator: Discriminator,
    gen_optimizer: Adam,
    disc_optimizer: Adam,
    fixed_noise: Tensor,
}

impl Components {
    fn build(config: &GanConfig, seed: u64, device: &Device) -> Result<Self> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let generator = Generator::new(config, &mut rng, device)?;
        let discriminator = Discriminator::new(config, &mut rng, device)?;
        let fixed_noise = sample_normal(&mut rng, config.batch_size, config.latent_dim, device)?;
        let optimizer = OptimizerConfig::from(config);
        Ok(Self {
            rng,
            generator,
            discriminator,
            gen_optimizer: Adam::new(optimizer),
            disc_optimizer: Adam::new(optimizer),
            fixed_noise,
        })
    }
}

/// Adversarial training orchestrator.
///
/// # Example
///
/// ```no_run
/// use dcgan_rs::data::TensorDataset;
/// use dcgan_rs::telemetry::SummaryWriter;
/// use dcgan_rs::{AdversarialTrainer, GanConfig};
/// use candle_core::Device;
///
/// # fn main() -> dcgan_rs::Result<()> {
/// let config = GanConfig::from_file("configs/dcgan.yaml")?;
/// let data = TensorDataset::synthetic(config.image, config.batch_size, 10, 1, &Device::Cpu)?;
/// let telemetry = SummaryWriter::create(&config.summary_dir)?;
///
/// let mut trainer = AdversarialTrainer::new(config, data, telemetry)?;
/// trainer.run()?;
/// trainer.finalize()?;
/// # Ok(())
/// # }
/// ```
pub struct AdversarialTrainer<D: DataSource, T: TelemetrySink> {
    config: GanConfig,
    device: Device,
    seed: u64,
    rng: ChaCha8Rng,
    generator: Generator,
    discriminator: Discriminator,
    gen_optimizer: Adam,
    disc_optimizer: Adam,
    gen_grads: GradientBuffer,
    disc_grads: GradientBuffer,
    /// Evaluation noise, sampled once
    fixed_noise: Tensor,
    data: D,
    telemetry: T,
    checkpoints: CheckpointStore,
    cancel: CancellationToken,
    /// 0-based index of the next epoch to run
    current_epoch: usize,
    /// Completed steps over the whole run, including resumed ones
    current_iteration: usize,
    run_metrics: MetricAggregator,
    loss_records: Vec<StepOutput>,
    resumed: bool,
    /// Set when an epoch stopped early; its state must not be persisted
    partial_epoch: bool,
    finalized: bool,
}

impl<D: DataSource, T: TelemetrySink> AdversarialTrainer<D, T> {
    /// Build networks and optimizers, then resume from the configured
    /// checkpoint if one is readable.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: GanConfig, data: D, telemetry: T) -> Result<Self> {
        config.validate()?;
        let device = select_device(config.cuda);
        let seed = resolve_seed(config.seed);
        let Components {
            rng,
            generator,
            discriminator,
            gen_optimizer,
            disc_optimizer,
            fixed_noise,
        } = Components::build(&config, seed, &device)?;
        let checkpoints = CheckpointStore::new(&config.checkpoint_dir);

        tracing::info!(
            "Experiment '{}': seed {seed}, generator {} params, discriminator {} params",
            config.exp_name,
            generator.parameter_count()?,
            discriminator.parameter_count()?
        );

        let mut trainer = Self {
            config,
            device,
            seed,
            rng,
            generator,
            discriminator,
            gen_optimizer,
            disc_optimizer,
            gen_grads: GradientBuffer::new(),
            disc_grads: GradientBuffer::new(),
            fixed_noise,
            data,
            telemetry,
            checkpoints,
            cancel: CancellationToken::new(),
            current_epoch: 0,
            current_iteration: 0,
            run_metrics: MetricAggregator::new(),
            loss_records: Vec::new(),
            resumed: false,
            partial_epoch: false,
            finalized: false,
        };
        trainer.load_checkpoint()?;
        Ok(trainer)
    }

    fn load_checkpoint(&mut self) -> Result<()> {
        let name = self.config.checkpoint_file.clone();
        let path = self.checkpoints.path(&name);
        tracing::info!("Loading checkpoint '{}'", path.display());

        let Some(state) = self.checkpoints.load(&name) else {
            tracing::info!(
                "No checkpoint exists in '{}', training from scratch",
                self.checkpoints.dir().display()
            );
            return Ok(());
        };

        match self.restore(&state) {
            Ok(()) => {
                self.resumed = true;
                tracing::info!(
                    "Resumed from checkpoint '{}' at epoch {} (iteration {})",
                    path.display(),
                    state.epoch,
                    state.iteration
                );
            }
            Err(e) => {
                tracing::warn!(
                    "Checkpoint '{}' does not match this model ({e}); training from scratch",
                    path.display()
                );
                let fresh = Components::build(&self.config, self.seed, &self.device)?;
                self.rng = fresh.rng;
                self.generator = fresh.generator;
                self.discriminator = fresh.discriminator;
                self.gen_optimizer = fresh.gen_optimizer;
                self.disc_optimizer = fresh.disc_optimizer;
                self.fixed_noise = fresh.fixed_noise;
                self.current_epoch = 0;
                self.current_iteration = 0;
            }
        }
        Ok(())
    }

    /// Replace the cancellation token, typically with one wired to Ctrl-C.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Handle that stops this trainer when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Train from `current_epoch` up to `max_epoch` (exclusive).
    ///
    /// Cancellation is not an error: the trainer logs a notice and returns
    /// [`RunOutcome::Cancelled`]. Call [`AdversarialTrainer::finalize`]
    /// afterwards in every case, including after an error. An epoch that
    /// ends early is never written to the checkpoint.
    pub fn run(&mut self) -> Result<RunOutcome> {
        tracing::info!(
            "Training epochs {}..{} on {:?}",
            self.current_epoch,
            self.config.max_epoch,
            self.device
        );
        while self.current_epoch < self.config.max_epoch {
            if self.train_one_epoch()? == RunOutcome::Cancelled {
                tracing::warn!("Training cancelled, wait to finalize");
                return Ok(RunOutcome::Cancelled);
            }
        }
        Ok(RunOutcome::Completed)
    }

    /// Run `num_iterations` steps, then advance the epoch counter and save
    /// a checkpoint.
    ///
    /// # Errors
    ///
    /// A data source that runs dry early, a malformed batch or a non-finite
    /// loss ends the epoch with an error and marks it partial, so
    /// [`AdversarialTrainer::finalize`] will not save it.
    pub fn train_one_epoch(&mut self) -> Result<RunOutcome> {
        let epoch = self.current_epoch;
        self.data.start_epoch()?;
        let num_iterations = self.data.num_iterations();
        let pb = self.progress_bar(epoch, num_iterations)?;
        let mut epoch_metrics = MetricAggregator::new();
        let mut last: Option<StepOutput> = None;

        for index in 0..num_iterations {
            if self.cancel.is_cancelled() {
                pb.abandon_with_message("cancelled");
                self.partial_epoch = true;
                tracing::warn!(
                    "Interrupted at epoch {epoch}, step {index}/{num_iterations}; \
                     in-progress epoch discarded"
                );
                return Ok(RunOutcome::Cancelled);
            }

            match self.epoch_step(index, num_iterations, &pb, &mut epoch_metrics) {
                Ok(output) => last = Some(output),
                Err(e) => {
                    pb.abandon_with_message("failed");
                    self.partial_epoch = true;
                    tracing::error!("Epoch {epoch} failed at step {index}/{num_iterations}: {e}");
                    return Err(e);
                }
            }
        }
        pb.finish_and_clear();

        if let Some(last) = last {
            tracing::info!(
                "Training at epoch-{epoch} | Discriminator loss: {:.4} (avg {:.4}) - \
                 Generator loss: {:.4} (avg {:.4}) - D(x): {:.4} - D(G(z)): {:.4} / {:.4}",
                last.discriminator_loss,
                epoch_metrics.avg("discriminator_loss").unwrap_or_default(),
                last.generator_loss,
                epoch_metrics.avg("generator_loss").unwrap_or_default(),
                last.d_real_mean,
                last.d_fake_mean,
                last.d_generator_mean
            );
        } else {
            tracing::warn!("Epoch {epoch} ran no steps: the data source is empty");
        }

        self.current_epoch += 1;
        self.save_checkpoint(false)?;
        Ok(RunOutcome::Completed)
    }

    fn epoch_step(
        &mut self,
        index: usize,
        num_iterations: usize,
        pb: &ProgressBar,
        epoch_metrics: &mut MetricAggregator,
    ) -> Result<StepOutput> {
        let real = self.data.next_batch()?.ok_or_else(|| {
            GanError::data(format!(
                "data source ended after {index} of {num_iterations} batches"
            ))
        })?;
        let output = self.train_step(&real)?;
        self.current_iteration += 1;

        for metrics in [&mut *epoch_metrics, &mut self.run_metrics] {
            metrics.update("discriminator_loss", f64::from(output.discriminator_loss));
            metrics.update("generator_loss", f64::from(output.generator_loss));
            metrics.update("d_real_mean", f64::from(output.d_real_mean));
            metrics.update("d_fake_mean", f64::from(output.d_fake_mean));
            metrics.update("d_generator_mean", f64::from(output.d_generator_mean));
        }
        self.loss_records.push(output);

        pb.set_message(progress_message(&output, epoch_metrics));
        pb.inc(1);

        if index % self.config.log_interval == 0 {
            self.emit_telemetry(index, &real, epoch_metrics)?;
        }
        Ok(output)
    }

    /// One full adversarial step on `real`.
    pub fn train_step(&mut self, real: &Tensor) -> Result<StepOutput> {
        let real = real.to_device(&self.device)?.to_dtype(DType::F32)?;
        self.check_batch(&real)?;
        let noise = self.sample_noise(real.dim(0)?)?;

        let disc = self.discriminator_step(&real, &noise)?;
        let gen = self.generator_step(&disc.fake)?;

        let output = StepOutput {
            discriminator_loss_real: disc.loss_real,
            discriminator_loss_fake: disc.loss_fake,
            discriminator_loss: disc.loss_real + disc.loss_fake,
            generator_loss: gen.loss,
            d_real_mean: disc.real_mean,
            d_fake_mean: disc.fake_mean,
            d_generator_mean: gen.mean,
        };
        for (loss, value) in [
            ("discriminator", output.discriminator_loss),
            ("generator", output.generator_loss),
        ] {
            if !value.is_finite() {
                return Err(GanError::NonFiniteLoss {
                    loss,
                    value,
                    iteration: self.current_iteration,
                });
            }
        }
        Ok(output)
    }

    /// Update the discriminator on `real` and on the generator's output for
    /// `noise`. Both passes accumulate into one buffer before a single
    /// optimizer step; the generator receives no gradient.
    pub fn discriminator_step(&mut self, real: &Tensor, noise: &Tensor) -> Result<DiscriminatorStep> {
        let vars = self.discriminator.named_vars()?;
        self.disc_grads.zero();

        let real_logits = self.discriminator.discriminate(real, GradientFlow::Tracked)?;
        let loss_real = bce_with_logits(&real_logits, REAL_LABEL)?;
        self.disc_grads.accumulate(&loss_real.backward()?, &vars)?;

        let fake = self.generator.forward(noise)?;
        let fake_logits = self.discriminator.discriminate(&fake, GradientFlow::Blocked)?;
        let loss_fake = bce_with_logits(&fake_logits, FAKE_LABEL)?;
        self.disc_grads.accumulate(&loss_fake.backward()?, &vars)?;

        self.disc_optimizer.step(&vars, &self.disc_grads)?;

        Ok(DiscriminatorStep {
            loss_real: scalar(&loss_real)?,
            loss_fake: scalar(&loss_fake)?,
            real_mean: mean_probability(&real_logits)?,
            fake_mean: mean_probability(&fake_logits)?,
            fake,
        })
    }

    /// Update the generator so the discriminator labels `fake` as real.
    pub fn generator_step(&mut self, fake: &Tensor) -> Result<GeneratorStep> {
        let vars = self.generator.named_vars()?;
        self.gen_grads.zero();

        let logits = self.discriminator.discriminate(fake, GradientFlow::Tracked)?;
        let loss = bce_with_logits(&logits, REAL_LABEL)?;
        self.gen_grads.accumulate(&loss.backward()?, &vars)?;

        self.gen_optimizer.step(&vars, &self.gen_grads)?;

        Ok(GeneratorStep {
            loss: scalar(&loss)?,
            mean: mean_probability(&logits)?,
        })
    }

    /// Fresh standard-normal noise `(batch, latent_dim)` from the trainer's
    /// RNG.
    pub fn sample_noise(&mut self, batch: usize) -> Result<Tensor> {
        sample_normal(&mut self.rng, batch, self.config.latent_dim, &self.device)
    }

    fn check_batch(&self, batch: &Tensor) -> Result<()> {
        let ImageSettings {
            channels,
            height,
            width,
        } = self.config.image;
        let dims = batch.dims();
        if dims.len() != 4 || dims[0] == 0 || dims[1..] != [channels, height, width] {
            return Err(GanError::shape_mismatch(
                format!("[B, {channels}, {height}, {width}]"),
                format!("{dims:?}"),
            ));
        }
        Ok(())
    }

    fn emit_telemetry(
        &mut self,
        index: usize,
        real: &Tensor,
        epoch_metrics: &MetricAggregator,
    ) -> Result<()> {
        let step = self.current_iteration;
        for (series, metric) in [
            (GENERATOR_LOSS_SERIES, "generator_loss"),
            (DISCRIMINATOR_LOSS_SERIES, "discriminator_loss"),
            ("epoch/d_real_mean", "d_real_mean"),
            ("epoch/d_fake_mean", "d_fake_mean"),
            ("epoch/d_generator_mean", "d_generator_mean"),
        ] {
            if let Some(value) = epoch_metrics.val(metric) {
                self.telemetry.emit_scalar(series, value, step);
            }
        }

        self.telemetry
            .emit_image(&format!("real_image_{index}"), real, step);
        let generated = self.generator.forward(&self.fixed_noise)?.detach();
        self.telemetry
            .emit_image(&format!("generated_image_{index}"), &generated, step);
        Ok(())
    }

    fn progress_bar(&self, epoch: usize, len: usize) -> Result<ProgressBar> {
        let pb = if self.config.progress_bar {
            ProgressBar::new(len as u64)
        } else {
            ProgressBar::hidden()
        };
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{prefix} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>5}/{len:5} {msg}")?
                .progress_chars("#>-"),
        );
        pb.set_prefix(format!("epoch-{epoch}-"));
        Ok(pb)
    }

    /// Capture the resumable state. The persisted epoch is
    /// `current_epoch + 1`.
    pub fn snapshot(&self) -> Result<TrainingState> {
        Ok(TrainingState {
            epoch: self.current_epoch as u64 + 1,
            iteration: self.current_iteration as u64,
            generator_parameters: self.generator.export_parameters()?,
            discriminator_parameters: self.discriminator.export_parameters()?,
            generator_optimizer_state: self.gen_optimizer.state_blob()?,
            discriminator_optimizer_state: self.disc_optimizer.state_blob()?,
        })
    }

    /// Overwrite parameters, optimizer state and counters from `state`.
    pub fn restore(&mut self, state: &TrainingState) -> Result<()> {
        self.generator.import_parameters(&state.generator_parameters)?;
        self.discriminator
            .import_parameters(&state.discriminator_parameters)?;
        self.gen_optimizer
            .load_state(&state.generator_optimizer_state, &self.device)?;
        self.disc_optimizer
            .load_state(&state.discriminator_optimizer_state, &self.device)?;
        self.current_epoch = usize::try_from(state.epoch.saturating_sub(1))
            .map_err(|_| GanError::checkpoint(format!("epoch {} out of range", state.epoch)))?;
        self.current_iteration = usize::try_from(state.iteration).map_err(|_| {
            GanError::checkpoint(format!("iteration {} out of range", state.iteration))
        })?;
        Ok(())
    }

    /// Write the rolling checkpoint, optionally also as the best one.
    pub fn save_checkpoint(&self, is_best: bool) -> Result<PathBuf> {
        let state = self.snapshot()?;
        self.checkpoints
            .save(&state, &self.config.checkpoint_file, is_best)
    }

    /// Save a final checkpoint, flush telemetry and close the data source.
    /// Later calls do nothing.
    ///
    /// After a cancellation or an error in the middle of an epoch the final
    /// save is skipped, leaving the last epoch-boundary checkpoint untouched.
    pub fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;
        tracing::info!("Finalizing, please wait");

        let saved = if self.partial_epoch {
            tracing::info!("Run stopped mid-epoch; keeping the last epoch checkpoint");
            Ok(())
        } else {
            self.save_checkpoint(false).map(|path| {
                tracing::info!("Final checkpoint written to {}", path.display());
            })
        };
        self.telemetry.finalize();
        let closed = self.data.finalize();
        saved.and(closed)
    }

    /// 0-based index of the next epoch to run.
    pub fn current_epoch(&self) -> usize {
        self.current_epoch
    }

    /// Completed steps, including those restored from a checkpoint.
    pub fn current_iteration(&self) -> usize {
        self.current_iteration
    }

    /// Seed driving initialisation and noise.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Training device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Configuration in use.
    pub fn config(&self) -> &GanConfig {
        &self.config
    }

    /// True when construction resumed from a checkpoint.
    pub fn was_resumed(&self) -> bool {
        self.resumed
    }

    /// Per-step losses recorded by this process.
    pub fn loss_records(&self) -> &[StepOutput] {
        &self.loss_records
    }

    /// Running averages over every step of this process.
    pub fn run_metrics(&self) -> &MetricAggregator {
        &self.run_metrics
    }

    /// Evaluation noise used for generated samples.
    pub fn fixed_noise(&self) -> &Tensor {
        &self.fixed_noise
    }

    /// Generator network.
    pub fn generator(&self) -> &Generator {
        &self.generator
    }

    /// Discriminator network.
    pub fn discriminator(&self) -> &Discriminator {
        &self.discriminator
    }

    /// Gradients the last discriminator update applied.
    pub fn discriminator_gradients(&self) -> &GradientBuffer {
        &self.disc_grads
    }

    /// Gradients the last generator update applied.
    pub fn generator_gradients(&self) -> &GradientBuffer {
        &self.gen_grads
    }

    /// Checkpoint store in use.
    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Telemetry sink.
    pub fn telemetry(&self) -> &T {
        &self.telemetry
    }

    /// Data source.
    pub fn data(&self) -> &D {
        &self.data
    }
}

/// Bar message: current D/G losses with their running epoch means.
fn progress_message(output: &StepOutput, epoch_metrics: &MetricAggregator) -> String {
    format!(
        "D {:.4} (avg {:.4}) G {:.4} (avg {:.4})",
        output.discriminator_loss,
        epoch_metrics.avg("discriminator_loss").unwrap_or_default(),
        output.generator_loss,
        epoch_metrics.avg("generator_loss").unwrap_or_default()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::TensorDataset;
    use crate::telemetry::InMemoryTelemetry;

    fn tiny_config(dir: &std::path::Path) -> GanConfig {
        let mut config = GanConfig::default();
        config.batch_size = 4;
        config.latent_dim = 8;
        config.max_epoch = 1;
        config.seed = Some(42);
        config.progress_bar = false;
        config.log_interval = 1;
        config.image = ImageSettings {
            channels: 1,
            height: 4,
            width: 4,
        };
        config.model.generator_hidden = 8;
        config.model.discriminator_hidden = 8;
        config.checkpoint_dir = dir.join("checkpoints");
        config.summary_dir = dir.join("summaries");
        config
    }

    fn trainer(
        config: &GanConfig,
        batches: usize,
    ) -> AdversarialTrainer<TensorDataset, InMemoryTelemetry> {
        let data =
            TensorDataset::synthetic(config.image, config.batch_size, batches, 7, &Device::Cpu)
                .unwrap();
        AdversarialTrainer::new(config.clone(), data, InMemoryTelemetry::new()).unwrap()
    }

    #[test]
    fn test_noise_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = trainer(&tiny_config(dir.path()), 1);
        assert_eq!(t.fixed_noise().dims(), &[4, 8]);
        assert_eq!(t.sample_noise(3).unwrap().dims(), &[3, 8]);
    }

    #[test]
    fn test_train_step_reports_finite_losses() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = trainer(&tiny_config(dir.path()), 1);
        let real = Tensor::ones((4, 1, 4, 4), DType::F32, &Device::Cpu).unwrap();

        let out = t.train_step(&real).unwrap();
        assert!(out.generator_loss.is_finite());
        assert!(
            (out.discriminator_loss - (out.discriminator_loss_real + out.discriminator_loss_fake))
                .abs()
                < 1e-6
        );
        for p in [out.d_real_mean, out.d_fake_mean, out.d_generator_mean] {
            assert!((0.0..=1.0).contains(&p));
        }
        assert_eq!(t.discriminator_gradients().passes(), 2);
        assert_eq!(t.generator_gradients().passes(), 1);
    }

    #[test]
    fn test_train_step_rejects_malformed_batch() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = trainer(&tiny_config(dir.path()), 1);
        let wrong = Tensor::ones((4, 3, 4, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            t.train_step(&wrong),
            Err(GanError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_non_finite_loss_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = trainer(&tiny_config(dir.path()), 1);
        let poisoned = Tensor::full(f32::NAN, (4, 1, 4, 4), &Device::Cpu).unwrap();
        match t.train_step(&poisoned) {
            Err(GanError::NonFiniteLoss { iteration, .. }) => assert_eq!(iteration, 0),
            other => panic!("expected NonFiniteLoss, got {other:?}"),
        }
    }

    #[test]
    fn test_telemetry_follows_log_interval() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = tiny_config(dir.path());
        config.log_interval = 2;
        let mut t = trainer(&config, 5);
        t.run().unwrap();

        // indices 0, 2, 4 -> iterations 1, 3, 5
        let steps: Vec<usize> = t
            .telemetry()
            .series(GENERATOR_LOSS_SERIES)
            .iter()
            .map(|(step, _)| *step)
            .collect();
        assert_eq!(steps, vec![1, 3, 5]);
        let names: Vec<&str> = t.telemetry().images.iter().map(|i| i.0.as_str()).collect();
        assert_eq!(names[..2], ["real_image_0", "generated_image_0"]);
        assert_eq!(t.telemetry().images[1].2, vec![4, 1, 4, 4]);
    }

    #[test]
    fn test_short_data_source_is_fatal() {
        struct Short(TensorDataset);
        impl DataSource for Short {
            fn num_iterations(&self) -> usize {
                self.0.num_iterations() + 1
            }
            fn start_epoch(&mut self) -> Result<()> {
                self.0.start_epoch()
            }
            fn next_batch(&mut self) -> Result<Option<Tensor>> {
                self.0.next_batch()
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let config = tiny_config(dir.path());
        let data = TensorDataset::synthetic(config.image, 4, 2, 1, &Device::Cpu).unwrap();
        let mut t = AdversarialTrainer::new(config, Short(data), InMemoryTelemetry::new()).unwrap();

        assert!(matches!(t.run(), Err(GanError::Data(_))));
        assert_eq!(t.current_iteration(), 2);
        assert_eq!(t.current_epoch(), 0);

        t.finalize().unwrap();
        assert!(!t.checkpoints().exists("checkpoint.bin"));
        assert_eq!(t.telemetry().flushes, 1);
    }

    #[test]
    fn test_mismatched_checkpoint_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_config(dir.path());
        let mut first = trainer(&config, 2);
        first.run().unwrap();
        first.finalize().unwrap();

        let mut wider = config.clone();
        wider.model.generator_hidden = 16;
        let second = trainer(&wider, 2);
        assert!(!second.was_resumed());
        assert_eq!(second.current_epoch(), 0);
        assert_eq!(second.current_iteration(), 0);
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = trainer(&tiny_config(dir.path()), 1);
        t.finalize().unwrap();
        t.finalize().unwrap();
        assert_eq!(t.telemetry().flushes, 1);
        assert!(t.checkpoints().exists("checkpoint.bin"));
    }

    #[test]
    fn test_progress_message_shows_running_means() {
        let output = StepOutput {
            discriminator_loss_real: 0.5,
            discriminator_loss_fake: 0.5,
            discriminator_loss: 1.0,
            generator_loss: 3.0,
            d_real_mean: 0.5,
            d_fake_mean: 0.5,
            d_generator_mean: 0.5,
        };
        let mut metrics = MetricAggregator::new();
        metrics.update("discriminator_loss", 2.0);
        metrics.update("discriminator_loss", 1.0);
        metrics.update("generator_loss", 1.0);
        metrics.update("generator_loss", 3.0);

        assert_eq!(
            progress_message(&output, &metrics),
            "D 1.0000 (avg 1.5000) G 3.0000 (avg 2.0000)"
        );
    }
}
