//! CLI entry point for dcgan-rs.

use candle_core::Device;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dcgan_rs::data::{DataSource, ImageFolder, TensorDataset};
use dcgan_rs::telemetry::{SummaryWriter, TelemetrySink};
use dcgan_rs::trainer::resolve_seed;
use dcgan_rs::{AdversarialTrainer, CancellationToken, GanConfig, GanError, Result, RunOutcome};

#[derive(Parser)]
#[command(name = "dcgan")]
#[command(about = "Adversarial training for DCGAN-style image models")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: String,
    },
    /// Start or resume training
    Train {
        /// Path to configuration file
        config: String,
        /// Override `max_epoch` from the configuration
        #[arg(long)]
        max_epoch: Option<usize>,
        /// Train on N batches of random images instead of `data_dir`
        #[arg(long, value_name = "N")]
        synthetic: Option<usize>,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "dcgan.yaml")]
        output: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config);
            let config = GanConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!("  Experiment: {}", config.exp_name);
            println!(
                "  Images: {}x{}x{}, batch {}",
                config.image.channels, config.image.height, config.image.width, config.batch_size
            );
            println!("  Epochs: {}", config.max_epoch);
            println!("  Checkpoint: {}", config.checkpoint_path().display());
        }
        Commands::Train {
            config,
            max_epoch,
            synthetic,
        } => {
            tracing::info!("Starting training with config: {}", config);
            let mut config = GanConfig::from_file(&config)?;
            if let Some(max_epoch) = max_epoch {
                config.max_epoch = max_epoch;
            }
            config.validate()?;
            let seed = resolve_seed(config.seed);
            config.seed = Some(seed);

            let token = CancellationToken::new();
            let handler = token.clone();
            ctrlc::set_handler(move || {
                tracing::warn!("Received Ctrl-C, stopping after the current step");
                handler.cancel();
            })
            .map_err(|e| GanError::config(format!("failed to install Ctrl-C handler: {e}")))?;

            let telemetry = SummaryWriter::create(&config.summary_dir)?;
            match synthetic {
                Some(batches) => {
                    let data = TensorDataset::synthetic(
                        config.image,
                        config.batch_size,
                        batches,
                        seed,
                        &Device::Cpu,
                    )?;
                    train(config, data, telemetry, token)?;
                }
                None => {
                    let dir = config.data_dir.clone().ok_or_else(|| {
                        GanError::config("data_dir is required unless --synthetic is given")
                    })?;
                    let data =
                        ImageFolder::open(dir, config.image, config.batch_size, seed, Device::Cpu)?;
                    train(config, data, telemetry, token)?;
                }
            }
        }
        Commands::Init { output } => {
            let config = GanConfig::default();
            config.to_file(&output)?;
            println!("✓ Configuration written to: {output}");
        }
    }

    Ok(())
}

fn train<D: DataSource, T: TelemetrySink>(
    config: GanConfig,
    data: D,
    telemetry: T,
    token: CancellationToken,
) -> Result<()> {
    let mut trainer = AdversarialTrainer::new(config, data, telemetry)?.with_cancellation(token);
    let outcome = match trainer.run() {
        Ok(outcome) => outcome,
        Err(e) => {
            if let Err(closing) = trainer.finalize() {
                tracing::warn!("Finalize after failed run: {closing}");
            }
            return Err(e);
        }
    };
    trainer.finalize()?;

    match outcome {
        RunOutcome::Completed => println!(
            "✓ Training complete: epoch {}, iteration {}",
            trainer.current_epoch(),
            trainer.current_iteration()
        ),
        RunOutcome::Cancelled => println!(
            "Training interrupted at iteration {}; resume with the same config",
            trainer.current_iteration()
        ),
    }
    println!(
        "  Checkpoint: {}",
        trainer.config().checkpoint_path().display()
    );
    Ok(())
}
