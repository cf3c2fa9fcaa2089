use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pixelmix::data::{BatchProvider, DataLoader, DataLoaderConfig, DatasetName, InMemoryProvider, TensorDataset};
use pixelmix::model::{DualHeadConfig, DualHeadSegNet};
use pixelmix::perturb::Perturbations;
use pixelmix::training::{
    DataProviders, DomainAdaptationTrainer, FanoutSink, JsonlSink, TracingSink, TrainerConfig, TrainingEvent,
    ValidationMode, CITYSCAPES_CLASSES,
};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "pixelmix")]
#[command(about = "Source-to-target domain adaptation for semantic segmentation", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train (or validate, when `train: false`) as configured
    Train {
        /// Configuration file path
        #[arg(short, long, env = "PIXELMIX_CONFIG")]
        config: PathBuf,
    },

    /// Evaluate a checkpoint on the target validation set
    Evaluate {
        /// Configuration file path
        #[arg(short, long, env = "PIXELMIX_CONFIG")]
        config: PathBuf,

        /// Checkpoint to evaluate
        #[arg(long)]
        checkpoint: PathBuf,
    },

    /// Validate configuration file
    Config {
        /// Configuration file to validate
        #[arg(short, long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    pixelmix::logging::init_logging(cli.verbose, cli.json)?;

    match cli.command {
        Commands::Train { config } => run(&config, None).await,
        Commands::Evaluate { config, checkpoint } => run(&config, Some(checkpoint)).await,
        Commands::Config { file } => validate_config(&file),
    }
}

fn load_config(path: &Path) -> Result<TrainerConfig> {
    let config = TrainerConfig::from_file(path)
        .with_context(|| format!("Failed to load configuration file {}", path.display()))?;
    config.validate().context("Configuration validation failed")?;
    Ok(config)
}

fn loader(
    name: &str,
    path: &Path,
    device: &candle_core::Device,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
    seed: u64,
) -> Result<DataLoader> {
    let dataset = TensorDataset::from_safetensors(DatasetName::parse(name)?, path, device)
        .with_context(|| format!("Failed to load dataset {}", path.display()))?;
    let config = DataLoaderConfig {
        batch_size,
        shuffle,
        drop_last,
        seed,
    };
    Ok(DataLoader::new(dataset, config)?)
}

fn build_providers(config: &TrainerConfig, device: &candle_core::Device, training: bool) -> Result<DataProviders> {
    let data = &config.data;
    let seed = config.runtime.seed;

    let (source_train, target_train): (Box<dyn BatchProvider>, Box<dyn BatchProvider>) = if training {
        (
            Box::new(loader(
                &data.source.dataset,
                &data.source.train_path,
                device,
                data.batch_size,
                data.shuffle,
                true,
                seed,
            )?),
            Box::new(loader(
                &data.target.dataset,
                &data.target.train_path,
                device,
                data.batch_size,
                data.shuffle,
                true,
                seed.wrapping_add(1),
            )?),
        )
    } else {
        (Box::new(InMemoryProvider::new(Vec::new())), Box::new(InMemoryProvider::new(Vec::new())))
    };

    let target_val_path = data
        .target
        .val_path
        .as_ref()
        .context("data.target.val_path is required for validation")?;
    let target_val = loader(&data.target.dataset, target_val_path, device, data.batch_size, false, false, seed)?;

    let source_val = match &data.source.val_path {
        Some(path) => Some(Box::new(loader(&data.source.dataset, path, device, data.batch_size, false, false, seed)?)
            as Box<dyn BatchProvider>),
        None => None,
    };

    Ok(DataProviders {
        source_train,
        target_train,
        target_val: Box::new(target_val),
        source_val,
    })
}

async fn run(config_path: &Path, checkpoint: Option<PathBuf>) -> Result<()> {
    let mut config = load_config(config_path)?;
    let evaluating = checkpoint.is_some();
    if evaluating {
        config.train = false;
    }
    info!("Run '{}' ({})", config.name, if config.train { "training" } else { "validation" });

    let device = config.runtime.device.open().context("Failed to open device")?;
    device.set_seed(config.runtime.seed)?;

    let model = DualHeadSegNet::new(
        DualHeadConfig {
            width: config.model.width,
            num_classes: config.data.num_classes,
            num_targets: config.model.num_target,
            ..Default::default()
        },
        &device,
    )?;

    let providers = build_providers(&config, &device, config.train)?;

    let mut sink = FanoutSink::new().with(TracingSink);
    if let Some(path) = &config.logging.metrics_file {
        sink = sink.with(JsonlSink::create(path).context("Failed to open metrics file")?);
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let monitor = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                TrainingEvent::Error { error } => warn!("{}", error),
                other => debug!("{:?}", other),
            }
        }
    });

    let checkpoint = checkpoint.or_else(|| config.model.checkpoint.clone());
    let seed = config.runtime.seed;
    let mut trainer = DomainAdaptationTrainer::new(
        config,
        model,
        providers,
        Perturbations::standard(seed),
        Box::new(sink),
    )?
    .with_event_monitoring(tx);

    if let Some(path) = &checkpoint {
        trainer
            .load_checkpoint(path)
            .with_context(|| format!("Failed to load checkpoint {}", path.display()))?;
    }

    if trainer.config().train {
        let result = trainer.train()?;
        info!(
            "Finished {} steps in {:?}; best MIoU {:.3} at iter {}",
            result.total_steps, result.training_duration, result.counters.best_miou, result.counters.best_iter
        );
    } else {
        let report = trainer.validate(ValidationMode::Target)?;
        let names = if trainer.config().data.num_classes == CITYSCAPES_CLASSES.len() {
            Some(&CITYSCAPES_CLASSES[..])
        } else {
            None
        };
        for line in trainer.evaluator().per_class_table(names) {
            println!("{}", line);
        }
        let (pa, mpa, miou, fwiou) = report.summary();
        println!("PA {:.3}  MPA {:.3}  MIoU {:.3}  FWIoU {:.3}", pa, mpa, miou, fwiou);
    }

    drop(trainer);
    monitor.await.context("Event monitor task failed")?;
    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    info!("Validating configuration file: {}", config_path.display());
    let config = load_config(config_path)?;

    info!("Configuration is valid");
    info!("  - Source: {} -> target: {}", config.data.source.dataset, config.data.target.dataset);
    info!("  - Classes: {} (16-class mode: {})", config.data.num_classes, config.data.class_16());
    info!(
        "  - Optimizer: {} lr={} for {} iterations",
        config.optimizer.kind, config.optimizer.lr, config.optimizer.iterations
    );
    info!(
        "  - Loss weights: new={} aug={} fourier={} cutmix={} aux={}",
        config.losses.lam_new,
        config.losses.lam_aug,
        config.losses.lam_fourier,
        config.losses.lam_cutmix,
        config.losses.lam_aux
    );
    Ok(())
}
