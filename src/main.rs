//! FixMatch Semi-Supervised Learning CLI
//!
//! Entry point for single-process and multi-process FixMatch training. For a
//! multi-process run, start one process per rank with `--local-rank` and the
//! `WORLD_SIZE`, `RANK`, `MASTER_ADDR` and `MASTER_PORT` environment set.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use tracing::info;

use fixmatch_ssl::backend::{backend_name, device_for_rank, TrainingBackend};
use fixmatch_ssl::dataset::DatasetKind;
use fixmatch_ssl::distributed::LaunchContext;
use fixmatch_ssl::utils::logging::{init_logging, LogConfig, LogLevel};
use fixmatch_ssl::utils::format_duration;
use fixmatch_ssl::FixMatchConfig;

/// FixMatch Semi-Supervised Image Classification
///
/// Trains an image classifier from a small labeled set plus unlabeled images
/// using confidence-thresholded pseudo-labels, with the Burn framework.
#[derive(Parser, Debug)]
#[command(name = "fixmatch")]
#[command(version = "0.1.0")]
#[command(about = "FixMatch semi-supervised training with Burn", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error); overrides --verbose
    #[arg(long)]
    log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train with FixMatch
    Train(TrainArgs),

    /// Print the effective configuration as TOML without training
    Config(TrainArgs),
}

/// Every flag overrides the same field of the config file (or defaults)
#[derive(Args, Debug, Clone)]
struct TrainArgs {
    /// TOML or JSON config file to start from
    #[arg(long)]
    config: Option<PathBuf>,

    /// Start from small synthetic-data settings instead of the defaults
    #[arg(long, default_value = "false")]
    smoke: bool,

    /// Dataset: cifar10, cifar100 or synthetic
    #[arg(long)]
    dataset: Option<String>,

    /// Directory holding the CIFAR binary files
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Number of labeled images
    #[arg(long)]
    num_labeled: Option<usize>,

    /// Number of training epochs
    #[arg(short, long)]
    epochs: Option<usize>,

    /// Labeled batch size per process
    #[arg(short, long)]
    batch_size: Option<usize>,

    /// Initial learning rate
    #[arg(long)]
    lr: Option<f64>,

    /// Warmup epochs (unlabeled passes)
    #[arg(long)]
    warmup: Option<f64>,

    /// Weight decay
    #[arg(long)]
    wdecay: Option<f64>,

    /// Disable Nesterov momentum
    #[arg(long, default_value = "false")]
    no_nesterov: bool,

    /// Disable the EMA model
    #[arg(long, default_value = "false")]
    no_ema: bool,

    /// EMA decay
    #[arg(long)]
    ema_decay: Option<f64>,

    /// Unlabeled-to-labeled ratio
    #[arg(long)]
    mu: Option<usize>,

    /// Unlabeled loss weight
    #[arg(long)]
    lambda_u: Option<f64>,

    /// Pseudo-label confidence threshold
    #[arg(long)]
    threshold: Option<f64>,

    /// Labeled images per epoch
    #[arg(long)]
    k_img: Option<usize>,

    /// Output directory for checkpoints and scalars
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// Checkpoint to resume from
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Random seed
    #[arg(long)]
    seed: Option<u64>,

    /// Device index for distributed runs, -1 for a single process
    #[arg(long, env = "LOCAL_RANK", allow_hyphen_values = true)]
    local_rank: Option<i64>,

    /// Log an epoch summary instead of progress bars
    #[arg(long, default_value = "false")]
    no_progress: bool,
}

impl TrainArgs {
    fn resolve(&self) -> Result<FixMatchConfig> {
        let mut config = match &self.config {
            Some(path) => FixMatchConfig::load(path)
                .with_context(|| format!("Failed to load config {:?}", path))?,
            None if self.smoke => FixMatchConfig::smoke(),
            None => FixMatchConfig::default(),
        };

        if let Some(dataset) = &self.dataset {
            config.dataset = DatasetKind::parse(dataset)?;
        }
        if let Some(v) = &self.data_dir {
            config.data_dir = v.clone();
        }
        if let Some(v) = self.num_labeled {
            config.num_labeled = v;
        }
        if let Some(v) = self.epochs {
            config.epochs = v;
        }
        if let Some(v) = self.batch_size {
            config.batch_size = v;
        }
        if let Some(v) = self.lr {
            config.lr = v;
        }
        if let Some(v) = self.warmup {
            config.warmup = v;
        }
        if let Some(v) = self.wdecay {
            config.wdecay = v;
        }
        if self.no_nesterov {
            config.nesterov = false;
        }
        if self.no_ema {
            config.use_ema = false;
        }
        if let Some(v) = self.ema_decay {
            config.ema_decay = v;
        }
        if let Some(v) = self.mu {
            config.mu = v;
        }
        if let Some(v) = self.lambda_u {
            config.lambda_u = v;
        }
        if let Some(v) = self.threshold {
            config.threshold = v;
        }
        if let Some(v) = self.k_img {
            config.k_img = v;
        }
        if let Some(v) = &self.out {
            config.out = v.clone();
        }
        if let Some(v) = &self.resume {
            config.resume = Some(v.clone());
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        if let Some(v) = self.local_rank {
            config.local_rank = v;
        }
        if self.no_progress {
            config.no_progress = true;
        }

        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Train(args) => {
            let config = args.resolve()?;
            let mut log_config = LogConfig::for_rank(config.local_rank, cli.verbose);
            if let Some(level) = &cli.log_level {
                if config.local_rank <= 0 {
                    log_config.level = LogLevel::parse(level);
                }
            }
            let _ = init_logging(&log_config);
            cmd_train(config)?;
        }

        Commands::Config(args) => {
            let config = args.resolve()?;
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn cmd_train(config: FixMatchConfig) -> Result<()> {
    let ctx = LaunchContext::from_env(config.local_rank)?;
    let is_main = ctx.rank == 0;

    if is_main {
        print_banner();
        println!("  {} {}", "Backend:".cyan(), backend_name());
        println!("  {} {}@{}", "Task:".cyan(), config.dataset, config.num_labeled);
        println!("  {} {}", "World size:".cyan(), ctx.world_size);
        println!();
    }

    let group = ctx.init_group().context("Failed to join the process group")?;
    let device = device_for_rank(config.local_rank);

    let start = std::time::Instant::now();
    let report = fixmatch_ssl::run::<TrainingBackend>(&config, group, device)?;
    let elapsed = start.elapsed().as_secs_f64();

    info!("Training finished in {}", format_duration(elapsed));

    if is_main {
        println!();
        println!("{}", "Training complete".green().bold());
        println!(
            "  {} {}",
            "Epochs run:".cyan(),
            report.epochs.len()
        );
        println!("  {} {:.2}%", "Best top-1 acc:".cyan(), report.best_acc);
        println!("  {} {:.2}%", "Median top-1 acc:".cyan(), report.median_acc);
        println!("  {} {:?}", "Checkpoints:".cyan(), report.out_dir);
        println!("  {} {}", "Time:".cyan(), format_duration(elapsed));
    }

    Ok(())
}

fn print_banner() {
    println!(
        "{}",
        r#"
 ==================================================================
    FixMatch Semi-Supervised Learning
    Consistency training with pseudo-labels, Burn + Rust
 ==================================================================
  "#
        .green()
    );
}
