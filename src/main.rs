//! Trains the alphacats policy/value network on one batch of self-play
//! samples and writes the model artifacts.

use std::path::PathBuf;

use alphacats::training::pipeline::has_previous_run;
use alphacats::training::{ComputeContext, HalfPrecisionOptimizer};
use alphacats::{PipelineOptions, TrainConfig};
use burn::backend::Autodiff;
use clap::Parser;
use dotenv::dotenv;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[cfg(not(feature = "metal"))]
type InnerBackend = burn::backend::NdArray;
#[cfg(feature = "metal")]
type InnerBackend = burn::backend::Metal;
type TrainBackend = Autodiff<InnerBackend>;

/// Policy/value network training
#[derive(Parser, Debug)]
#[command(name = "alphacats-train")]
#[command(about = "Train the alphacats policy/value network on stored samples", long_about = None)]
struct Args {
    /// Sample archive (.npz)
    input: PathBuf,

    /// Directory that receives the model artifacts (replaced on success)
    output: PathBuf,

    /// Fraction of the samples held out for validation
    #[arg(long = "validation_split", env = "ALPHACATS_VALIDATION_SPLIT", default_value_t = 0.1)]
    validation_split: f64,

    /// Weights record from a previous run to start from
    #[arg(long = "initial_weights", env = "ALPHACATS_INITIAL_WEIGHTS")]
    initial_weights: Option<PathBuf>,

    /// Maximum number of epochs
    #[arg(long = "max_epochs", env = "ALPHACATS_MAX_EPOCHS", default_value_t = 100)]
    max_epochs: usize,

    /// Adam learning rate
    #[arg(long = "learning_rate", env = "ALPHACATS_LEARNING_RATE", default_value_t = 1e-3)]
    learning_rate: f64,

    /// Seed for weight init and shuffling
    #[arg(long, env = "ALPHACATS_SEED", default_value_t = 0)]
    seed: u64,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("alphacats=debug,info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    init_logging();
    let args = Args::parse();

    tracing::info!("Input: {}", args.input.display());
    tracing::info!("Output: {}", args.output.display());
    if has_previous_run(&args.output) {
        tracing::info!("Output holds a previous run, it is replaced only after a successful fit");
    }

    let options = PipelineOptions {
        input: args.input,
        output: args.output,
        initial_weights: args.initial_weights,
        train: TrainConfig {
            max_epochs: args.max_epochs,
            validation_split: args.validation_split,
            learning_rate: args.learning_rate,
            ..TrainConfig::default()
        },
    };

    let ctx = ComputeContext::<TrainBackend>::acquire(Default::default(), args.seed);
    let optimizer = HalfPrecisionOptimizer::<InnerBackend>::new(ctx.device().clone());

    let summary = alphacats::run(&ctx, &options, &optimizer)?;
    tracing::info!(
        "Done after {} epochs (batch size {}), artifacts in {}",
        summary.history.len(),
        summary.history.batch_size,
        summary.output.display()
    );
    Ok(())
}
