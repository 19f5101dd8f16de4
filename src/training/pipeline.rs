//! End-to-end training run: load, build, fit, persist, export

use std::fmt;
use std::path::{Path, PathBuf};

use burn::tensor::backend::AutodiffBackend;

use super::artifacts::{prepare_output_dir, save_full_model, save_weights, write_diagnostics};
use super::context::ComputeContext;
use super::export::InferenceOptimizer;
use super::metrics::TrainingHistory;
use super::network::build_model;
use super::samples::{INPUT_NAMES, OUTPUT_NAMES, SampleSet};
use super::trainer::{TrainConfig, Trainer};
use crate::error::TrainError;

/// Lifecycle of a run. Stages only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Init,
    DataLoaded,
    ModelBuilt,
    WeightsLoaded,
    Fitting,
    Saved,
    Exported,
    Terminal,
}

impl Stage {
    /// Stage that must follow this one. Weight preloading is the only
    /// optional step.
    fn can_advance_to(self, next: Stage) -> bool {
        use Stage::*;
        matches!(
            (self, next),
            (Init, DataLoaded)
                | (DataLoaded, ModelBuilt)
                | (ModelBuilt, WeightsLoaded)
                | (ModelBuilt, Fitting)
                | (WeightsLoaded, Fitting)
                | (Fitting, Saved)
                | (Saved, Exported)
                | (Exported, Terminal)
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Tracks the current stage and logs every transition
#[derive(Debug)]
struct StageTracker {
    current: Stage,
}

impl StageTracker {
    fn new() -> Self {
        Self {
            current: Stage::Init,
        }
    }

    fn advance(&mut self, next: Stage) -> Result<(), TrainError> {
        if !self.current.can_advance_to(next) {
            return Err(TrainError::StageTransition {
                from: self.current,
                to: next,
            });
        }
        tracing::info!("Stage {} -> {}", self.current, next);
        self.current = next;
        Ok(())
    }
}

/// Options for one run
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub input: PathBuf,
    pub output: PathBuf,
    pub initial_weights: Option<PathBuf>,
    pub train: TrainConfig,
}

/// What a finished run produced
#[derive(Debug)]
pub struct RunSummary {
    pub history: TrainingHistory,
    pub output: PathBuf,
    pub weights: PathBuf,
    pub stage: Stage,
}

/// Run the full pipeline. Any error ends the run; nothing in the output
/// directory is touched before the fit has succeeded.
pub fn run<B: AutodiffBackend>(
    ctx: &ComputeContext<B>,
    options: &PipelineOptions,
    optimizer: &dyn InferenceOptimizer,
) -> Result<RunSummary, TrainError> {
    let mut stage = StageTracker::new();
    let device = ctx.device();

    let samples = SampleSet::load(&options.input)?;
    stage.advance(Stage::DataLoaded)?;

    let (config, model) = build_model::<B>(&samples.input_shapes(), device)?;
    tracing::info!("Model summary:\n{}", config.summary());
    tracing::info!("Input names: {:?}", INPUT_NAMES);
    tracing::info!("Output names: {:?}", OUTPUT_NAMES);
    stage.advance(Stage::ModelBuilt)?;

    let train_config = TrainConfig {
        seed: ctx.seed(),
        ..options.train.clone()
    };
    let mut trainer = Trainer::new(model, train_config, device.clone());

    if let Some(path) = &options.initial_weights {
        trainer.load_weights(path)?;
        stage.advance(Stage::WeightsLoaded)?;
    }

    stage.advance(Stage::Fitting)?;
    let history = trainer.fit(&samples)?;
    let model = trainer.into_model();

    let original = prepare_output_dir(&options.output)?;
    save_full_model(&original, &config, &model)?;
    let weights = save_weights(&options.output, &model)?;
    stage.advance(Stage::Saved)?;

    optimizer.optimize(&original, &options.output)?;
    stage.advance(Stage::Exported)?;

    if let Err(e) = write_diagnostics(&options.output, &config, &model, &history) {
        tracing::warn!("Failed to write diagnostics: {}", e);
    }

    stage.advance(Stage::Terminal)?;
    Ok(RunSummary {
        history,
        output: options.output.clone(),
        weights,
        stage: stage.current,
    })
}

/// True when `path` holds an artifact written by a previous run
pub fn has_previous_run(output: &Path) -> bool {
    super::artifacts::weights_path(output).exists()
}
