//! Fit loop with adaptive batch size, early stopping and divergence guard

use std::path::Path;

use burn::grad_clipping::GradientClippingConfig;
use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::backend::AutodiffBackend;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use super::early_stopping::{EarlyStopping, Verdict};
use super::loss::{BatchStats, JointLoss};
use super::metrics::{EpochAccumulator, EpochMetrics, TrainingHistory};
use super::network::PolicyValueNet;
use super::samples::SampleSet;
use crate::error::TrainError;

pub const MIN_BATCH_SIZE: usize = 32;
pub const MAX_BATCH_SIZE: usize = 2048;
/// Batch size keeps doubling while an epoch would still have more than this
/// many batches
pub const MIN_BATCHES_PER_EPOCH: usize = 128;

/// Largest power of two in [32, 2048] that keeps roughly 128 batches per
/// epoch: start at 32 and double while `batch_size * 128 < num_samples`.
pub fn select_batch_size(num_samples: usize) -> usize {
    let mut batch_size = MIN_BATCH_SIZE;
    while batch_size * MIN_BATCHES_PER_EPOCH < num_samples && batch_size < MAX_BATCH_SIZE {
        batch_size *= 2;
    }
    batch_size
}

/// Training configuration
#[derive(Debug, Clone)]
pub struct TrainConfig {
    /// Upper bound on the number of epochs
    pub max_epochs: usize,
    /// Fraction of the samples (taken from the tail) held out for validation
    pub validation_split: f64,
    /// Learning rate
    pub learning_rate: f64,
    /// Max gradient norm for clipping
    pub max_grad_norm: f32,
    /// Adam epsilon
    pub epsilon: f32,
    /// Smallest validation loss decrease that counts as an improvement
    pub min_delta: f64,
    /// Epochs without improvement before stopping
    pub patience: usize,
    /// Seed for the per-epoch shuffle
    pub seed: u64,
    /// Log frequency (batches)
    pub log_freq: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            max_epochs: 100,
            validation_split: 0.1,
            learning_rate: 1e-3,
            max_grad_norm: 1.0,
            epsilon: 1e-7,
            min_delta: 1e-4,
            patience: 5,
            seed: 0,
            log_freq: 100,
        }
    }
}

/// Owns the model while it is being fitted
pub struct Trainer<B: AutodiffBackend> {
    model: PolicyValueNet<B>,
    config: TrainConfig,
    device: B::Device,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn new(model: PolicyValueNet<B>, config: TrainConfig, device: B::Device) -> Self {
        Self {
            model,
            config,
            device,
        }
    }

    /// Replace the parameters with a weights record saved by an earlier run.
    /// The record must come from the same architecture.
    pub fn load_weights(&mut self, path: &Path) -> Result<(), TrainError> {
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        self.model = self
            .model
            .clone()
            .load_file(path.to_path_buf(), &recorder, &self.device)
            .map_err(|e| TrainError::record(path, e))?;
        tracing::info!("Loaded initial weights from {}", path.display());
        Ok(())
    }

    /// Fit on the samples until the epoch budget runs out or validation loss
    /// stops improving. A non-finite loss aborts the fit.
    pub fn fit(&mut self, samples: &SampleSet) -> Result<TrainingHistory, TrainError> {
        let split = samples.split(self.config.validation_split)?;
        let batch_size = select_batch_size(samples.len());
        tracing::info!("Using batch size: {}", batch_size);
        tracing::info!(
            "Training on {} samples, validating on {}",
            split.train.len(),
            split.validation.len()
        );

        let optim_config = AdamConfig::new()
            .with_epsilon(self.config.epsilon)
            .with_grad_clipping(Some(GradientClippingConfig::Norm(
                self.config.max_grad_norm,
            )));
        let mut optimizer = optim_config.init::<B, PolicyValueNet<B>>();

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut stopper = EarlyStopping::new(self.config.min_delta, self.config.patience);
        let mut best_model: Option<PolicyValueNet<B>> = None;
        let mut history = TrainingHistory::new(batch_size);
        let mut order = split.train.clone();

        for epoch in 0..self.config.max_epochs {
            order.shuffle(&mut rng);

            let train = self.train_epoch(samples, &order, batch_size, epoch, &mut optimizer)?;
            let validation = self.evaluate(samples, &split.validation, batch_size)?;
            if !validation.loss.is_finite() {
                tracing::error!("Validation loss is {} at epoch {}", validation.loss, epoch + 1);
                return Err(TrainError::Diverged {
                    epoch,
                    batch: 0,
                    loss: validation.loss,
                });
            }

            let metrics = EpochMetrics {
                epoch,
                train,
                validation,
            };
            let verdict = stopper.observe(epoch, validation.loss as f64);
            history.log_epoch(&metrics, verdict == Verdict::Improved);
            history.record(metrics);

            match verdict {
                Verdict::Improved => best_model = Some(self.model.clone()),
                Verdict::Waiting { .. } => {}
                Verdict::Stop { best_epoch } => {
                    tracing::info!(
                        "Early stopping at epoch {}, restoring weights from epoch {}",
                        epoch + 1,
                        best_epoch + 1
                    );
                    if let Some(best) = best_model.take() {
                        self.model = best;
                        history.restored_epoch = Some(best_epoch);
                    }
                    history.stopped_early = true;
                    break;
                }
            }
        }

        if let Some((epoch, loss)) = stopper.best() {
            tracing::info!("Best val_loss {:.4} at epoch {}", loss, epoch + 1);
        }
        if let Some(last) = history.last() {
            tracing::debug!("Last epoch val_loss {:.4}", last.validation.loss);
        }
        tracing::info!(
            "Fit finished after {} epochs in {:.1}s",
            history.len(),
            history.training_duration_secs()
        );

        Ok(history)
    }

    /// One pass over the shuffled training indices
    fn train_epoch<O: Optimizer<PolicyValueNet<B>, B>>(
        &mut self,
        samples: &SampleSet,
        order: &[usize],
        batch_size: usize,
        epoch: usize,
        optimizer: &mut O,
    ) -> Result<BatchStats, TrainError> {
        let mut acc = EpochAccumulator::new();

        for (batch_idx, indices) in order.chunks(batch_size).enumerate() {
            let batch = samples.batch::<B>(indices, &self.device);
            let output = self.model.forward(batch.inputs);
            let loss = JointLoss::compute(&self.model, &output, &batch.targets);

            let stats = loss.stats();
            if !stats.loss.is_finite() {
                tracing::error!(
                    "Batch {} at epoch {}: invalid loss {}, terminating training",
                    batch_idx,
                    epoch + 1,
                    stats.loss
                );
                return Err(TrainError::Diverged {
                    epoch,
                    batch: batch_idx,
                    loss: stats.loss,
                });
            }

            // Backward pass and update
            let grads = loss.total.backward();
            let grads = GradientsParams::from_grads(grads, &self.model);
            self.model = optimizer.step(self.config.learning_rate, self.model.clone(), grads);

            acc.push(&stats, indices.len());
            if (batch_idx + 1) % self.config.log_freq == 0 {
                tracing::debug!(
                    "Epoch {}, Batch {}: loss = {:.4}",
                    epoch + 1,
                    batch_idx + 1,
                    stats.loss
                );
            }
        }

        tracing::debug!("Epoch {}: {} batches", epoch + 1, acc.batches());
        Ok(acc.mean())
    }

    /// Loss over the validation indices with dropout disabled
    fn evaluate(
        &self,
        samples: &SampleSet,
        indices: &[usize],
        batch_size: usize,
    ) -> Result<BatchStats, TrainError> {
        let model = self.model.valid();
        let mut acc = EpochAccumulator::new();

        for chunk in indices.chunks(batch_size) {
            let batch = samples.batch::<B::InnerBackend>(chunk, &self.device);
            let output = model.forward(batch.inputs);
            let loss = JointLoss::compute(&model, &output, &batch.targets);
            acc.push(&loss.stats(), chunk.len());
        }

        Ok(acc.mean())
    }

    /// Get the trained model (consumes the trainer)
    pub fn into_model(self) -> PolicyValueNet<B> {
        self.model
    }
}
