//! Training history and per-epoch metric bookkeeping

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Instant;

use super::loss::BatchStats;

/// Sample-weighted running mean of batch statistics over one epoch
#[derive(Debug, Clone, Default)]
pub struct EpochAccumulator {
    sums: BatchStats,
    samples: usize,
    batches: usize,
}

impl EpochAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stats: &BatchStats, batch_size: usize) {
        let weight = batch_size as f32;
        self.sums.loss += stats.loss * weight;
        self.sums.policy_loss += stats.policy_loss * weight;
        self.sums.value_loss += stats.value_loss * weight;
        self.sums.policy_mae += stats.policy_mae * weight;
        self.sums.value_mae += stats.value_mae * weight;
        self.samples += batch_size;
        self.batches += 1;
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn mean(&self) -> BatchStats {
        if self.samples == 0 {
            return BatchStats::default();
        }
        let n = self.samples as f32;
        BatchStats {
            loss: self.sums.loss / n,
            policy_loss: self.sums.policy_loss / n,
            value_loss: self.sums.value_loss / n,
            policy_mae: self.sums.policy_mae / n,
            value_mae: self.sums.value_mae / n,
        }
    }
}

/// Metrics of one completed epoch
#[derive(Debug, Clone, PartialEq)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train: BatchStats,
    pub validation: BatchStats,
}

/// Record of a fit: one entry per completed epoch
#[derive(Debug)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochMetrics>,
    /// Epoch whose weights the model holds after fitting, when restored
    pub restored_epoch: Option<usize>,
    pub stopped_early: bool,
    pub batch_size: usize,
    start_time: Instant,
}

impl TrainingHistory {
    pub fn new(batch_size: usize) -> Self {
        Self {
            epochs: Vec::new(),
            restored_epoch: None,
            stopped_early: false,
            batch_size,
            start_time: Instant::now(),
        }
    }

    pub fn record(&mut self, metrics: EpochMetrics) {
        self.epochs.push(metrics);
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn last(&self) -> Option<&EpochMetrics> {
        self.epochs.last()
    }

    pub fn training_duration_secs(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    /// Log one epoch to the console
    pub fn log_epoch(&self, metrics: &EpochMetrics, improved: bool) {
        let marker = if improved { " *" } else { "" };
        tracing::info!(
            "Epoch {}: loss={:.4}, val_loss={:.4}{}",
            metrics.epoch + 1,
            metrics.train.loss,
            metrics.validation.loss,
            marker
        );
        tracing::debug!(
            "  policy: loss={:.4} mae={:.4} val_loss={:.4} val_mae={:.4}",
            metrics.train.policy_loss,
            metrics.train.policy_mae,
            metrics.validation.policy_loss,
            metrics.validation.policy_mae
        );
        tracing::debug!(
            "  value: loss={:.4} mae={:.4} val_loss={:.4} val_mae={:.4}",
            metrics.train.value_loss,
            metrics.train.value_mae,
            metrics.validation.value_loss,
            metrics.validation.value_mae
        );
    }

    /// Write the loss curves as CSV, one row per epoch
    pub fn write_csv(&self, path: &Path) -> io::Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(
            out,
            "epoch,loss,val_loss,policy_loss,val_policy_loss,value_loss,val_value_loss,\
             policy_mae,val_policy_mae,value_mae,val_value_mae"
        )?;
        for m in &self.epochs {
            writeln!(
                out,
                "{},{},{},{},{},{},{},{},{},{},{}",
                m.epoch + 1,
                m.train.loss,
                m.validation.loss,
                m.train.policy_loss,
                m.validation.policy_loss,
                m.train.value_loss,
                m.validation.value_loss,
                m.train.policy_mae,
                m.validation.policy_mae,
                m.train.value_mae,
                m.validation.value_mae
            )?;
        }
        out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(loss: f32) -> BatchStats {
        BatchStats {
            loss,
            policy_loss: loss / 2.0,
            value_loss: loss / 2.0,
            policy_mae: 0.1,
            value_mae: 0.2,
        }
    }

    #[test]
    fn test_accumulator_weights_by_batch_size() {
        let mut acc = EpochAccumulator::new();
        acc.push(&stats(1.0), 3);
        acc.push(&stats(2.0), 1);

        let mean = acc.mean();
        assert_eq!(acc.batches(), 2);
        assert!((mean.loss - 1.25).abs() < 1e-6);
        assert!((mean.value_mae - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_empty_accumulator() {
        assert_eq!(EpochAccumulator::new().mean(), BatchStats::default());
    }

    #[test]
    fn test_write_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.csv");

        let mut history = TrainingHistory::new(32);
        history.record(EpochMetrics {
            epoch: 0,
            train: stats(1.0),
            validation: stats(1.5),
        });
        history.record(EpochMetrics {
            epoch: 1,
            train: stats(0.5),
            validation: stats(0.75),
        });
        history.write_csv(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("epoch,loss,val_loss"));
        assert!(lines[2].starts_with("2,0.5,0.75,"));
    }
}
