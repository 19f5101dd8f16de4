//! Early stopping on validation loss

/// Outcome of observing one epoch's validation loss
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// New best loss; the caller should snapshot the current weights
    Improved,
    /// No improvement for `epochs` consecutive epochs, keep going
    Waiting { epochs: usize },
    /// Patience exhausted; restore the weights from `best_epoch`
    Stop { best_epoch: usize },
}

/// Tracks the best validation loss and how long it has stood.
///
/// An epoch improves on the best only when `loss < best - min_delta`, so a
/// later epoch that merely ties the best never replaces it.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    min_delta: f64,
    patience: usize,
    best: f64,
    best_epoch: Option<usize>,
    wait: usize,
}

impl EarlyStopping {
    pub fn new(min_delta: f64, patience: usize) -> Self {
        Self {
            min_delta: min_delta.abs(),
            patience,
            best: f64::INFINITY,
            best_epoch: None,
            wait: 0,
        }
    }

    pub fn observe(&mut self, epoch: usize, loss: f64) -> Verdict {
        if loss < self.best - self.min_delta {
            self.best = loss;
            self.best_epoch = Some(epoch);
            self.wait = 0;
            return Verdict::Improved;
        }

        self.wait += 1;
        match self.best_epoch {
            Some(best_epoch) if self.wait >= self.patience => Verdict::Stop { best_epoch },
            _ => Verdict::Waiting { epochs: self.wait },
        }
    }

    pub fn best(&self) -> Option<(usize, f64)> {
        self.best_epoch.map(|epoch| (epoch, self.best))
    }
}
