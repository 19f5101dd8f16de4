//! Joint policy/value objective

use burn::prelude::*;

use super::network::{NetOutput, PolicyValueNet};
use super::samples::TargetBatch;

/// Probabilities are clipped to [EPSILON, 1 - EPSILON] before the log
const EPSILON: f32 = 1e-7;

/// Loss terms for one batch. `total` is what gets differentiated.
#[derive(Debug, Clone)]
pub struct JointLoss<B: Backend> {
    pub total: Tensor<B, 1>,
    pub policy: Tensor<B, 1>,
    pub value: Tensor<B, 1>,
    pub policy_mae: Tensor<B, 1>,
    pub value_mae: Tensor<B, 1>,
}

/// Host-side copy of the loss terms
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BatchStats {
    pub loss: f32,
    pub policy_loss: f32,
    pub value_loss: f32,
    pub policy_mae: f32,
    pub value_mae: f32,
}

impl<B: Backend> JointLoss<B> {
    /// Categorical cross-entropy on the policy plus mean squared error on the
    /// value, equally weighted, plus the head L2 penalty
    pub fn compute(
        model: &PolicyValueNet<B>,
        output: &NetOutput<B>,
        targets: &TargetBatch<B>,
    ) -> Self {
        let policy = categorical_cross_entropy(output.policy.clone(), targets.policy.clone());
        let value = (output.value.clone() - targets.value.clone())
            .powf_scalar(2.0)
            .mean();
        let total = policy.clone() + value.clone() + model.regularization_loss();

        let policy_mae = (output.policy.clone() - targets.policy.clone())
            .abs()
            .mean();
        let value_mae = (output.value.clone() - targets.value.clone()).abs().mean();

        Self {
            total,
            policy,
            value,
            policy_mae,
            value_mae,
        }
    }

    pub fn stats(&self) -> BatchStats {
        let scalar = |t: &Tensor<B, 1>| -> f32 { t.clone().into_scalar().elem() };
        BatchStats {
            loss: scalar(&self.total),
            policy_loss: scalar(&self.policy),
            value_loss: scalar(&self.value),
            policy_mae: scalar(&self.policy_mae),
            value_mae: scalar(&self.value_mae),
        }
    }
}

/// Mean over the batch of -sum(target * log(probs))
pub fn categorical_cross_entropy<B: Backend>(
    probs: Tensor<B, 2>,
    targets: Tensor<B, 2>,
) -> Tensor<B, 1> {
    let log_probs = probs.clamp(EPSILON, 1.0 - EPSILON).log();
    (targets * log_probs).sum_dim(1).neg().mean()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    use crate::training::network::NetConfig;
    use crate::training::samples::{SampleSet, synthetic_flat};

    type TestBackend = NdArray;

    #[test]
    fn test_cross_entropy_of_exact_prediction() {
        let device = Default::default();
        let probs = Tensor::<TestBackend, 2>::from_floats([[0.0, 1.0, 0.0]], &device);
        let loss: f32 = categorical_cross_entropy(probs.clone(), probs)
            .into_scalar()
            .elem();
        assert!(loss.abs() < 1e-5);
    }

    #[test]
    fn test_cross_entropy_ignores_zero_probability_actions() {
        let device = Default::default();
        let probs = Tensor::<TestBackend, 2>::from_floats([[0.5, 0.5, 0.0]], &device);
        let targets = Tensor::<TestBackend, 2>::from_floats([[0.25, 0.75, 0.0]], &device);
        let loss: f32 = categorical_cross_entropy(probs, targets)
            .into_scalar()
            .elem();
        assert!((loss - std::f32::consts::LN_2).abs() < 1e-5);
    }

    #[test]
    fn test_joint_loss_is_sum_of_terms() {
        let device = Default::default();
        let model = NetConfig::new().init::<TestBackend>(&device);
        let samples = SampleSet::from_flat(synthetic_flat(4)).unwrap();
        let batch = samples.batch::<TestBackend>(&[0, 1, 2, 3], &device);

        let output = model.forward(batch.inputs);
        let loss = JointLoss::compute(&model, &output, &batch.targets);
        let stats = loss.stats();
        let penalty: f32 = model.regularization_loss().into_scalar().elem();

        assert!(stats.loss.is_finite());
        assert!((stats.loss - (stats.policy_loss + stats.value_loss + penalty)).abs() < 1e-4);
        assert!(stats.value_mae >= 0.0 && stats.value_mae <= 2.0);
        assert!(stats.policy_mae >= 0.0);
    }
}
