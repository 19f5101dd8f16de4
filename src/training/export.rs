//! Inference optimization of a saved full artifact

use std::marker::PhantomData;
use std::path::Path;

use burn::prelude::*;
use burn::record::HalfPrecisionSettings;

use super::artifacts::{ModelSignature, Precision, load_model, write_artifact};
use crate::error::TrainError;

/// Transform from a saved full artifact into a deployable one.
///
/// The driver hands over a valid artifact directory and accepts whatever
/// ends up in `output_dir`. Applying the transform twice to the same input
/// must give functionally equivalent artifacts.
pub trait InferenceOptimizer {
    fn optimize(&self, saved_model_dir: &Path, output_dir: &Path) -> Result<(), TrainError>;
}

/// Re-encodes the parameters at 16-bit float precision
#[derive(Debug, Clone)]
pub struct HalfPrecisionOptimizer<B: Backend> {
    device: B::Device,
    _backend: PhantomData<B>,
}

impl<B: Backend> HalfPrecisionOptimizer<B> {
    pub fn new(device: B::Device) -> Self {
        Self {
            device,
            _backend: PhantomData,
        }
    }
}

impl<B: Backend> InferenceOptimizer for HalfPrecisionOptimizer<B> {
    fn optimize(&self, saved_model_dir: &Path, output_dir: &Path) -> Result<(), TrainError> {
        let loaded = load_model::<B>(saved_model_dir, &self.device)
            .map_err(|e| TrainError::Export(e.to_string()))?;

        let expected = ModelSignature::for_config(&loaded.config, loaded.signature.precision);
        if !loaded.signature.same_contract(&expected) {
            return Err(TrainError::Export(format!(
                "signature in {} does not match the stored architecture",
                saved_model_dir.display()
            )));
        }

        write_artifact::<B, HalfPrecisionSettings>(
            output_dir,
            &loaded.config,
            &loaded.model,
            Precision::F16,
        )
        .map_err(|e| TrainError::Export(e.to_string()))?;

        tracing::info!(
            "Exported half precision model from {} to {}",
            saved_model_dir.display(),
            output_dir.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    use crate::training::artifacts::{SIGNATURE_FILE, save_full_model};
    use crate::training::network::{NetConfig, PolicyValueNet};
    use crate::training::samples::{SampleSet, synthetic_flat};

    type TestBackend = NdArray;

    fn outputs(model: &PolicyValueNet<TestBackend>) -> (Vec<f32>, Vec<f32>) {
        let device = Default::default();
        let samples = SampleSet::from_flat(synthetic_flat(4)).unwrap();
        let batch = samples.batch::<TestBackend>(&[0, 1, 2, 3], &device);
        let output = model.forward(batch.inputs);
        (
            output.policy.into_data().to_vec().unwrap(),
            output.value.into_data().to_vec().unwrap(),
        )
    }

    fn saved_model(dir: &Path) -> PolicyValueNet<TestBackend> {
        let config = NetConfig::new();
        let model = config.init::<TestBackend>(&Default::default());
        save_full_model(dir, &config, &model).unwrap();
        model
    }

    #[test]
    fn test_export_is_idempotent() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("original");
        let original_model = saved_model(&original);

        let optimizer = HalfPrecisionOptimizer::<TestBackend>::new(device);
        let first = dir.path().join("first");
        let second = dir.path().join("second");
        optimizer.optimize(&original, &first).unwrap();
        optimizer.optimize(&original, &second).unwrap();

        let a = load_model::<TestBackend>(&first, &device).unwrap();
        let b = load_model::<TestBackend>(&second, &device).unwrap();
        assert_eq!(a.signature, b.signature);
        assert_eq!(a.signature.precision, Precision::F16);
        assert_eq!(outputs(&a.model), outputs(&b.model));

        // Half precision stays close to the full model
        let (full_policy, full_value) = outputs(&original_model);
        let (half_policy, half_value) = outputs(&a.model);
        for (x, y) in full_policy.iter().zip(&half_policy) {
            assert!((x - y).abs() < 1e-2);
        }
        for (x, y) in full_value.iter().zip(&half_value) {
            assert!((x - y).abs() < 1e-2);
        }
    }

    #[test]
    fn test_export_of_exported_model() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("original");
        saved_model(&original);

        let optimizer = HalfPrecisionOptimizer::<TestBackend>::new(device);
        let once = dir.path().join("once");
        let twice = dir.path().join("twice");
        optimizer.optimize(&original, &once).unwrap();
        optimizer.optimize(&once, &twice).unwrap();

        let a = load_model::<TestBackend>(&once, &device).unwrap();
        let b = load_model::<TestBackend>(&twice, &device).unwrap();
        assert_eq!(outputs(&a.model), outputs(&b.model));
    }

    #[test]
    fn test_export_rejects_mismatched_signature() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("original");
        saved_model(&original);

        let mut signature = ModelSignature::load(&original.join(SIGNATURE_FILE)).unwrap();
        signature.outputs[0].shape = vec![7];
        signature.save(&original.join(SIGNATURE_FILE)).unwrap();

        let optimizer = HalfPrecisionOptimizer::<TestBackend>::new(device);
        let result = optimizer.optimize(&original, &dir.path().join("out"));
        assert!(matches!(result, Err(TrainError::Export(_))));
    }

    #[test]
    fn test_export_of_missing_model_fails() {
        let dir = tempfile::tempdir().unwrap();
        let optimizer = HalfPrecisionOptimizer::<TestBackend>::new(Default::default());
        let result = optimizer.optimize(&dir.path().join("nope"), &dir.path().join("out"));
        assert!(matches!(result, Err(TrainError::Export(_))));
    }
}
