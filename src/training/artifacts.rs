//! On-disk model artifacts
//!
//! A full artifact is a directory holding the architecture config
//! (`model.json`), the parameter record (`model.mpk`) and the serving
//! signature (`signature.json`). The weights-only record is a bare
//! `weights.mpk` used to seed a later run.

use std::fs;
use std::path::{Path, PathBuf};

use burn::prelude::*;
use burn::record::{
    FullPrecisionSettings, HalfPrecisionSettings, NamedMpkFileRecorder, PrecisionSettings,
};
use serde::{Deserialize, Serialize};

use super::metrics::TrainingHistory;
use super::network::{NetConfig, PolicyValueNet};
use super::samples::{INPUT_NAMES, MAX_CARDS_IN_DRAW_PILE, MAX_HISTORY, OUTPUT_NAMES};
use crate::error::TrainError;

pub const ORIGINAL_DIR: &str = "original";
pub const CONFIG_FILE: &str = "model.json";
pub const SIGNATURE_FILE: &str = "signature.json";
pub const SUMMARY_FILE: &str = "model.txt";
pub const METRICS_FILE: &str = "metrics.csv";
// The recorder appends the `.mpk` extension
const MODEL_RECORD: &str = "model";
const WEIGHTS_RECORD: &str = "weights";

/// Float precision of a stored parameter record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    F32,
    F16,
}

/// Name and per-sample shape of one model input or output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    pub shape: Vec<usize>,
}

/// Serving contract written next to every full artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSignature {
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
    pub precision: Precision,
}

impl ModelSignature {
    pub fn for_config(config: &NetConfig, precision: Precision) -> Self {
        let input_shapes = [
            vec![MAX_HISTORY, config.action_features],
            vec![config.hands_width],
            vec![MAX_CARDS_IN_DRAW_PILE, config.card_types],
            vec![config.policy_width],
        ];
        let output_shapes = [vec![config.policy_width], vec![1]];

        let spec = |(name, shape): (&&str, Vec<usize>)| TensorSpec {
            name: name.to_string(),
            shape,
        };
        Self {
            inputs: INPUT_NAMES.iter().zip(input_shapes).map(spec).collect(),
            outputs: OUTPUT_NAMES.iter().zip(output_shapes).map(spec).collect(),
            precision,
        }
    }

    /// Same tensors, ignoring precision
    pub fn same_contract(&self, other: &ModelSignature) -> bool {
        self.inputs == other.inputs && self.outputs == other.outputs
    }

    pub fn save(&self, path: &Path) -> Result<(), TrainError> {
        let json = serde_json::to_string_pretty(self).map_err(|e| TrainError::record(path, e))?;
        fs::write(path, json).map_err(|e| TrainError::io(path, e))
    }

    pub fn load(path: &Path) -> Result<Self, TrainError> {
        let json = fs::read_to_string(path).map_err(|e| TrainError::io(path, e))?;
        serde_json::from_str(&json).map_err(|e| TrainError::record(path, e))
    }
}

/// A full artifact read back from disk
#[derive(Debug)]
pub struct LoadedModel<B: Backend> {
    pub config: NetConfig,
    pub signature: ModelSignature,
    pub model: PolicyValueNet<B>,
}

/// Remove any previous output and recreate the directory tree. Returns the
/// directory that receives the full-precision artifact.
pub fn prepare_output_dir(output: &Path) -> Result<PathBuf, TrainError> {
    if output.exists() {
        tracing::info!("Removing previous output {}", output.display());
        fs::remove_dir_all(output).map_err(|e| TrainError::io(output, e))?;
    }
    let original = output.join(ORIGINAL_DIR);
    fs::create_dir_all(&original).map_err(|e| TrainError::io(&original, e))?;
    Ok(original)
}

/// Write config, full-precision record and signature into `dir`
pub fn save_full_model<B: Backend>(
    dir: &Path,
    config: &NetConfig,
    model: &PolicyValueNet<B>,
) -> Result<(), TrainError> {
    write_artifact::<B, FullPrecisionSettings>(dir, config, model, Precision::F32)?;
    tracing::info!("Saved model to {}", dir.display());
    Ok(())
}

/// Write an artifact with parameters stored at the precision of `S`
pub(crate) fn write_artifact<B: Backend, S: PrecisionSettings>(
    dir: &Path,
    config: &NetConfig,
    model: &PolicyValueNet<B>,
    precision: Precision,
) -> Result<(), TrainError> {
    fs::create_dir_all(dir).map_err(|e| TrainError::io(dir, e))?;

    let config_path = dir.join(CONFIG_FILE);
    config
        .save(&config_path)
        .map_err(|e| TrainError::io(&config_path, e))?;

    let record_path = dir.join(MODEL_RECORD);
    let recorder = NamedMpkFileRecorder::<S>::new();
    model
        .clone()
        .save_file(record_path.clone(), &recorder)
        .map_err(|e| TrainError::record(&record_path, e))?;

    ModelSignature::for_config(config, precision).save(&dir.join(SIGNATURE_FILE))
}

/// Read a full artifact, picking the recorder from the stored precision
pub fn load_model<B: Backend>(
    dir: &Path,
    device: &B::Device,
) -> Result<LoadedModel<B>, TrainError> {
    let config_path = dir.join(CONFIG_FILE);
    let config = NetConfig::load(&config_path).map_err(|e| TrainError::record(&config_path, e))?;
    let signature = ModelSignature::load(&dir.join(SIGNATURE_FILE))?;

    let record_path = dir.join(MODEL_RECORD);
    let model = config.init::<B>(device);
    let model = match signature.precision {
        Precision::F32 => model.load_file(
            record_path.clone(),
            &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
            device,
        ),
        Precision::F16 => model.load_file(
            record_path.clone(),
            &NamedMpkFileRecorder::<HalfPrecisionSettings>::new(),
            device,
        ),
    }
    .map_err(|e| TrainError::record(&record_path, e))?;

    Ok(LoadedModel {
        config,
        signature,
        model,
    })
}

/// Path of the weights-only record inside an output directory
pub fn weights_path(output: &Path) -> PathBuf {
    output.join(WEIGHTS_RECORD).with_extension("mpk")
}

/// Write the weights-only record used by `--initial_weights`
pub fn save_weights<B: Backend>(
    output: &Path,
    model: &PolicyValueNet<B>,
) -> Result<PathBuf, TrainError> {
    let path = weights_path(output);
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    model
        .clone()
        .save_file(path.clone(), &recorder)
        .map_err(|e| TrainError::record(&path, e))?;
    tracing::info!("Saved weights to {}", path.display());
    Ok(path)
}

/// Architecture summary and loss curves. Callers treat failures here as
/// non-fatal.
pub fn write_diagnostics<B: Backend>(
    output: &Path,
    config: &NetConfig,
    model: &PolicyValueNet<B>,
    history: &TrainingHistory,
) -> std::io::Result<()> {
    let summary = format!(
        "{}\ntrainable parameters: {}\n",
        config.summary(),
        model.num_params()
    );
    fs::write(output.join(SUMMARY_FILE), summary)?;
    history.write_csv(&output.join(METRICS_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    use crate::training::metrics::EpochMetrics;
    use crate::training::samples::{N_OUTPUTS, SampleSet, synthetic_flat};

    type TestBackend = NdArray;

    fn policy_of(model: &PolicyValueNet<TestBackend>, samples: &SampleSet) -> Vec<f32> {
        let device = Default::default();
        let batch = samples.batch::<TestBackend>(&[0, 1, 2], &device);
        model.forward(batch.inputs).policy.into_data().to_vec().unwrap()
    }

    #[test]
    fn test_signature_names_and_shapes() {
        let signature = ModelSignature::for_config(&NetConfig::new(), Precision::F32);
        let names: Vec<&str> = signature.inputs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, INPUT_NAMES);
        assert_eq!(signature.inputs[0].shape, vec![58, 16]);
        assert_eq!(signature.inputs[3].shape, vec![N_OUTPUTS]);
        assert_eq!(signature.outputs[1].shape, vec![1]);
    }

    #[test]
    fn test_signature_json_uses_lowercase_precision() {
        let signature = ModelSignature::for_config(&NetConfig::new(), Precision::F16);
        let json = serde_json::to_string(&signature).unwrap();
        assert!(json.contains("\"precision\":\"f16\""));
    }

    #[test]
    fn test_prepare_output_dir_replaces_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out");
        fs::create_dir_all(&output).unwrap();
        fs::write(output.join("stale.txt"), "old").unwrap();

        let original = prepare_output_dir(&output).unwrap();
        assert!(original.is_dir());
        assert!(!output.join("stale.txt").exists());
    }

    #[test]
    fn test_full_model_round_trip() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let config = NetConfig::new();
        let model = config.init::<TestBackend>(&device);
        let samples = SampleSet::from_flat(synthetic_flat(3)).unwrap();

        save_full_model(dir.path(), &config, &model).unwrap();
        assert!(dir.path().join("model.mpk").exists());

        let loaded = load_model::<TestBackend>(dir.path(), &device).unwrap();
        assert_eq!(loaded.signature.precision, Precision::F32);
        assert_eq!(policy_of(&model, &samples), policy_of(&loaded.model, &samples));
    }

    #[test]
    fn test_load_model_from_empty_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_model::<TestBackend>(dir.path(), &Default::default());
        assert!(matches!(result, Err(TrainError::Record { .. })));
    }

    #[test]
    fn test_weights_path() {
        assert_eq!(
            weights_path(Path::new("/tmp/run")),
            PathBuf::from("/tmp/run/weights.mpk")
        );
    }

    #[test]
    fn test_write_diagnostics() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let config = NetConfig::new();
        let model = config.init::<TestBackend>(&device);
        let mut history = TrainingHistory::new(32);
        history.record(EpochMetrics {
            epoch: 0,
            train: Default::default(),
            validation: Default::default(),
        });

        write_diagnostics(dir.path(), &config, &model, &history).unwrap();

        let summary = fs::read_to_string(dir.path().join(SUMMARY_FILE)).unwrap();
        assert!(summary.contains("masked softmax"));
        assert!(summary.contains("trainable parameters"));
        assert!(dir.path().join(METRICS_FILE).exists());
    }
}
