//! Sample loader - turns a stored `.npz` sample batch into named tensors
//!
//! The dimensional constants here are shared with the self-play generator and
//! the serving side. Changing any of them breaks both.

use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;

use burn::prelude::*;
use ndarray::{Array, Array2, Array3, ArrayD, Axis, Dimension, IxDyn, OwnedRepr, RemoveAxis};
use ndarray_npy::{NpzReader, ReadNpzError};

use crate::error::TrainError;

/// Maximum length of the action history sequence
pub const MAX_HISTORY: usize = 58;
/// Width of one encoded action in the history
pub const N_ACTION_FEATURES: usize = 16;
pub const NUM_CARD_TYPES: usize = 11;
pub const NUM_CARDS_IN_DECK: usize = 23;
pub const MAX_CARDS_IN_DRAW_PILE: usize = 13;
pub const MAX_INSERT_POSITIONS: usize = 8;
/// Size of the policy vector: play or give a card type, insert position, draw
pub const N_OUTPUTS: usize = 2 * NUM_CARD_TYPES + MAX_INSERT_POSITIONS + 1;
/// Width of the hands encoding (three hands, one slot per deck card)
pub const HANDS_WIDTH: usize = 3 * NUM_CARDS_IN_DECK;

/// Model input names, in the order the serving side feeds them
pub const INPUT_NAMES: [&str; 4] = ["history", "hands", "drawpile", "output_mask"];
/// Model output names
pub const OUTPUT_NAMES: [&str; 2] = ["policy", "value"];

const X_HISTORY: &str = "X_history";
const X_HANDS: &str = "X_hands";
const X_DRAWPILE: &str = "X_drawpile";
const X_OUTPUT_MASK: &str = "X_output_mask";
const Y_POLICY: &str = "Y_policy";
const Y_VALUE: &str = "Y_value";

/// Raw arrays as stored in the archive, flattened in row-major order
#[derive(Debug, Clone, Default)]
pub struct FlatArrays {
    pub history: Vec<f32>,
    pub hands: Vec<f32>,
    pub drawpile: Vec<f32>,
    pub output_mask: Vec<f32>,
    pub policy: Vec<f32>,
    pub value: Vec<f32>,
}

/// Named model inputs, one row per sample
#[derive(Debug, Clone)]
pub struct SampleInputs {
    /// [N, MAX_HISTORY, N_ACTION_FEATURES]
    pub history: Array3<f32>,
    /// [N, HANDS_WIDTH]
    pub hands: Array2<f32>,
    /// [N, MAX_CARDS_IN_DRAW_PILE, NUM_CARD_TYPES]
    pub drawpile: Array3<f32>,
    /// [N, N_OUTPUTS]
    pub output_mask: Array2<f32>,
}

/// Named training targets, one row per sample
#[derive(Debug, Clone)]
pub struct SampleTargets {
    /// [N, N_OUTPUTS]
    pub policy: Array2<f32>,
    /// [N, 1], values in [-1, 1]
    pub value: Array2<f32>,
}

/// Per-sample shapes of the loaded inputs, used to build the model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputShapes {
    pub history: Vec<usize>,
    pub hands: Vec<usize>,
    pub drawpile: Vec<usize>,
    pub output_mask: Vec<usize>,
    pub policy_width: usize,
}

impl Default for InputShapes {
    fn default() -> Self {
        Self {
            history: vec![MAX_HISTORY, N_ACTION_FEATURES],
            hands: vec![HANDS_WIDTH],
            drawpile: vec![MAX_CARDS_IN_DRAW_PILE, NUM_CARD_TYPES],
            output_mask: vec![N_OUTPUTS],
            policy_width: N_OUTPUTS,
        }
    }
}

/// Model inputs for one mini-batch, on a device
#[derive(Debug, Clone)]
pub struct InputBatch<B: Backend> {
    pub history: Tensor<B, 3>,
    pub hands: Tensor<B, 2>,
    pub drawpile: Tensor<B, 3>,
    pub output_mask: Tensor<B, 2>,
}

/// Targets for one mini-batch, on a device
#[derive(Debug, Clone)]
pub struct TargetBatch<B: Backend> {
    pub policy: Tensor<B, 2>,
    pub value: Tensor<B, 2>,
}

#[derive(Debug, Clone)]
pub struct SampleBatch<B: Backend> {
    pub inputs: InputBatch<B>,
    pub targets: TargetBatch<B>,
}

/// Train/validation partition of sample indices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSplit {
    pub train: Vec<usize>,
    pub validation: Vec<usize>,
}

/// Read a stored sample batch and reshape it into named inputs and targets.
///
/// Logs the mean value target as a calibration signal for the value head.
pub fn load_samples(path: &Path) -> Result<(SampleInputs, SampleTargets), TrainError> {
    let set = SampleSet::load(path)?;
    Ok((set.inputs, set.targets))
}

/// A loaded sample batch
#[derive(Debug, Clone)]
pub struct SampleSet {
    pub inputs: SampleInputs,
    pub targets: SampleTargets,
}

impl SampleSet {
    pub fn load(path: &Path) -> Result<Self, TrainError> {
        tracing::info!("Loading samples from {}", path.display());
        let set = Self::from_flat(read_archive(path)?)?;
        tracing::info!("Loaded {} samples", set.len());
        tracing::info!("Mean value of all samples: {:.4}", set.mean_value());
        Ok(set)
    }

    /// Reshape flat arrays into the fixed per-sample shapes.
    /// The sample count is taken from the value targets.
    pub fn from_flat(arrays: FlatArrays) -> Result<Self, TrainError> {
        let n = arrays.value.len();
        if n == 0 {
            return Err(TrainError::EmptyBatch);
        }

        let inputs = SampleInputs {
            history: reshape(X_HISTORY, arrays.history, &[n, MAX_HISTORY, N_ACTION_FEATURES])?,
            hands: reshape(X_HANDS, arrays.hands, &[n, HANDS_WIDTH])?,
            drawpile: reshape(
                X_DRAWPILE,
                arrays.drawpile,
                &[n, MAX_CARDS_IN_DRAW_PILE, NUM_CARD_TYPES],
            )?,
            output_mask: reshape(X_OUTPUT_MASK, arrays.output_mask, &[n, N_OUTPUTS])?,
        };
        let targets = SampleTargets {
            policy: reshape(Y_POLICY, arrays.policy, &[n, N_OUTPUTS])?,
            value: reshape(Y_VALUE, arrays.value, &[n, 1])?,
        };

        Ok(Self { inputs, targets })
    }

    /// Flatten back into storage order
    pub fn to_flat(&self) -> FlatArrays {
        FlatArrays {
            history: self.inputs.history.iter().copied().collect(),
            hands: self.inputs.hands.iter().copied().collect(),
            drawpile: self.inputs.drawpile.iter().copied().collect(),
            output_mask: self.inputs.output_mask.iter().copied().collect(),
            policy: self.targets.policy.iter().copied().collect(),
            value: self.targets.value.iter().copied().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.targets.value.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn mean_value(&self) -> f32 {
        self.targets.value.mean().unwrap_or(0.0)
    }

    /// Per-sample shapes, i.e. the array shapes without the sample axis
    pub fn input_shapes(&self) -> InputShapes {
        InputShapes {
            history: self.inputs.history.shape()[1..].to_vec(),
            hands: self.inputs.hands.shape()[1..].to_vec(),
            drawpile: self.inputs.drawpile.shape()[1..].to_vec(),
            output_mask: self.inputs.output_mask.shape()[1..].to_vec(),
            policy_width: self.targets.policy.ncols(),
        }
    }

    /// Hold out the trailing `validation_split` fraction of the samples
    pub fn split(&self, validation_split: f64) -> Result<DataSplit, TrainError> {
        if !(validation_split > 0.0 && validation_split < 1.0) {
            return Err(TrainError::Config(format!(
                "validation split must be in (0, 1), got {validation_split}"
            )));
        }

        let n = self.len();
        let split_at = (n as f64 * (1.0 - validation_split)) as usize;
        if split_at == 0 || split_at >= n {
            return Err(TrainError::Config(format!(
                "{n} samples cannot be split {:.0}/{:.0} into train and validation sets",
                (1.0 - validation_split) * 100.0,
                validation_split * 100.0
            )));
        }

        Ok(DataSplit {
            train: (0..split_at).collect(),
            validation: (split_at..n).collect(),
        })
    }

    /// Gather the given samples into device tensors
    pub fn batch<B: Backend>(&self, indices: &[usize], device: &B::Device) -> SampleBatch<B> {
        let n = indices.len();

        let inputs = InputBatch {
            history: gather(
                &self.inputs.history,
                indices,
                [n, MAX_HISTORY, N_ACTION_FEATURES],
                device,
            ),
            hands: gather(&self.inputs.hands, indices, [n, HANDS_WIDTH], device),
            drawpile: gather(
                &self.inputs.drawpile,
                indices,
                [n, MAX_CARDS_IN_DRAW_PILE, NUM_CARD_TYPES],
                device,
            ),
            output_mask: gather(&self.inputs.output_mask, indices, [n, N_OUTPUTS], device),
        };
        let targets = TargetBatch {
            policy: gather(&self.targets.policy, indices, [n, N_OUTPUTS], device),
            value: gather(&self.targets.value, indices, [n, 1], device),
        };

        SampleBatch { inputs, targets }
    }
}

fn reshape<D: Dimension>(
    name: &str,
    flat: Vec<f32>,
    dims: &[usize],
) -> Result<Array<f32, D>, TrainError> {
    let len = flat.len();
    let shape_error = || TrainError::Shape {
        name: name.to_string(),
        len,
        shape: dims.to_vec(),
    };

    ArrayD::from_shape_vec(IxDyn(dims), flat)
        .map_err(|_| shape_error())?
        .into_dimensionality::<D>()
        .map_err(|_| shape_error())
}

fn gather<B: Backend, D: Dimension + RemoveAxis, const N: usize>(
    array: &Array<f32, D>,
    indices: &[usize],
    shape: [usize; N],
    device: &B::Device,
) -> Tensor<B, N> {
    let rows: Vec<f32> = array.select(Axis(0), indices).iter().copied().collect();
    Tensor::from_data(TensorData::new(rows, shape), device)
}

fn read_archive(path: &Path) -> Result<FlatArrays, TrainError> {
    let file = File::open(path).map_err(|e| TrainError::io(path, e))?;
    let archive_error = |source| TrainError::Archive {
        path: path.to_path_buf(),
        source,
    };
    let mut npz = NpzReader::new(file).map_err(archive_error)?;
    let names = npz.names().map_err(archive_error)?;

    let mut read = |name: &str| -> Result<Vec<f32>, TrainError> {
        // numpy stores entries as `<name>.npy`
        let index = names
            .iter()
            .position(|entry| entry.strip_suffix(".npy").unwrap_or(entry) == name)
            .ok_or_else(|| TrainError::MissingArray(name.to_string()))?;
        read_flat(&mut npz, index).map_err(|source| TrainError::Decode {
            name: name.to_string(),
            source,
        })
    };

    Ok(FlatArrays {
        history: read(X_HISTORY)?,
        hands: read(X_HANDS)?,
        drawpile: read(X_DRAWPILE)?,
        output_mask: read(X_OUTPUT_MASK)?,
        policy: read(Y_POLICY)?,
        value: read(Y_VALUE)?,
    })
}

/// Read one entry as f32, accepting f64 storage as well
fn read_flat<R: Read + Seek>(
    npz: &mut NpzReader<R>,
    index: usize,
) -> Result<Vec<f32>, ReadNpzError> {
    match npz.by_index::<OwnedRepr<f32>, IxDyn>(index) {
        Ok(array) => Ok(array.iter().copied().collect()),
        Err(err) => match npz.by_index::<OwnedRepr<f64>, IxDyn>(index) {
            Ok(array) => Ok(array.iter().map(|&v| v as f32).collect()),
            Err(_) => Err(err),
        },
    }
}

/// Deterministic, well-formed samples for tests across the crate
#[cfg(test)]
pub(crate) fn synthetic_flat(n: usize) -> FlatArrays {
    let wave = |i: usize, scale: f32| ((i as f32) * scale).sin();

    let history = (0..n * MAX_HISTORY * N_ACTION_FEATURES)
        .map(|i| wave(i, 0.37))
        .collect();
    let hands = (0..n * HANDS_WIDTH)
        .map(|i| if i % 5 == 0 { 1.0 } else { 0.0 })
        .collect();
    let drawpile = (0..n * MAX_CARDS_IN_DRAW_PILE * NUM_CARD_TYPES)
        .map(|i| if i % NUM_CARD_TYPES == (i / 7) % NUM_CARD_TYPES { 1.0 } else { 0.0 })
        .collect();

    let mut output_mask = Vec::with_capacity(n * N_OUTPUTS);
    let mut policy = Vec::with_capacity(n * N_OUTPUTS);
    for sample in 0..n {
        let legal: Vec<bool> = (0..N_OUTPUTS).map(|a| (a + sample) % 3 != 0).collect();
        let num_legal = legal.iter().filter(|&&l| l).count() as f32;
        for &l in &legal {
            output_mask.push(if l { 1.0 } else { 0.0 });
            policy.push(if l { 1.0 / num_legal } else { 0.0 });
        }
    }

    let value = (0..n).map(|i| wave(i, 1.3)).collect();

    FlatArrays {
        history,
        hands,
        drawpile,
        output_mask,
        policy,
        value,
    }
}

/// Store flat arrays as an `.npz` archive in the layout `load` expects
#[cfg(test)]
pub(crate) fn write_archive(path: &Path, arrays: &FlatArrays) {
    let mut npz = ndarray_npy::NpzWriter::new(File::create(path).unwrap());
    for (name, data) in [
        (X_HISTORY, &arrays.history),
        (X_HANDS, &arrays.hands),
        (X_DRAWPILE, &arrays.drawpile),
        (X_OUTPUT_MASK, &arrays.output_mask),
        (Y_POLICY, &arrays.policy),
        (Y_VALUE, &arrays.value),
    ] {
        npz.add_array(name, &ndarray::Array1::from(data.clone())).unwrap();
    }
    npz.finish().unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use ndarray::Array1;
    use ndarray_npy::NpzWriter;
    use proptest::prelude::*;

    #[test]
    fn test_n_outputs() {
        assert_eq!(N_OUTPUTS, 31);
        assert_eq!(HANDS_WIDTH, 69);
    }

    #[test]
    fn test_load_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("samples.npz");
        let flat = synthetic_flat(4);
        write_archive(&path, &flat);

        let (inputs, targets) = load_samples(&path).unwrap();
        assert_eq!(inputs.history.shape(), &[4, MAX_HISTORY, N_ACTION_FEATURES]);
        assert_eq!(inputs.hands.shape(), &[4, HANDS_WIDTH]);
        assert_eq!(inputs.drawpile.shape(), &[4, MAX_CARDS_IN_DRAW_PILE, NUM_CARD_TYPES]);
        assert_eq!(inputs.output_mask.shape(), &[4, N_OUTPUTS]);
        assert_eq!(targets.policy.shape(), &[4, N_OUTPUTS]);
        assert_eq!(targets.value.shape(), &[4, 1]);
        assert_eq!(targets.value[[2, 0]], flat.value[2]);
    }

    #[test]
    fn test_load_accepts_f64_arrays() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("samples.npz");
        let flat = synthetic_flat(2);

        let mut npz = NpzWriter::new(File::create(&path).unwrap());
        for (name, data) in [
            (X_HISTORY, &flat.history),
            (X_HANDS, &flat.hands),
            (X_DRAWPILE, &flat.drawpile),
            (X_OUTPUT_MASK, &flat.output_mask),
            (Y_POLICY, &flat.policy),
            (Y_VALUE, &flat.value),
        ] {
            let wide: Array1<f64> = data.iter().map(|&v| v as f64).collect();
            npz.add_array(name, &wide).unwrap();
        }
        npz.finish().unwrap();

        let set = SampleSet::load(&path).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.targets.value[[1, 0]], flat.value[1]);
    }

    #[test]
    fn test_missing_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("samples.npz");
        let flat = synthetic_flat(1);

        let mut npz = NpzWriter::new(File::create(&path).unwrap());
        npz.add_array(Y_VALUE, &Array1::from(flat.value.clone())).unwrap();
        npz.finish().unwrap();

        match SampleSet::load(&path) {
            Err(TrainError::MissingArray(name)) => assert_eq!(name, X_HISTORY),
            other => panic!("expected missing array, got {other:?}"),
        }
    }

    #[test]
    fn test_size_mismatch_is_shape_error() {
        let mut flat = synthetic_flat(3);
        flat.drawpile.pop();

        match SampleSet::from_flat(flat) {
            Err(TrainError::Shape { name, shape, .. }) => {
                assert_eq!(name, X_DRAWPILE);
                assert_eq!(shape, vec![3, MAX_CARDS_IN_DRAW_PILE, NUM_CARD_TYPES]);
            }
            other => panic!("expected shape error, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_batch() {
        assert!(matches!(
            SampleSet::from_flat(FlatArrays::default()),
            Err(TrainError::EmptyBatch)
        ));
    }

    #[test]
    fn test_input_shapes_match_constants() {
        let set = SampleSet::from_flat(synthetic_flat(2)).unwrap();
        assert_eq!(set.input_shapes(), InputShapes::default());
    }

    #[test]
    fn test_split_holds_out_tail() {
        let set = SampleSet::from_flat(synthetic_flat(20)).unwrap();
        let split = set.split(0.1).unwrap();
        assert_eq!(split.train, (0..18).collect::<Vec<_>>());
        assert_eq!(split.validation, vec![18, 19]);

        assert!(matches!(set.split(0.0), Err(TrainError::Config(_))));
        assert!(matches!(set.split(1.0), Err(TrainError::Config(_))));

        let tiny = SampleSet::from_flat(synthetic_flat(1)).unwrap();
        assert!(matches!(tiny.split(0.1), Err(TrainError::Config(_))));
    }

    #[test]
    fn test_batch_gathers_rows() {
        let set = SampleSet::from_flat(synthetic_flat(5)).unwrap();
        let device = Default::default();
        let batch = set.batch::<NdArray>(&[3, 1], &device);

        assert_eq!(batch.inputs.history.dims(), [2, MAX_HISTORY, N_ACTION_FEATURES]);
        assert_eq!(batch.inputs.output_mask.dims(), [2, N_OUTPUTS]);
        assert_eq!(batch.targets.value.dims(), [2, 1]);

        let values = batch.targets.value.into_data().to_vec::<f32>().unwrap();
        assert_eq!(values, vec![set.targets.value[[3, 0]], set.targets.value[[1, 0]]]);

        let hands = batch.inputs.hands.into_data().to_vec::<f32>().unwrap();
        let expected: Vec<f32> = set.inputs.hands.row(3).iter().copied().collect();
        assert_eq!(&hands[..HANDS_WIDTH], expected.as_slice());
    }

    proptest! {
        #[test]
        fn reshape_preserves_order(n in 1usize..6, offset in -10.0f32..10.0) {
            let mut flat = synthetic_flat(n);
            for (i, v) in flat.history.iter_mut().enumerate() {
                *v = i as f32 + offset;
            }

            let set = SampleSet::from_flat(flat.clone()).unwrap();
            let back = set.to_flat();
            prop_assert_eq!(back.history, flat.history);
            prop_assert_eq!(back.hands, flat.hands);
            prop_assert_eq!(back.drawpile, flat.drawpile);
            prop_assert_eq!(back.output_mask, flat.output_mask);
            prop_assert_eq!(back.policy, flat.policy);
            prop_assert_eq!(back.value, flat.value);
        }
    }
}
