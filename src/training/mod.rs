//! Supervised training of the alphacats policy/value network
//!
//! Learns from self-play samples stored as `.npz` archives and writes a
//! full-precision model plus a half precision copy for serving.
//!
//! # Pipeline
//!
//! ```text
//! samples.npz
//!     │
//!     ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  SampleSet::load                                            │
//! │  - Reshapes flat arrays into history/hands/drawpile/mask    │
//! │  - Holds out the tail of the batch for validation           │
//! └─────────────────────────────────────────────────────────────┘
//!     │
//!     ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  build_model                                                │
//! │  - Three branches fused into a masked policy + tanh value   │
//! └─────────────────────────────────────────────────────────────┘
//!     │
//!     ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Trainer::fit                                               │
//! │  - Adam, early stopping on val_loss, abort on NaN           │
//! └─────────────────────────────────────────────────────────────┘
//!     │
//!     ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  artifacts + InferenceOptimizer                             │
//! │  - original/ (f32), weights.mpk, optimized model (f16)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod artifacts;
pub mod context;
pub mod early_stopping;
pub mod export;
pub mod loss;
pub mod metrics;
pub mod network;
pub mod pipeline;
pub mod samples;
pub mod trainer;

// Re-export commonly used types
pub use artifacts::{ModelSignature, Precision};
pub use context::ComputeContext;
pub use early_stopping::{EarlyStopping, Verdict};
pub use export::{HalfPrecisionOptimizer, InferenceOptimizer};
pub use loss::{BatchStats, JointLoss};
pub use metrics::{EpochMetrics, TrainingHistory};
pub use network::{NetConfig, PolicyValueNet, build_model, masked_softmax};
pub use pipeline::{PipelineOptions, RunSummary, Stage, run};
pub use samples::{N_OUTPUTS, SampleSet, load_samples};
pub use trainer::{TrainConfig, Trainer, select_batch_size};
