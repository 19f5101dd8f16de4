pub mod error;
pub mod training;

// Re-export commonly used types for convenience
pub use error::TrainError;
pub use training::{PipelineOptions, TrainConfig, run};
