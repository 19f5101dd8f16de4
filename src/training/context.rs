//! Numeric compute context for a training run

use burn::prelude::*;

/// Backend device plus the seed every random source of the run derives from.
///
/// Acquired once at startup and passed explicitly to each stage. Dropping it
/// ends the run's use of the device.
#[derive(Debug)]
pub struct ComputeContext<B: Backend> {
    device: B::Device,
    seed: u64,
}

impl<B: Backend> ComputeContext<B> {
    pub fn acquire(device: B::Device, seed: u64) -> Self {
        B::seed(seed);
        tracing::info!("Acquired compute context on {:?} (seed {})", device, seed);
        Self { device, seed }
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }
}

impl<B: Backend> Drop for ComputeContext<B> {
    fn drop(&mut self) {
        tracing::debug!("Released compute context on {:?}", self.device);
    }
}
