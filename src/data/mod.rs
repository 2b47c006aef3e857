/// Data path of the training step: raw batches, curriculum, batch building
pub mod batch;
pub mod curriculum;
pub mod numpy_dataset;

pub use batch::{BatchBuilder, PreparedBatch};
pub use curriculum::{effective_seq_len, CurriculumState, TruncationMode};
pub use numpy_dataset::{DatasetMetadata, NumpyTokenDataset, NumpyTokenLoader};

use candle_core::{Device, Result, Tensor};

/// Broadcast key of the token matrix
pub const TEXT_KEY: &str = "text";

/// One raw batch as produced by the data pipeline
#[derive(Debug, Clone)]
pub struct RawBatch {
    /// Token matrix `[batch, seq_len + 1]`, U32
    pub text: Tensor,
}

impl RawBatch {
    pub fn new(text: Tensor) -> Self {
        Self { text }
    }
}

/// Source of raw batches; only the designated rank of a group pulls from it
pub trait BatchDataLoader {
    /// Get next raw batch, `None` at the end of the epoch
    fn next_batch(&mut self, device: &Device) -> Result<Option<RawBatch>>;

    /// Reset loader for new epoch
    fn reset(&mut self);

    /// Get total number of batches
    fn num_batches(&self) -> usize;
}

/// Loader over batches already in memory, mostly for tests and demos
pub struct InMemoryLoader {
    batches: Vec<Tensor>,
    position: usize,
}

impl InMemoryLoader {
    pub fn new(batches: Vec<Tensor>) -> Self {
        Self {
            batches,
            position: 0,
        }
    }
}

impl BatchDataLoader for InMemoryLoader {
    fn next_batch(&mut self, device: &Device) -> Result<Option<RawBatch>> {
        let Some(text) = self.batches.get(self.position) else {
            return Ok(None);
        };
        self.position += 1;
        Ok(Some(RawBatch::new(text.to_device(device)?)))
    }

    fn reset(&mut self) {
        self.position = 0;
    }

    fn num_batches(&self) -> usize {
        self.batches.len()
    }
}
