/// NumPy token dataset (.npy format) of pre-tokenized `[N, seq_len + 1]` samples
use candle_core::{Device, Result, Tensor};
use ndarray::{Array2, ArrayView1};
use ndarray_npy::ReadNpyExt;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use super::{BatchDataLoader, RawBatch};

/// Token matrix file inside a dataset directory
pub const TEXT_FILE: &str = "text.npy";

/// Metadata from dataset.json
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatasetMetadata {
    pub vocab_size: usize,
    /// Training sequence length; samples carry one extra token
    pub seq_len: usize,
    #[serde(default)]
    pub eod_token: Option<u32>,
    #[serde(default)]
    pub description: String,
}

/// Samples loaded from `text.npy`
pub struct NumpyTokenDataset {
    text: Array2<u32>, // [N, seq_len + 1]
    metadata: DatasetMetadata,
}

impl NumpyTokenDataset {
    /// Load from directory containing text.npy and an optional dataset.json
    pub fn from_directory<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let dir = path.as_ref();

        log::info!("Loading token dataset from: {:?}", dir);

        // Token matrix, saved as i64 by the tokenizer pipeline
        let text_path = dir.join(TEXT_FILE);
        let text_i64 = <Array2<i64> as ReadNpyExt>::read_npy(File::open(&text_path)?).map_err(
            |e| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("Failed to read {}: {}", TEXT_FILE, e),
                )
            },
        )?;

        if text_i64.iter().any(|&tok| tok < 0 || tok > u32::MAX as i64) {
            return Err(crate::PretrainError::Config(format!(
                "{} contains token ids outside the u32 range",
                TEXT_FILE
            )));
        }
        let text = text_i64.mapv(|x| x as u32);

        let metadata_path = dir.join("dataset.json");
        let metadata: DatasetMetadata = if metadata_path.exists() {
            let reader = BufReader::new(File::open(&metadata_path)?);
            serde_json::from_reader(reader)?
        } else {
            log::warn!("dataset.json not found, deriving metadata from {}", TEXT_FILE);
            DatasetMetadata {
                vocab_size: text.iter().copied().max().map_or(0, |m| m as usize + 1),
                seq_len: text.ncols().saturating_sub(1),
                eod_token: None,
                description: "Unknown".to_string(),
            }
        };

        if text.ncols() != metadata.seq_len + 1 {
            return Err(crate::PretrainError::Config(format!(
                "Shape mismatch: samples have {} columns, expected seq_len + 1 = {}",
                text.ncols(),
                metadata.seq_len + 1
            )));
        }

        log::info!(
            "Dataset loaded: {} samples, seq_len={}, vocab_size={}",
            text.nrows(),
            metadata.seq_len,
            metadata.vocab_size
        );

        Ok(Self { text, metadata })
    }

    /// Get number of samples
    pub fn len(&self) -> usize {
        self.text.nrows()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.text.nrows() == 0
    }

    pub fn metadata(&self) -> &DatasetMetadata {
        &self.metadata
    }

    /// Sample at index, `seq_len + 1` tokens
    pub fn get(&self, idx: usize) -> ArrayView1<u32> {
        self.text.row(idx)
    }
}

/// Batches over a [`NumpyTokenDataset`]; the last partial batch is dropped
/// so every step sees the same batch size
pub struct NumpyTokenLoader {
    dataset: NumpyTokenDataset,
    batch_size: usize,
    current_idx: usize,
    indices: Vec<usize>,
    shuffle: bool,
}

impl NumpyTokenLoader {
    pub fn new(dataset: NumpyTokenDataset, batch_size: usize, shuffle: bool) -> Self {
        let mut indices: Vec<usize> = (0..dataset.len()).collect();

        if shuffle {
            use rand::seq::SliceRandom;
            indices.shuffle(&mut rand::thread_rng());
        }

        Self {
            dataset,
            batch_size: batch_size.max(1),
            current_idx: 0,
            indices,
            shuffle,
        }
    }

    pub fn dataset(&self) -> &NumpyTokenDataset {
        &self.dataset
    }
}

impl BatchDataLoader for NumpyTokenLoader {
    fn next_batch(&mut self, device: &Device) -> Result<Option<RawBatch>> {
        let end_idx = self.current_idx + self.batch_size;
        if end_idx > self.indices.len() {
            return Ok(None);
        }

        let width = self.dataset.metadata.seq_len + 1;
        let mut data = Vec::with_capacity(self.batch_size * width);
        for &idx in &self.indices[self.current_idx..end_idx] {
            data.extend(self.dataset.get(idx).iter().copied());
        }
        self.current_idx = end_idx;

        let text = Tensor::from_vec(data, (self.batch_size, width), device)?;
        Ok(Some(RawBatch::new(text)))
    }

    fn reset(&mut self) {
        self.current_idx = 0;

        if self.shuffle {
            use rand::seq::SliceRandom;
            self.indices.shuffle(&mut rand::thread_rng());
        }
    }

    fn num_batches(&self) -> usize {
        self.dataset.len() / self.batch_size
    }
}
