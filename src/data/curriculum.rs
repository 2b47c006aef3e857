//! Sequence-length curriculum
//!
//! Two curricula exist. The scheduler-driven one rewrites the raw batch
//! (truncate or reshape) before it is split into tokens and labels. The
//! legacy, argument-driven one leaves the raw batch alone and instead cuts
//! the derived tensors down to the curriculum length at every place that
//! consumes them; all of those places go through [`effective_seq_len`].

use candle_core::{Result, Tensor};
use std::collections::HashMap;

use crate::config::TrainingStepConfig;

/// Difficulty key selecting truncate mode
pub const SEQLEN_TRUNCATE: &str = "seqlen_truncate";
/// Difficulty key selecting reshape mode
pub const SEQLEN_RESHAPE: &str = "seqlen_reshape";

/// How the raw batch is adapted to the current sequence length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncationMode {
    #[default]
    None,
    /// Keep the first `current_seqlen + 1` columns
    Truncate,
    /// Repack the same tokens into more, shorter rows
    Reshape,
}

/// Curriculum state for one step. Written by the scheduler before the step,
/// read-only during it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CurriculumState {
    pub current_seqlen: usize,
    pub truncation_mode: TruncationMode,
}

impl CurriculumState {
    /// Create a state, rejecting lengths above the configured maximum
    pub fn new(
        current_seqlen: usize,
        truncation_mode: TruncationMode,
        max_seqlen: usize,
    ) -> crate::Result<Self> {
        if current_seqlen == 0 || current_seqlen > max_seqlen {
            return Err(crate::PretrainError::Precondition(format!(
                "curriculum seqlen {} outside 1..={}",
                current_seqlen, max_seqlen
            )));
        }
        Ok(Self {
            current_seqlen,
            truncation_mode,
        })
    }

    /// Full-length state, no curriculum
    pub fn disabled(max_seqlen: usize) -> Self {
        Self {
            current_seqlen: max_seqlen,
            truncation_mode: TruncationMode::None,
        }
    }

    /// Parse the scheduler's current difficulties.
    ///
    /// `seqlen_truncate` takes precedence over `seqlen_reshape`; with neither
    /// key the step runs at full length.
    pub fn from_difficulties(
        difficulties: &HashMap<String, usize>,
        max_seqlen: usize,
    ) -> crate::Result<Self> {
        if let Some(&seqlen) = difficulties.get(SEQLEN_TRUNCATE) {
            Self::new(seqlen, TruncationMode::Truncate, max_seqlen)
        } else if let Some(&seqlen) = difficulties.get(SEQLEN_RESHAPE) {
            Self::new(seqlen, TruncationMode::Reshape, max_seqlen)
        } else {
            Ok(Self::disabled(max_seqlen))
        }
    }
}

/// Sequence length every consumer of one step's tensors must agree on.
///
/// Only the legacy curriculum shortens it; the scheduler-driven curriculum
/// has already shortened the raw batch itself.
pub fn effective_seq_len(config: &TrainingStepConfig, state: &CurriculumState) -> usize {
    if config.curriculum_learning_legacy && state.current_seqlen < config.seq_length {
        state.current_seqlen
    } else {
        config.seq_length
    }
}

/// Narrow `t` along `dim` to at most `len` entries
pub fn truncate_seq(t: &Tensor, dim: usize, len: usize) -> Result<Tensor> {
    let size = t.dim(dim)?;
    if len >= size {
        Ok(t.clone())
    } else {
        t.narrow(dim, 0, len)?.contiguous()
    }
}

/// Apply the scheduler-driven curriculum to a raw `[rows, seq_len + 1]` batch
pub fn apply(text: &Tensor, config: &TrainingStepConfig, state: &CurriculumState) -> Result<Tensor> {
    if !config.data_efficiency_curriculum_learning
        || state.current_seqlen >= config.seq_length
    {
        return Ok(text.clone());
    }

    match state.truncation_mode {
        TruncationMode::None => Ok(text.clone()),
        TruncationMode::Truncate => truncate_seq(text, 1, state.current_seqlen + 1),
        TruncationMode::Reshape => reshape(text, state.current_seqlen),
    }
}

/// Repack `text` into rows of `current_seqlen + 1` tokens.
///
/// The evenly divisible prefix of every row is cut into full-width rows, each
/// row's last `current_seqlen + 1` columns are appended as extra rows, and
/// the result is capped at the token budget of the input. A row count above
/// one is forced even.
fn reshape(text: &Tensor, current_seqlen: usize) -> Result<Tensor> {
    let (rows, cols) = text.dims2()?;
    let width = current_seqlen + 1;
    if width >= cols {
        return Ok(text.clone());
    }

    let orig_num_token = rows * cols;
    let reshape_len = (cols / width) * width;

    let head = text
        .narrow(1, 0, reshape_len)?
        .contiguous()?
        .reshape((rows * (reshape_len / width), width))?;
    let tail = text.narrow(1, cols - width, width)?;
    let packed = Tensor::cat(&[&head, &tail], 0)?;

    let mut num_row = (orig_num_token / width).min(packed.dim(0)?);
    if num_row > 1 && num_row % 2 != 0 {
        num_row -= 1;
    }

    log::debug!(
        "curriculum reshape: [{}, {}] -> [{}, {}]",
        rows,
        cols,
        num_row,
        width
    );
    packed.narrow(0, 0, num_row)?.contiguous()
}
