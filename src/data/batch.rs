//! Batch builder
//!
//! Turns one raw `[batch, seq_len + 1]` token matrix into the tensors a
//! training step consumes, identically on every rank of the tensor-parallel
//! group, then keeps this rank's slice of the sequence axis.

use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;

use super::curriculum::{self, effective_seq_len, truncate_seq, CurriculumState};
use super::{BatchDataLoader, RawBatch, TEXT_KEY};
use crate::config::{SequenceParallelMode, TrainingStepConfig};
use crate::distributed::ProcessGroups;
use crate::utils::ltor_masks_and_position_ids;

/// Tensors for one step on one rank
#[derive(Debug, Clone)]
pub struct PreparedBatch {
    /// Input ids `[batch, seq]`, U32
    pub tokens: Tensor,
    /// Next-token targets `[batch, seq]`, U32
    pub labels: Tensor,
    /// `[batch, seq]`, F32; 1.0 where the loss counts
    pub loss_mask: Tensor,
    /// `[b_or_1, 1, seq, seq]`, U8, 1 where attention is blocked.
    /// `None` on the fused-attention path.
    pub attention_mask: Option<Tensor>,
    /// `[batch, seq]`, U32
    pub position_ids: Tensor,
}

impl PreparedBatch {
    /// Sequence length of the (possibly sliced) tokens
    pub fn seq_len(&self) -> candle_core::Result<usize> {
        self.tokens.dim(1)
    }

    /// Number of tokens fed to the model on this rank
    pub fn num_tokens(&self) -> usize {
        self.tokens.elem_count()
    }
}

/// Builds [`PreparedBatch`]es for one rank
pub struct BatchBuilder<'a> {
    config: &'a TrainingStepConfig,
    groups: &'a ProcessGroups,
}

impl<'a> BatchBuilder<'a> {
    pub fn new(config: &'a TrainingStepConfig, groups: &'a ProcessGroups) -> Self {
        Self { config, groups }
    }

    /// Pull the next raw batch on the group's source rank and broadcast it.
    ///
    /// Non-source ranks never touch their loader and may pass `None`.
    pub fn broadcast_raw<L: BatchDataLoader + ?Sized>(
        &self,
        loader: Option<&mut L>,
        device: &Device,
    ) -> crate::Result<RawBatch> {
        let group = &self.groups.tensor_parallel;

        let data = match loader {
            Some(loader) if group.is_source() => loader.next_batch(device)?.map(|raw| {
                let mut data = HashMap::new();
                data.insert(TEXT_KEY.to_string(), raw.text);
                data
            }),
            _ => None,
        };

        let mut received = group.broadcast(&[TEXT_KEY], data.as_ref(), DType::U32)?;
        let text = received.remove(TEXT_KEY).ok_or_else(|| {
            crate::PretrainError::Distributed(format!("broadcast did not deliver '{TEXT_KEY}'"))
        })?;
        Ok(RawBatch::new(text))
    }

    /// Broadcast, then derive this rank's batch
    pub fn prepare<L: BatchDataLoader + ?Sized>(
        &self,
        loader: Option<&mut L>,
        curriculum: &CurriculumState,
        device: &Device,
    ) -> crate::Result<PreparedBatch> {
        let raw = self.broadcast_raw(loader, device)?;
        self.prepare_raw(&raw, curriculum)
    }

    /// Derive this rank's batch from an already broadcast raw batch
    pub fn prepare_raw(
        &self,
        raw: &RawBatch,
        curriculum: &CurriculumState,
    ) -> crate::Result<PreparedBatch> {
        let config = self.config;

        let text = curriculum::apply(&raw.text, config, curriculum)?;
        let batch = split_and_mask(&text, config)?;

        // Legacy curriculum: cut everything down to the curriculum length
        let batch = truncate_to(batch, effective_seq_len(config, curriculum))?;

        let (world_size, rank) = self
            .groups
            .sequence_parallel_topology(config.sequence_parallel);
        let batch = slice_for_sequence_parallel(batch, config.sequence_parallel, world_size, rank)?;

        log::debug!(
            "prepared batch: tokens {:?}, labels {:?}, sp rank {}/{}",
            batch.tokens.dims(),
            batch.labels.dims(),
            rank,
            world_size
        );
        Ok(batch)
    }
}

/// Split `[batch, L+1]` into tokens `[:, 0..L]` and labels `[:, 1..L+1]`
/// and derive the masks
pub fn split_and_mask(text: &Tensor, config: &TrainingStepConfig) -> crate::Result<PreparedBatch> {
    let cols = text.dim(1)?;
    if cols < 2 {
        return Err(crate::PretrainError::Precondition(format!(
            "raw batch needs at least 2 columns, got {cols}"
        )));
    }

    let text = text.to_dtype(DType::U32)?;
    let tokens = text.narrow(1, 0, cols - 1)?.contiguous()?;
    let labels = text.narrow(1, 1, cols - 1)?.contiguous()?;

    let (attention_mask, loss_mask, position_ids) = ltor_masks_and_position_ids(
        &tokens,
        config.eod_token,
        config.reset_position_ids,
        config.reset_attention_mask,
        config.eod_mask_loss,
        config.use_flash_attn,
    )?;

    Ok(PreparedBatch {
        tokens,
        labels,
        loss_mask,
        attention_mask,
        position_ids,
    })
}

/// Truncate every sequence-axis tensor of `batch` to `len`
pub fn truncate_to(batch: PreparedBatch, len: usize) -> candle_core::Result<PreparedBatch> {
    if len >= batch.tokens.dim(1)? {
        return Ok(batch);
    }

    let attention_mask = match batch.attention_mask {
        Some(mask) => Some(truncate_seq(&truncate_seq(&mask, 2, len)?, 3, len)?),
        None => None,
    };

    Ok(PreparedBatch {
        tokens: truncate_seq(&batch.tokens, 1, len)?,
        labels: truncate_seq(&batch.labels, 1, len)?,
        loss_mask: truncate_seq(&batch.loss_mask, 1, len)?,
        attention_mask,
        position_ids: truncate_seq(&batch.position_ids, 1, len)?,
    })
}

/// Keep rank `rank`'s contiguous `seq / world_size` slice of tokens and
/// position ids. Labels are sliced only in [`SequenceParallelMode::Dedicated`],
/// which also keeps the attention mask's diagonal block for the slice, so
/// a rank attends within its own tokens. The loss mask stays whole: the
/// per-token loss is gathered back to full length before it is applied.
pub fn slice_for_sequence_parallel(
    batch: PreparedBatch,
    mode: SequenceParallelMode,
    world_size: usize,
    rank: usize,
) -> crate::Result<PreparedBatch> {
    let seq_length = batch.tokens.dim(1)?;
    if world_size == 0 || seq_length % world_size != 0 {
        return Err(crate::PretrainError::Precondition(format!(
            "sequence length {} is not divisible by sequence parallel world size {}",
            seq_length, world_size
        )));
    }
    if world_size == 1 {
        return Ok(batch);
    }

    let sub_seq_length = seq_length / world_size;
    let sub_seq_start = rank * sub_seq_length;

    let slice = |t: &Tensor| t.narrow(1, sub_seq_start, sub_seq_length)?.contiguous();

    let (labels, attention_mask) = match mode {
        SequenceParallelMode::Dedicated => {
            let mask = match batch.attention_mask {
                Some(mask) => Some(
                    mask.narrow(2, sub_seq_start, sub_seq_length)?
                        .narrow(3, sub_seq_start, sub_seq_length)?
                        .contiguous()?,
                ),
                None => None,
            };
            (slice(&batch.labels)?, mask)
        }
        SequenceParallelMode::TensorParallel | SequenceParallelMode::Disabled => {
            (batch.labels, batch.attention_mask)
        }
    };

    Ok(PreparedBatch {
        tokens: slice(&batch.tokens)?,
        labels,
        loss_mask: batch.loss_mask,
        attention_mask,
        position_ids: slice(&batch.position_ids)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::curriculum::TruncationMode;
    use crate::data::InMemoryLoader;

    fn step_config(seq_length: usize) -> TrainingStepConfig {
        TrainingStepConfig {
            seq_length,
            eod_token: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_split_tokens_and_labels() -> crate::Result<()> {
        let device = Device::Cpu;
        let config = step_config(4);
        let groups = ProcessGroups::single();
        let builder = BatchBuilder::new(&config, &groups);

        let raw = RawBatch::new(Tensor::new(&[[1u32, 2, 3, 4, 5]], &device)?);
        let batch = builder.prepare_raw(&raw, &CurriculumState::disabled(4))?;

        assert_eq!(batch.tokens.to_vec2::<u32>()?, vec![vec![1, 2, 3, 4]]);
        assert_eq!(batch.labels.to_vec2::<u32>()?, vec![vec![2, 3, 4, 5]]);
        assert_eq!(batch.position_ids.to_vec2::<u32>()?, vec![vec![0, 1, 2, 3]]);
        assert_eq!(batch.loss_mask.dims(), &[1, 4]);
        assert_eq!(batch.attention_mask.as_ref().map(|m| m.dims().to_vec()), Some(vec![1, 1, 4, 4]));

        Ok(())
    }

    #[test]
    fn test_truncate_curriculum_before_split() -> crate::Result<()> {
        let device = Device::Cpu;
        let config = TrainingStepConfig {
            data_efficiency_curriculum_learning: true,
            ..step_config(4)
        };
        let groups = ProcessGroups::single();
        let builder = BatchBuilder::new(&config, &groups);

        let mut loader = InMemoryLoader::new(vec![Tensor::new(&[[1u32, 2, 3, 4, 5]], &device)?]);
        let state = CurriculumState::new(2, TruncationMode::Truncate, 4)?;
        let batch = builder.prepare(Some(&mut loader), &state, &device)?;

        assert_eq!(batch.tokens.to_vec2::<u32>()?, vec![vec![1, 2]]);
        assert_eq!(batch.labels.to_vec2::<u32>()?, vec![vec![2, 3]]);

        Ok(())
    }

    #[test]
    fn test_legacy_curriculum_truncates_every_tensor() -> crate::Result<()> {
        let device = Device::Cpu;
        let config = TrainingStepConfig {
            curriculum_learning_legacy: true,
            ..step_config(6)
        };
        let groups = ProcessGroups::single();
        let builder = BatchBuilder::new(&config, &groups);

        let raw = RawBatch::new(Tensor::arange(1u32, 8, &device)?.reshape((1, 7))?);
        let state = CurriculumState::new(3, TruncationMode::None, 6)?;
        let batch = builder.prepare_raw(&raw, &state)?;

        assert_eq!(batch.tokens.dims(), &[1, 3]);
        assert_eq!(batch.labels.dims(), &[1, 3]);
        assert_eq!(batch.loss_mask.dims(), &[1, 3]);
        assert_eq!(batch.position_ids.dims(), &[1, 3]);
        assert_eq!(batch.attention_mask.map(|m| m.dims().to_vec()), Some(vec![1, 1, 3, 3]));

        Ok(())
    }

    #[test]
    fn test_sequence_parallel_slices_reassemble() -> crate::Result<()> {
        let device = Device::Cpu;
        let config = step_config(8);
        let raw = Tensor::arange(1u32, 19, &device)?.reshape((2, 9))?;
        let full = split_and_mask(&raw, &config)?;

        for world_size in [1usize, 2, 4, 8] {
            let mut tokens = Vec::new();
            let mut positions = Vec::new();
            for rank in 0..world_size {
                let sliced = slice_for_sequence_parallel(
                    full.clone(),
                    SequenceParallelMode::Dedicated,
                    world_size,
                    rank,
                )?;
                assert_eq!(sliced.tokens.dim(1)?, 8 / world_size);
                tokens.push(sliced.tokens);
                positions.push(sliced.position_ids);
            }

            let tokens = Tensor::cat(&tokens, 1)?;
            let positions = Tensor::cat(&positions, 1)?;
            assert_eq!(tokens.to_vec2::<u32>()?, full.tokens.to_vec2::<u32>()?);
            assert_eq!(positions.to_vec2::<u32>()?, full.position_ids.to_vec2::<u32>()?);
        }

        Ok(())
    }

    #[test]
    fn test_two_rank_slicing_scenario() -> crate::Result<()> {
        let device = Device::Cpu;
        let config = step_config(4);
        let full = split_and_mask(&Tensor::new(&[[1u32, 2, 3, 4, 5]], &device)?, &config)?;

        let rank0 = slice_for_sequence_parallel(full.clone(), SequenceParallelMode::Dedicated, 2, 0)?;
        let rank1 = slice_for_sequence_parallel(full, SequenceParallelMode::Dedicated, 2, 1)?;

        assert_eq!(rank0.tokens.to_vec2::<u32>()?, vec![vec![1, 2]]);
        assert_eq!(rank1.tokens.to_vec2::<u32>()?, vec![vec![3, 4]]);
        assert_eq!(rank0.labels.to_vec2::<u32>()?, vec![vec![2, 3]]);
        assert_eq!(rank1.labels.to_vec2::<u32>()?, vec![vec![4, 5]]);

        Ok(())
    }

    #[test]
    fn test_dedicated_slice_keeps_diagonal_mask_block() -> crate::Result<()> {
        let device = Device::Cpu;
        let config = TrainingStepConfig {
            reset_attention_mask: true,
            ..step_config(4)
        };
        // End of document after the first token, so rank 1's block
        // differs from a plain causal mask only through the reset
        let full = split_and_mask(&Tensor::new(&[[7u32, 0, 3, 4, 5]], &device)?, &config)?;
        let full_mask = full.attention_mask.clone().expect("explicit mask");

        for rank in 0..2 {
            let sliced =
                slice_for_sequence_parallel(full.clone(), SequenceParallelMode::Dedicated, 2, rank)?;
            let mask = sliced.attention_mask.expect("mask kept");
            assert_eq!(mask.dims(), &[1, 1, 2, 2]);

            let block = full_mask.narrow(2, rank * 2, 2)?.narrow(3, rank * 2, 2)?;
            assert_eq!(
                mask.flatten_all()?.to_vec1::<u8>()?,
                block.flatten_all()?.to_vec1::<u8>()?
            );
            assert_eq!(sliced.loss_mask.dims(), &[1, 4]);
        }

        let fused = TrainingStepConfig {
            use_flash_attn: true,
            ..step_config(4)
        };
        let full = split_and_mask(&Tensor::new(&[[1u32, 2, 3, 4, 5]], &device)?, &fused)?;
        let sliced = slice_for_sequence_parallel(full, SequenceParallelMode::Dedicated, 2, 1)?;
        assert!(sliced.attention_mask.is_none());

        Ok(())
    }

    #[test]
    fn test_tensor_parallel_mode_keeps_full_labels() -> crate::Result<()> {
        let device = Device::Cpu;
        let config = step_config(4);
        let full = split_and_mask(&Tensor::new(&[[1u32, 2, 3, 4, 5]], &device)?, &config)?;

        let sliced =
            slice_for_sequence_parallel(full, SequenceParallelMode::TensorParallel, 2, 1)?;
        assert_eq!(sliced.tokens.to_vec2::<u32>()?, vec![vec![3, 4]]);
        assert_eq!(sliced.labels.to_vec2::<u32>()?, vec![vec![2, 3, 4, 5]]);

        Ok(())
    }

    #[test]
    fn test_indivisible_sequence_is_rejected() -> crate::Result<()> {
        let device = Device::Cpu;
        let config = step_config(5);
        let full = split_and_mask(&Tensor::new(&[[1u32, 2, 3, 4, 5, 6]], &device)?, &config)?;

        let err = slice_for_sequence_parallel(full, SequenceParallelMode::Dedicated, 2, 0);
        assert!(matches!(err, Err(crate::PretrainError::Precondition(_))));

        Ok(())
    }

    #[test]
    fn test_exhausted_loader_fails_broadcast() -> crate::Result<()> {
        let device = Device::Cpu;
        let config = step_config(4);
        let groups = ProcessGroups::single();
        let builder = BatchBuilder::new(&config, &groups);

        let mut loader = InMemoryLoader::new(Vec::new());
        let err = builder.prepare(Some(&mut loader), &CurriculumState::disabled(4), &device);
        assert!(matches!(err, Err(crate::PretrainError::Precondition(_))));

        Ok(())
    }
}
