//! One training step on the monolithic (non-pipelined) path

use candle_core::Device;

use super::distill::DistillationEvaluator;
use super::loss::{self, LossBundle, LossContext};
use crate::config::{SequenceParallelMode, TrainingMode, TrainingStepConfig};
use crate::data::batch::{BatchBuilder, PreparedBatch};
use crate::data::curriculum::{effective_seq_len, truncate_seq, CurriculumState};
use crate::data::BatchDataLoader;
use crate::distributed::ProcessGroups;
use crate::models::{vocab_cross_entropy, StagedLanguageModel};

/// Everything a step reads; nothing in it changes during the step
#[derive(Clone, Copy)]
pub struct StepContext<'a> {
    pub config: &'a TrainingStepConfig,
    pub curriculum: &'a CurriculumState,
    pub groups: &'a ProcessGroups,
    pub device: &'a Device,
}

impl<'a> StepContext<'a> {
    pub fn loss_context(&self) -> LossContext<'a> {
        LossContext {
            config: self.config,
            curriculum: self.curriculum,
            data_parallel: self.groups.data_parallel.as_ref(),
            sequence_parallel: match self.config.sequence_parallel {
                SequenceParallelMode::Dedicated
                    if self.groups.sequence_parallel.world_size() > 1 =>
                {
                    Some(self.groups.sequence_parallel.as_ref())
                }
                _ => None,
            },
        }
    }

    pub fn batch_builder(&self) -> BatchBuilder<'a> {
        BatchBuilder::new(self.config, self.groups)
    }
}

/// Reject topologies the model cannot run.
///
/// Tensor-parallel sequence slicing hands each rank a fraction of the
/// sequence while the model expects whole-sequence activations, so it is
/// only accepted when the tensor-parallel group has a single rank.
pub fn check_topology(config: &TrainingStepConfig, groups: &ProcessGroups) -> crate::Result<()> {
    let tp = groups.tensor_parallel.world_size();
    if config.sequence_parallel == SequenceParallelMode::TensorParallel && tp > 1 {
        return Err(crate::PretrainError::Config(format!(
            "tensor-parallel sequence slicing needs a sharded model, got {tp} tensor-parallel ranks"
        )));
    }
    Ok(())
}

/// Build the batch (broadcast inside the tensor-parallel group), run the
/// model and combine the losses.
///
/// Only the tensor-parallel source rank reads `loader`; other ranks may
/// pass `None`.
pub fn forward_step<M, L>(
    model: &M,
    teacher: Option<&dyn StagedLanguageModel>,
    loader: Option<&mut L>,
    ctx: &StepContext<'_>,
) -> crate::Result<LossBundle>
where
    M: StagedLanguageModel + ?Sized,
    L: BatchDataLoader + ?Sized,
{
    check_topology(ctx.config, ctx.groups)?;
    let batch = ctx.batch_builder().prepare(loader, ctx.curriculum, ctx.device)?;
    forward_batch(model, teacher, batch, ctx)
}

/// Forward and loss for an already prepared batch
pub fn forward_batch<M: StagedLanguageModel + ?Sized>(
    model: &M,
    teacher: Option<&dyn StagedLanguageModel>,
    batch: PreparedBatch,
    ctx: &StepContext<'_>,
) -> crate::Result<LossBundle> {
    check_topology(ctx.config, ctx.groups)?;
    let config = ctx.config;
    let mode = config.mode();
    let num_tokens = batch.num_tokens();
    let attention_mask = batch.attention_mask.as_ref();

    let (output, aux_losses, distillation_loss) = match mode {
        TrainingMode::Distillation(_) => {
            // Student logits are needed for the divergence, so the
            // cross entropy is taken here instead of inside the model
            let (student_logits, aux_losses) =
                model.forward(&batch.tokens, &batch.position_ids, attention_mask, None)?;

            let labels = truncate_seq(&batch.labels, 1, effective_seq_len(config, ctx.curriculum))?;
            let output = vocab_cross_entropy(&student_logits, &labels)?;

            let distillation_loss = DistillationEvaluator::new(config, ctx.curriculum).evaluate(
                &student_logits,
                teacher,
                &batch.tokens,
                &batch.position_ids,
                attention_mask,
            )?;
            (output, aux_losses, Some(distillation_loss))
        }
        TrainingMode::Standard | TrainingMode::LoadBalanced => {
            let (output, aux_losses) = model.forward(
                &batch.tokens,
                &batch.position_ids,
                attention_mask,
                Some(&batch.labels),
            )?;
            (output, aux_losses, None)
        }
    };

    let aux_loss = loss::sum_aux_losses(&aux_losses, config.moe_loss_coeff)?;

    loss::combine(
        &ctx.loss_context(),
        &batch.loss_mask,
        aux_loss.as_ref(),
        distillation_loss.as_ref(),
        &output,
        num_tokens,
    )
}
