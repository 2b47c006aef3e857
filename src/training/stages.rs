//! Forward pass decomposed into pipeline stages
//!
//! Four stages reproduce [`StagedLanguageModel::forward`] for a
//! stage-pipelined engine: pre-process (embedding), a range of transformer
//! layers, post-process (final norm and output head) and the loss. Every
//! stage returns what it passes down to the next stage; values a stage
//! consumes locally come from the batch split made by [`split_batch`].
//!
//! The layer stage and the monolithic forward share
//! [`run_layers`](crate::models::run_layers), so both walk the layers the
//! same way.

use candle_core::Tensor;
use std::ops::Range;

use super::loss::{self, LossBundle, LossContext};
use crate::data::batch::PreparedBatch;
use crate::models::{run_layers, StagedLanguageModel};
use crate::utils::make_viewless_tensor;

/// Payload handed from stage to stage
#[derive(Debug, Clone)]
pub struct StagedTensor {
    pub hidden_states: Tensor,
    /// One entry per traversed layer, in layer order; only ever appended to
    pub aux_losses: Vec<Option<Tensor>>,
}

/// Inputs of the pre-process stage
#[derive(Debug, Clone)]
pub struct ModelInputs {
    pub tokens: Tensor,
    pub position_ids: Tensor,
    pub attention_mask: Option<Tensor>,
}

/// Inputs every layer stage reads locally
#[derive(Debug, Clone)]
pub struct LayerInputs {
    pub attention_mask: Option<Tensor>,
}

/// Inputs of the post-process stage
#[derive(Debug, Clone)]
pub struct PostInputs {
    /// With labels the output head yields per-token loss instead of logits
    pub labels: Option<Tensor>,
}

/// Inputs of the loss stage
#[derive(Debug, Clone)]
pub struct LossInputs {
    pub loss_mask: Tensor,
    /// Tokens fed to the model on this rank
    pub num_tokens: usize,
}

/// Output of the post-process stage
#[derive(Debug, Clone)]
pub struct ModelOutput {
    pub output: Tensor,
    pub aux_losses: Vec<Option<Tensor>>,
}

/// Split a prepared batch into model, post-process and loss inputs
pub fn split_batch(batch: PreparedBatch) -> (ModelInputs, PostInputs, LossInputs) {
    let num_tokens = batch.num_tokens();
    let PreparedBatch {
        tokens,
        labels,
        loss_mask,
        attention_mask,
        position_ids,
    } = batch;

    (
        ModelInputs {
            tokens,
            position_ids,
            attention_mask,
        },
        PostInputs {
            labels: Some(labels),
        },
        LossInputs {
            loss_mask,
            num_tokens,
        },
    )
}

/// Embedding stage: token + position embedding into a viewless hidden state
/// and an empty auxiliary-loss list
pub fn pre_process<M: StagedLanguageModel + ?Sized>(
    model: &M,
    inputs: &ModelInputs,
) -> crate::Result<(StagedTensor, LayerInputs)> {
    let encoder_input = model.embed(&inputs.tokens, &inputs.position_ids)?;
    let hidden_states = make_viewless_tensor(&encoder_input)?;

    Ok((
        StagedTensor {
            hidden_states,
            aux_losses: Vec::new(),
        },
        LayerInputs {
            attention_mask: inputs.attention_mask.clone(),
        },
    ))
}

/// Layer stage over `[start, end)`
pub fn layer_range<M: StagedLanguageModel + ?Sized>(
    model: &M,
    start: usize,
    end: usize,
) -> impl Fn(StagedTensor, &LayerInputs) -> crate::Result<StagedTensor> + '_ {
    move |passed_down: StagedTensor, inputs: &LayerInputs| {
        let StagedTensor {
            hidden_states,
            mut aux_losses,
        } = passed_down;

        let hidden_states = run_layers(
            model,
            start..end,
            hidden_states,
            &mut aux_losses,
            inputs.attention_mask.as_ref(),
        )?;

        Ok(StagedTensor {
            hidden_states,
            aux_losses,
        })
    }
}

/// Final norm and tied output head
pub fn post_process<M: StagedLanguageModel + ?Sized>(
    model: &M,
    passed_down: StagedTensor,
    inputs: &PostInputs,
) -> crate::Result<ModelOutput> {
    let hidden_states = model.final_norm(&passed_down.hidden_states)?;
    let output = model.output_head(&hidden_states, inputs.labels.as_ref())?;

    Ok(ModelOutput {
        output,
        aux_losses: passed_down.aux_losses,
    })
}

/// Sum the reported auxiliary losses, scale them and combine with the
/// primary loss. The pipelined path carries no distillation term.
pub fn loss_stage(
    model_output: ModelOutput,
    inputs: &LossInputs,
    ctx: &LossContext<'_>,
) -> crate::Result<LossBundle> {
    let aux_loss = loss::sum_aux_losses(&model_output.aux_losses, ctx.config.moe_loss_coeff)?;

    loss::combine(
        ctx,
        &inputs.loss_mask,
        aux_loss.as_ref(),
        None,
        &model_output.output,
        inputs.num_tokens,
    )
}

/// Check that `ranges` are contiguous, non-empty, increasing and cover
/// `0..num_layers` exactly once
pub fn validate_stage_ranges(ranges: &[Range<usize>], num_layers: usize) -> crate::Result<()> {
    let mut expected_start = 0;

    for (stage, range) in ranges.iter().enumerate() {
        if range.start != expected_start || range.end <= range.start {
            return Err(crate::PretrainError::Precondition(format!(
                "pipeline stage {} has layer range {:?}, expected a non-empty range starting at {}",
                stage, range, expected_start
            )));
        }
        expected_start = range.end;
    }

    if expected_start != num_layers {
        return Err(crate::PretrainError::Precondition(format!(
            "pipeline stages cover layers 0..{} but the model has {} layers",
            expected_start, num_layers
        )));
    }

    Ok(())
}

/// Drive the four stages over `ranges` in order
pub fn run_pipelined<M: StagedLanguageModel + ?Sized>(
    model: &M,
    ranges: &[Range<usize>],
    batch: PreparedBatch,
    ctx: &LossContext<'_>,
) -> crate::Result<LossBundle> {
    validate_stage_ranges(ranges, model.num_layers())?;

    let (model_inputs, post_inputs, loss_inputs) = split_batch(batch);

    let (mut staged, layer_inputs) = pre_process(model, &model_inputs)?;
    for range in ranges {
        log::debug!("pipeline stage: layers {:?}", range);
        staged = layer_range(model, range.start, range.end)(staged, &layer_inputs)?;
    }

    let model_output = post_process(model, staged, &post_inputs)?;
    loss_stage(model_output, &loss_inputs, ctx)
}
