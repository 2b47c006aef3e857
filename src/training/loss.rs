//! Loss aggregation
//!
//! Combines the masked language-model loss, the load-balancing loss and the
//! distillation loss into the scalar used for backpropagation. The primary
//! loss is also averaged over the data-parallel group, for reporting only.

use candle_core::{DType, Tensor};
use std::collections::BTreeMap;

use crate::config::{DistillationKind, TrainingMode, TrainingStepConfig};
use crate::data::curriculum::{effective_seq_len, truncate_seq, CurriculumState};
use crate::distributed::{gather_along, Communicator};

/// Metric key of the data-parallel averaged primary loss
pub const LM_LOSS: &str = "lm loss";
/// Metric key of the scaled load-balancing loss
pub const MOE_LOSS: &str = "moe loss";
/// Metric key of the combined loss in distillation mode
pub const TOTAL_LOSS: &str = "total loss";

/// Everything one step reports back to the optimizer loop
#[derive(Debug, Clone)]
pub struct LossBundle {
    /// Scalar to backpropagate
    pub total_loss: Tensor,
    /// Masked mean of the per-token loss on this rank
    pub primary_loss: Tensor,
    /// Summed, coefficient-scaled load-balancing loss (zero when inactive)
    pub auxiliary_loss: Tensor,
    /// Distillation loss (zero when inactive)
    pub distillation_loss: Tensor,
    pub reported_metrics: BTreeMap<String, f64>,
    /// Sequence length the loss mask was cut to
    pub effective_seq_len: usize,
    /// Tokens fed to the model on this rank
    pub num_tokens: usize,
}

/// Step-scoped state the loss needs
#[derive(Clone, Copy)]
pub struct LossContext<'a> {
    pub config: &'a TrainingStepConfig,
    pub curriculum: &'a CurriculumState,
    pub data_parallel: &'a dyn Communicator,
    /// Set with dedicated sequence parallelism over more than one rank: the
    /// per-token loss is gathered over this group before masking
    pub sequence_parallel: Option<&'a dyn Communicator>,
}

impl LossBundle {
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.reported_metrics.get(name).copied()
    }
}

/// `sum(output * mask) / sum(mask)`.
///
/// An all-zero mask yields NaN, which is propagated.
pub fn masked_lm_loss(output: &Tensor, loss_mask: &Tensor) -> candle_core::Result<Tensor> {
    let losses = output.to_dtype(DType::F32)?.flatten_all()?;
    let loss_mask = loss_mask.to_dtype(DType::F32)?.flatten_all()?;

    (losses * &loss_mask)?.sum_all()?.div(&loss_mask.sum_all()?)
}

/// Sum the reported auxiliary losses and scale by `coeff`.
///
/// `None` entries are skipped; `None` is returned when nothing was reported.
pub fn sum_aux_losses(aux_losses: &[Option<Tensor>], coeff: f64) -> candle_core::Result<Option<Tensor>> {
    let mut total: Option<Tensor> = None;
    for aux in aux_losses.iter().flatten() {
        let aux = aux.to_dtype(DType::F32)?;
        total = Some(match total {
            Some(acc) => (acc + aux)?,
            None => aux,
        });
    }

    total.map(|t| t.affine(coeff, 0.0)).transpose()
}

fn scalar_value(t: &Tensor) -> candle_core::Result<f64> {
    Ok(t.to_dtype(DType::F32)?.to_scalar::<f32>()? as f64)
}

/// Combine the loss terms of one step according to the run's training mode.
///
/// `output` holds the per-token loss. Under dedicated sequence parallelism it
/// covers this rank's slice and is gathered to full length first. The loss
/// mask is cut to the curriculum length before use. `auxiliary_loss` is the
/// already scaled load-balancing loss. `num_tokens` is the number of tokens
/// the model consumed on this rank.
pub fn combine(
    ctx: &LossContext<'_>,
    loss_mask: &Tensor,
    auxiliary_loss: Option<&Tensor>,
    distillation_loss: Option<&Tensor>,
    output: &Tensor,
    num_tokens: usize,
) -> crate::Result<LossBundle> {
    let config = ctx.config;
    let seq_len = effective_seq_len(config, ctx.curriculum);
    let loss_mask = truncate_seq(loss_mask, 1, seq_len)?;

    let output = match ctx.sequence_parallel {
        Some(group) => gather_along(group, output, 1)?,
        None => output.clone(),
    };
    let primary_loss = masked_lm_loss(&output, &loss_mask)?;

    let averaged = ctx.data_parallel.all_reduce_mean(&[primary_loss.detach()])?;
    let averaged = averaged.first().ok_or_else(|| {
        crate::PretrainError::Distributed("all-reduce returned no values".to_string())
    })?;

    let zero = || Tensor::zeros((), DType::F32, primary_loss.device());
    let auxiliary_loss = match auxiliary_loss {
        Some(aux) => aux.to_dtype(DType::F32)?,
        None => zero()?,
    };
    let distillation_loss = match distillation_loss {
        Some(d) => d.to_dtype(DType::F32)?,
        None => zero()?,
    };

    let mut reported_metrics = BTreeMap::new();
    reported_metrics.insert(LM_LOSS.to_string(), scalar_value(averaged)?);

    let total_loss = match config.mode() {
        TrainingMode::Standard => combine_standard(&primary_loss)?,
        TrainingMode::LoadBalanced => {
            combine_load_balanced(&primary_loss, &auxiliary_loss, &mut reported_metrics)?
        }
        TrainingMode::Distillation(kind) => combine_distillation(
            kind,
            &primary_loss,
            &auxiliary_loss,
            &distillation_loss,
            &mut reported_metrics,
        )?,
    };

    log::debug!("loss metrics: {:?}", reported_metrics);

    Ok(LossBundle {
        total_loss,
        primary_loss,
        auxiliary_loss,
        distillation_loss,
        reported_metrics,
        effective_seq_len: loss_mask.dim(1)?,
        num_tokens,
    })
}

fn combine_standard(primary: &Tensor) -> candle_core::Result<Tensor> {
    Ok(primary.clone())
}

fn combine_load_balanced(
    primary: &Tensor,
    auxiliary: &Tensor,
    metrics: &mut BTreeMap<String, f64>,
) -> candle_core::Result<Tensor> {
    metrics.insert(MOE_LOSS.to_string(), scalar_value(auxiliary)?);
    primary + auxiliary
}

fn combine_distillation(
    kind: DistillationKind,
    primary: &Tensor,
    auxiliary: &Tensor,
    distillation: &Tensor,
    metrics: &mut BTreeMap<String, f64>,
) -> candle_core::Result<Tensor> {
    let total = ((primary + auxiliary)? + distillation)?;

    metrics.insert(MOE_LOSS.to_string(), scalar_value(auxiliary)?);
    metrics.insert(kind.metric_name().to_string(), scalar_value(distillation)?);
    metrics.insert(TOTAL_LOSS.to_string(), scalar_value(&total)?);

    log::debug!(
        ">>> total loss: {:.6}, lm loss {:.6}, {} {:.6}",
        scalar_value(&total)?,
        scalar_value(primary)?,
        kind.metric_name(),
        scalar_value(distillation)?
    );
    Ok(total)
}
