/// Mask and tensor helpers shared by the batch builder and the stages
use candle_core::{DType, Result, Tensor};

/// Left-to-right masks and position ids for a `[batch, seq]` token matrix.
///
/// Returns `(attention_mask, loss_mask, position_ids)`:
/// - `attention_mask`: U8 `[b_or_1, 1, seq, seq]`, 1 where attention is
///   blocked. Batch dimension is `batch` only with `reset_attention_mask`.
///   `None` when `skip_mask` is set (the fused kernel is causal itself).
/// - `loss_mask`: F32 `[batch, seq]`, 0 on EOD tokens when `eod_mask_loss`.
/// - `position_ids`: U32 `[batch, seq]`, restarting after each EOD when
///   `reset_position_ids`.
pub fn ltor_masks_and_position_ids(
    tokens: &Tensor,
    eod_token: u32,
    reset_position_ids: bool,
    reset_attention_mask: bool,
    eod_mask_loss: bool,
    skip_mask: bool,
) -> Result<(Option<Tensor>, Tensor, Tensor)> {
    let (batch, seq) = tokens.dims2()?;
    let device = tokens.device();
    let rows = tokens.to_dtype(DType::U32)?.to_vec2::<u32>()?;

    let att_batch = if reset_attention_mask { batch } else { 1 };
    let mut mask = vec![0u8; att_batch * seq * seq];
    for b in 0..att_batch {
        for i in 0..seq {
            for j in (i + 1)..seq {
                mask[b * seq * seq + i * seq + j] = 1;
            }
        }
    }

    let mut loss_mask = vec![1.0f32; batch * seq];
    if eod_mask_loss {
        for (b, row) in rows.iter().enumerate() {
            for (i, &tok) in row.iter().enumerate() {
                if tok == eod_token {
                    loss_mask[b * seq + i] = 0.0;
                }
            }
        }
    }

    let mut position_ids: Vec<u32> = (0..batch).flat_map(|_| 0..seq as u32).collect();

    if reset_position_ids || reset_attention_mask {
        for (b, row) in rows.iter().enumerate() {
            let mut prev_index = 0usize;
            let eod_positions = row
                .iter()
                .enumerate()
                .filter(|&(_, &tok)| tok == eod_token)
                .map(|(i, _)| i);

            for i in eod_positions {
                if reset_attention_mask {
                    for r in (i + 1)..seq {
                        for c in 0..=i {
                            mask[b * seq * seq + r * seq + c] = 1;
                        }
                    }
                }
                if reset_position_ids {
                    let shift = (i + 1 - prev_index) as u32;
                    for k in (i + 1)..seq {
                        position_ids[b * seq + k] -= shift;
                    }
                    prev_index = i + 1;
                }
            }
        }
    }

    let attention_mask = if skip_mask {
        None
    } else {
        Some(Tensor::from_vec(mask, (att_batch, 1, seq, seq), device)?)
    };
    let loss_mask = Tensor::from_vec(loss_mask, (batch, seq), device)?;
    let position_ids = Tensor::from_vec(position_ids, (batch, seq), device)?;

    Ok((attention_mask, loss_mask, position_ids))
}

/// Fresh-storage copy of `t` that stays in the autograd graph.
///
/// Stage outputs handed to a pipelined engine must not alias buffers the
/// engine may reuse.
pub fn make_viewless_tensor(t: &Tensor) -> Result<Tensor> {
    t.copy()
}
