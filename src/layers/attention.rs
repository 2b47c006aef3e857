/// Causal multi-head self-attention
use candle_core::{DType, Device, Result, Tensor};
use candle_nn::VarBuilder;

use super::activations::CastedLinear;

/// Multi-head self-attention for a decoder-only model.
///
/// Masking follows the batch builder: with an explicit U8 mask (1 = blocked)
/// blocked scores are set to `-inf`; without one the layer is causal on its
/// own, as a fused attention kernel would be.
pub struct CausalSelfAttention {
    num_heads: usize,
    head_dim: usize,
    hidden_size: usize,

    qkv_proj: CastedLinear,
    o_proj: CastedLinear,
}

impl CausalSelfAttention {
    pub fn new(hidden_size: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        let head_dim = hidden_size / num_heads;

        let qkv_proj = CastedLinear::new(hidden_size, 3 * hidden_size, true, vb.pp("qkv_proj"))?;
        let o_proj = CastedLinear::new(hidden_size, hidden_size, true, vb.pp("o_proj"))?;

        Ok(Self {
            num_heads,
            head_dim,
            hidden_size,
            qkv_proj,
            o_proj,
        })
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `hidden_states` - Input tensor [batch, seq_len, hidden_size]
    /// * `attention_mask` - Optional [b_or_1, 1, seq_len, seq_len] U8 mask
    pub fn forward(&self, hidden_states: &Tensor, attention_mask: Option<&Tensor>) -> Result<Tensor> {
        let (batch_size, seq_len, _) = hidden_states.dims3()?;

        // [batch, seq_len, 3, num_heads, head_dim]
        let qkv = self.qkv_proj.forward(hidden_states)?.reshape((
            batch_size,
            seq_len,
            3,
            self.num_heads,
            self.head_dim,
        ))?;

        // -> [batch, num_heads, seq_len, head_dim]
        let split = |i: usize| -> Result<Tensor> {
            qkv.narrow(2, i, 1)?.squeeze(2)?.transpose(1, 2)?.contiguous()
        };
        let (query, key, value) = (split(0)?, split(1)?, split(2)?);

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (query.matmul(&key.t()?.contiguous()?)? * scale)?;

        let scores = match attention_mask {
            Some(mask) => apply_attention_mask(&scores, mask)?,
            None => {
                let causal = create_causal_mask(seq_len, scores.device())?.to_dtype(scores.dtype())?;
                scores.broadcast_add(&causal)?
            }
        };

        let attn_weights = candle_nn::ops::softmax_last_dim(&scores)?;
        let attn_output = attn_weights
            .matmul(&value)?
            .transpose(1, 2)?
            .reshape((batch_size, seq_len, self.hidden_size))?;

        self.o_proj.forward(&attn_output)
    }
}

/// Set scores to `-inf` wherever `mask` is 1
fn apply_attention_mask(scores: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let neg_inf = Tensor::full(f32::NEG_INFINITY, scores.dims(), scores.device())?
        .to_dtype(scores.dtype())?;
    mask.to_dtype(DType::U8)?
        .broadcast_as(scores.dims())?
        .where_cond(&neg_inf, scores)
}

/// Additive causal mask: 0 on/below the diagonal, -inf above
fn create_causal_mask(seq_len: usize, device: &Device) -> Result<Tensor> {
    let mut mask_data = vec![0.0f32; seq_len * seq_len];

    for i in 0..seq_len {
        for j in (i + 1)..seq_len {
            mask_data[i * seq_len + j] = f32::NEG_INFINITY;
        }
    }

    Tensor::from_vec(mask_data, (seq_len, seq_len), device)
}
