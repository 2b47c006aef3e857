/// Mixture-of-experts feed-forward with top-1 routing
use candle_core::{DType, Result, Tensor, D};
use candle_nn::VarBuilder;

use super::activations::{CastedLinear, SwiGLU};

/// Switch-style MoE: each token goes to its highest-probability expert and
/// the expert output is scaled by that probability.
///
/// Returns a load-balancing loss alongside the output:
/// `E * sum_e(fraction_of_tokens_e * mean_router_prob_e)`, which is 1.0 for a
/// perfectly uniform router.
pub struct MoeMlp {
    router: CastedLinear,
    experts: Vec<SwiGLU>,
}

impl MoeMlp {
    pub fn new(hidden_size: usize, expansion: f32, num_experts: usize, vb: VarBuilder) -> Result<Self> {
        let router = CastedLinear::new(hidden_size, num_experts, false, vb.pp("router"))?;
        let experts = (0..num_experts)
            .map(|i| SwiGLU::new(hidden_size, expansion, vb.pp(format!("experts.{}", i))))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { router, experts })
    }

    pub fn num_experts(&self) -> usize {
        self.experts.len()
    }

    /// # Returns
    /// (output [batch, seq_len, hidden], load-balancing loss scalar)
    pub fn forward(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let (batch_size, seq_len, hidden) = x.dims3()?;
        let num_experts = self.experts.len();
        let flat = x.reshape((batch_size * seq_len, hidden))?;

        // [N, E], routing in f32
        let logits = self.router.forward(&flat)?.to_dtype(DType::F32)?;
        let probs = candle_nn::ops::softmax_last_dim(&logits)?;

        let top1 = probs.argmax_keepdim(D::Minus1)?;
        let expert_ids = Tensor::arange(0u32, num_experts as u32, x.device())?.unsqueeze(0)?;
        let one_hot = top1.broadcast_eq(&expert_ids)?.to_dtype(DType::F32)?;
        let gates = (&probs * &one_hot)?.to_dtype(x.dtype())?;

        let mut output = flat.zeros_like()?;
        for (e, expert) in self.experts.iter().enumerate() {
            let weight = gates.narrow(1, e, 1)?;
            output = (output + expert.forward(&flat)?.broadcast_mul(&weight)?)?;
        }

        let tokens_per_expert = one_hot.mean(0)?;
        let prob_per_expert = probs.mean(0)?;
        let aux_loss = ((tokens_per_expert * prob_per_expert)?.sum_all()? * num_experts as f64)?;

        Ok((output.reshape((batch_size, seq_len, hidden))?, aux_loss))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    #[test]
    fn test_moe_shapes_and_aux_loss() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let moe = MoeMlp::new(16, 2.0, 4, vb)?;
        assert_eq!(moe.num_experts(), 4);

        let x = Tensor::randn(0f32, 1.0, (2, 5, 16), &device)?;
        let (out, aux) = moe.forward(&x)?;

        assert_eq!(out.dims(), &[2, 5, 16]);
        assert_eq!(aux.rank(), 0);

        // Bounded by E when every token lands on one expert with prob 1
        let aux = aux.to_scalar::<f32>()?;
        assert!(aux > 0.0 && aux <= 4.0 + 1e-4, "aux = {}", aux);

        Ok(())
    }

    #[test]
    fn test_single_expert_is_scaled_dense_mlp() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let moe = MoeMlp::new(8, 2.0, 1, vb)?;

        let x = Tensor::randn(0f32, 1.0, (1, 3, 8), &device)?;
        let (_, aux) = moe.forward(&x)?;

        // One expert takes every token with probability 1
        assert!((aux.to_scalar::<f32>()? - 1.0).abs() < 1e-6);

        Ok(())
    }
}
