/// Layer normalization
///
/// Statistics are computed in f32 and the result is cast back to the input
/// dtype.
use candle_core::{DType, Result, Tensor, D};
use candle_nn::{Init, VarBuilder};

/// Normalize over the last dimension to zero mean and unit variance
///
/// # Arguments
/// * `hidden_states` - Input tensor
/// * `eps` - Small constant for numerical stability (typically 1e-5)
pub fn layer_norm(hidden_states: &Tensor, eps: f64) -> Result<Tensor> {
    let input_dtype = hidden_states.dtype();

    let hidden_states = if input_dtype != DType::F32 {
        hidden_states.to_dtype(DType::F32)?
    } else {
        hidden_states.clone()
    };

    let mean = hidden_states.mean_keepdim(D::Minus1)?;
    let centered = hidden_states.broadcast_sub(&mean)?;
    let variance = centered.sqr()?.mean_keepdim(D::Minus1)?;
    let normalized = centered.broadcast_div(&(variance + eps)?.sqrt()?)?;

    if input_dtype != DType::F32 {
        normalized.to_dtype(input_dtype)
    } else {
        Ok(normalized)
    }
}

/// LayerNorm with learnable scale (init 1) and shift (init 0)
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub fn new(hidden_size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(hidden_size, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(hidden_size, "bias", Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        layer_norm(x, self.eps)?
            .broadcast_mul(&self.weight.to_dtype(dtype)?)?
            .broadcast_add(&self.bias.to_dtype(dtype)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    #[test]
    fn test_layer_norm_basic() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::new(&[[1.0f32, 2.0, 3.0, 4.0]], &device)?;

        let normalized = layer_norm(&x, 1e-5)?;
        let values = normalized.flatten_all()?.to_vec1::<f32>()?;

        let mean: f32 = values.iter().sum::<f32>() / values.len() as f32;
        let var: f32 = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / values.len() as f32;

        assert!(mean.abs() < 1e-5);
        assert!((var - 1.0).abs() < 1e-3);
        assert!(values[0] < values[3]);

        Ok(())
    }

    #[test]
    fn test_layer_norm_module_initial_identity_affine() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let norm = LayerNorm::new(8, 1e-5, vb)?;

        let x = Tensor::randn(0f32, 3.0, (2, 3, 8), &device)?;
        let a = norm.forward(&x)?;
        let b = layer_norm(&x, 1e-5)?;

        let diff = (a - b)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-6);

        Ok(())
    }
}
