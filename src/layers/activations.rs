/// Projection and feed-forward layers
use candle_core::{Result, Tensor};
use candle_nn::{Init, VarBuilder};

/// Helper function to find the smallest multiple of b that is >= a
fn find_multiple(a: usize, b: usize) -> usize {
    ((a + b - 1) / b) * b
}

/// Linear layer with automatic dtype casting
///
/// Casts weight and bias to the input dtype before the matmul, so the same
/// layer serves f32 and reduced-precision activations.
pub struct CastedLinear {
    weight: Tensor,
    bias: Option<Tensor>,
}

impl CastedLinear {
    /// Create new CastedLinear layer
    ///
    /// # Arguments
    /// * `in_features` - Input dimension
    /// * `out_features` - Output dimension
    /// * `bias` - Whether to include bias
    /// * `vb` - VarBuilder for parameter initialization
    pub fn new(in_features: usize, out_features: usize, bias: bool, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(
            (out_features, in_features),
            "weight",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;

        let bias = if bias {
            let bound = 1. / (in_features as f64).sqrt();
            let init_bs = Init::Uniform { lo: -bound, up: bound };
            Some(vb.get_with_hints(out_features, "bias", init_bs)?)
        } else {
            None
        };

        Ok(Self { weight, bias })
    }

    /// `input @ weight^T + bias`
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let input_dtype = input.dtype();

        let weight = if self.weight.dtype() != input_dtype {
            self.weight.to_dtype(input_dtype)?
        } else {
            self.weight.clone()
        };
        let output = input.broadcast_matmul(&weight.t()?)?;

        match self.bias {
            Some(ref b) if b.dtype() != input_dtype => output.broadcast_add(&b.to_dtype(input_dtype)?),
            Some(ref b) => output.broadcast_add(b),
            None => Ok(output),
        }
    }
}

/// SwiGLU feed-forward: `down_proj(silu(gate) * up)`
///
/// Used both as the dense MLP and as a single expert of the MoE layer.
pub struct SwiGLU {
    gate_up_proj: CastedLinear,
    down_proj: CastedLinear,
}

impl SwiGLU {
    /// Create new SwiGLU layer
    ///
    /// The intermediate size is `2/3 * expansion * hidden_size`, rounded up
    /// to a multiple of 64.
    pub fn new(hidden_size: usize, expansion: f32, vb: VarBuilder) -> Result<Self> {
        let inter = find_multiple(
            (expansion * hidden_size as f32 * 2.0 / 3.0).round() as usize,
            64,
        );

        let gate_up_proj = CastedLinear::new(hidden_size, inter * 2, false, vb.pp("gate_up_proj"))?;
        let down_proj = CastedLinear::new(inter, hidden_size, false, vb.pp("down_proj"))?;

        Ok(Self {
            gate_up_proj,
            down_proj,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate_up = self.gate_up_proj.forward(x)?;

        let last_dim = gate_up.rank() - 1;
        let inter_size = gate_up.dim(last_dim)? / 2;
        let gate = gate_up.narrow(last_dim, 0, inter_size)?;
        let up = gate_up.narrow(last_dim, inter_size, inter_size)?;

        let gated = candle_nn::ops::silu(&gate)?.mul(&up)?;
        self.down_proj.forward(&gated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_find_multiple() {
        assert_eq!(find_multiple(100, 64), 128);
        assert_eq!(find_multiple(64, 64), 64);
        assert_eq!(find_multiple(1, 64), 64);
    }

    #[test]
    fn test_casted_linear_shape() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let linear = CastedLinear::new(16, 48, true, vb)?;

        let x = Tensor::randn(0f32, 1.0, (2, 5, 16), &device)?;
        let out = linear.forward(&x)?;

        assert_eq!(out.dims(), &[2, 5, 48]);

        Ok(())
    }

    #[test]
    fn test_swiglu_shape() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let swiglu = SwiGLU::new(32, 4.0, vb)?;

        let x = Tensor::randn(0f32, 1.0, (2, 5, 32), &device)?;
        let out = swiglu.forward(&x)?;

        assert_eq!(out.dims(), x.dims());

        Ok(())
    }
}
