/// Weight loading from safetensors files
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use std::path::Path;

use super::GptModel;
use crate::GptConfig;

/// Load a GPT model (typically the frozen distillation teacher) from one or
/// more safetensors shards
///
/// # Arguments
/// * `config` - Model configuration, must match the checkpoint
/// * `weights_paths` - Paths to safetensors files
/// * `device` - Device to load model on
pub fn load_model<P: AsRef<Path>>(
    config: GptConfig,
    weights_paths: &[P],
    device: &Device,
) -> crate::Result<GptModel> {
    let paths: Vec<&Path> = weights_paths.iter().map(|p| p.as_ref()).collect();
    log::info!("Loading model weights from {:?}", paths);

    let dtype = DType::F32;
    // Safety: the files must not be modified while mapped
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&paths, dtype, device)? };

    GptModel::new(config, vb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StagedLanguageModel;
    use candle_core::Tensor;
    use candle_nn::VarMap;

    #[test]
    fn test_round_trip_through_safetensors() -> crate::Result<()> {
        let device = Device::Cpu;
        let config = GptConfig {
            vocab_size: 16,
            hidden_size: 8,
            num_layers: 1,
            num_heads: 2,
            max_position_embeddings: 8,
            expansion: 2.0,
            num_experts: 1,
            expert_interval: 2,
            layernorm_epsilon: 1e-5,
        };

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = GptModel::new(config.clone(), vb)?;

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("model.safetensors");
        varmap.save(&path)?;

        let loaded = load_model(config, &[&path], &device)?;

        let tokens = Tensor::new(&[[1u32, 2, 3]], &device)?;
        let position_ids = Tensor::new(&[[0u32, 1, 2]], &device)?;
        let (a, _) = model.forward(&tokens, &position_ids, None, None)?;
        let (b, _) = loaded.forward(&tokens, &position_ids, None, None)?;

        let diff = (a - b)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);

        Ok(())
    }
}
