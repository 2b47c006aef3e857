/// GPT model and the layer-level interface used by the stage decomposer
use candle_core::{DType, Result, Tensor, Var, D};
use candle_nn::VarBuilder;
use std::ops::Range;

use crate::config::GptConfig;
use crate::layers::{CausalSelfAttention, GptEmbedding, LayerNorm, MoeMlp, SwiGLU};

pub mod loader;

/// What a transformer layer hands back
#[derive(Debug, Clone)]
pub enum LayerOutput {
    /// Dense layer: hidden states only
    Hidden(Tensor),
    /// Layer that may report an auxiliary (load-balancing) loss
    WithAuxLoss(Tensor, Option<Tensor>),
}

impl LayerOutput {
    pub fn into_parts(self) -> (Tensor, Option<Tensor>) {
        match self {
            LayerOutput::Hidden(hidden) => (hidden, None),
            LayerOutput::WithAuxLoss(hidden, aux) => (hidden, aux),
        }
    }
}

/// One transformer layer: `(hidden_states, attention_mask) -> LayerOutput`
pub trait TransformerLayer {
    fn forward(&self, hidden_states: &Tensor, attention_mask: Option<&Tensor>) -> Result<LayerOutput>;
}

/// Model surface the stage decomposer drives: an embedding step, an
/// ordered indexable layer list, a final norm and a tied output head.
pub trait StagedLanguageModel {
    /// Token + position embedding, `[batch, seq, hidden]`
    fn embed(&self, tokens: &Tensor, position_ids: &Tensor) -> Result<Tensor>;

    fn num_layers(&self) -> usize;

    fn layer(&self, index: usize) -> Option<&dyn TransformerLayer>;

    fn final_norm(&self, hidden_states: &Tensor) -> Result<Tensor>;

    /// Vocabulary logits `[batch, seq, vocab]`, or per-token cross entropy
    /// `[batch, seq]` when `labels` is given
    fn output_head(&self, hidden_states: &Tensor, labels: Option<&Tensor>) -> Result<Tensor>;

    /// Monolithic forward pass. Returns the model output and one auxiliary
    /// loss entry per layer.
    fn forward(
        &self,
        tokens: &Tensor,
        position_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        labels: Option<&Tensor>,
    ) -> crate::Result<(Tensor, Vec<Option<Tensor>>)> {
        let hidden_states = self.embed(tokens, position_ids)?;

        let mut aux_losses = Vec::with_capacity(self.num_layers());
        let hidden_states = run_layers(
            self,
            0..self.num_layers(),
            hidden_states,
            &mut aux_losses,
            attention_mask,
        )?;

        let hidden_states = self.final_norm(&hidden_states)?;
        let output = self.output_head(&hidden_states, labels)?;
        Ok((output, aux_losses))
    }
}

/// Apply layers `range` in order, appending one auxiliary loss per layer.
///
/// A layer that reports no auxiliary loss contributes a gradient-tracked
/// zero so the list always has exactly one entry per traversed layer.
pub fn run_layers<M: StagedLanguageModel + ?Sized>(
    model: &M,
    range: Range<usize>,
    hidden_states: Tensor,
    aux_losses: &mut Vec<Option<Tensor>>,
    attention_mask: Option<&Tensor>,
) -> crate::Result<Tensor> {
    let mut hidden_states = hidden_states;

    for index in range {
        let layer = model.layer(index).ok_or_else(|| {
            crate::PretrainError::Precondition(format!(
                "layer {} out of range for a {}-layer model",
                index,
                model.num_layers()
            ))
        })?;

        let (hidden, aux) = layer.forward(&hidden_states, attention_mask)?.into_parts();
        let aux = match aux {
            Some(aux) => aux,
            None => Var::zeros((), DType::F32, hidden.device())?.into_inner(),
        };

        hidden_states = hidden;
        aux_losses.push(Some(aux));
    }

    Ok(hidden_states)
}

/// Per-token cross entropy of `logits` `[batch, seq, vocab]` against
/// `labels` `[batch, seq]`, computed in f32
pub fn vocab_cross_entropy(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let log_probs = candle_nn::ops::log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;
    log_probs
        .gather(&labels.to_dtype(DType::U32)?.unsqueeze(D::Minus1)?.contiguous()?, D::Minus1)?
        .squeeze(D::Minus1)?
        .neg()
}

/// Feed-forward half of a block
enum Mlp {
    Dense(SwiGLU),
    Moe(MoeMlp),
}

/// Pre-norm transformer block
///
/// - `h = x + attn(ln_1(x))`
/// - `out = h + mlp(ln_2(h))`
pub struct TransformerBlock {
    input_layernorm: LayerNorm,
    self_attn: CausalSelfAttention,
    post_attention_layernorm: LayerNorm,
    mlp: Mlp,
}

impl TransformerBlock {
    /// Create new transformer block; `moe` selects a mixture-of-experts MLP
    pub fn new(config: &GptConfig, moe: bool, vb: VarBuilder) -> Result<Self> {
        let eps = config.layernorm_epsilon;

        let input_layernorm = LayerNorm::new(config.hidden_size, eps, vb.pp("input_layernorm"))?;
        let self_attn = CausalSelfAttention::new(config.hidden_size, config.num_heads, vb.pp("self_attn"))?;
        let post_attention_layernorm =
            LayerNorm::new(config.hidden_size, eps, vb.pp("post_attention_layernorm"))?;

        let mlp = if moe {
            Mlp::Moe(MoeMlp::new(
                config.hidden_size,
                config.expansion,
                config.num_experts,
                vb.pp("moe"),
            )?)
        } else {
            Mlp::Dense(SwiGLU::new(config.hidden_size, config.expansion, vb.pp("mlp"))?)
        };

        Ok(Self {
            input_layernorm,
            self_attn,
            post_attention_layernorm,
            mlp,
        })
    }

    pub fn is_moe(&self) -> bool {
        matches!(self.mlp, Mlp::Moe(_))
    }
}

impl TransformerLayer for TransformerBlock {
    fn forward(&self, hidden_states: &Tensor, attention_mask: Option<&Tensor>) -> Result<LayerOutput> {
        let attn_out = self
            .self_attn
            .forward(&self.input_layernorm.forward(hidden_states)?, attention_mask)?;
        let hidden_states = (hidden_states + attn_out)?;

        let mlp_input = self.post_attention_layernorm.forward(&hidden_states)?;
        match self.mlp {
            Mlp::Dense(ref mlp) => {
                let mlp_out = mlp.forward(&mlp_input)?;
                Ok(LayerOutput::Hidden((hidden_states + mlp_out)?))
            }
            Mlp::Moe(ref moe) => {
                let (mlp_out, aux_loss) = moe.forward(&mlp_input)?;
                Ok(LayerOutput::WithAuxLoss((hidden_states + mlp_out)?, Some(aux_loss)))
            }
        }
    }
}

/// Decoder-only GPT with learned positions and a tied output head
pub struct GptModel {
    config: GptConfig,
    embedding: GptEmbedding,
    layers: Vec<TransformerBlock>,
    final_layernorm: LayerNorm,
}

impl GptModel {
    /// Create new GptModel
    pub fn new(config: GptConfig, vb: VarBuilder) -> crate::Result<Self> {
        config.validate()?;

        let embedding = GptEmbedding::new(
            config.vocab_size,
            config.max_position_embeddings,
            config.hidden_size,
            vb.pp("embedding"),
            vb.dtype(),
        )?;

        let mut layers = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            layers.push(TransformerBlock::new(
                &config,
                config.is_moe_layer(i),
                vb.pp(format!("layers.{}", i)),
            )?);
        }

        let final_layernorm =
            LayerNorm::new(config.hidden_size, config.layernorm_epsilon, vb.pp("final_layernorm"))?;

        log::debug!(
            "GptModel: {} layers ({} MoE), hidden {}, vocab {}",
            layers.len(),
            layers.iter().filter(|l| l.is_moe()).count(),
            config.hidden_size,
            config.vocab_size
        );

        Ok(Self {
            config,
            embedding,
            layers,
            final_layernorm,
        })
    }

    pub fn config(&self) -> &GptConfig {
        &self.config
    }
}

impl StagedLanguageModel for GptModel {
    fn embed(&self, tokens: &Tensor, position_ids: &Tensor) -> Result<Tensor> {
        self.embedding.forward(tokens, position_ids)
    }

    fn num_layers(&self) -> usize {
        self.layers.len()
    }

    fn layer(&self, index: usize) -> Option<&dyn TransformerLayer> {
        self.layers.get(index).map(|l| l as &dyn TransformerLayer)
    }

    fn final_norm(&self, hidden_states: &Tensor) -> Result<Tensor> {
        self.final_layernorm.forward(hidden_states)
    }

    fn output_head(&self, hidden_states: &Tensor, labels: Option<&Tensor>) -> Result<Tensor> {
        let weight = self.embedding.word_embeddings_weight();
        let weight = if weight.dtype() != hidden_states.dtype() {
            weight.to_dtype(hidden_states.dtype())?
        } else {
            weight.clone()
        };
        let logits = hidden_states.broadcast_matmul(&weight.t()?)?;

        match labels {
            Some(labels) => vocab_cross_entropy(&logits, labels),
            None => Ok(logits),
        }
    }
}
