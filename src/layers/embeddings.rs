/// Word and learned position embeddings
use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{Embedding, VarBuilder};

/// `word(tokens) + position(position_ids)`, cast to the model dtype.
///
/// The word table is shared with the output head.
pub struct GptEmbedding {
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    target_dtype: DType,
}

impl GptEmbedding {
    pub fn new(
        vocab_size: usize,
        max_position_embeddings: usize,
        hidden_size: usize,
        vb: VarBuilder,
        target_dtype: DType,
    ) -> Result<Self> {
        let word_embeddings = candle_nn::embedding(vocab_size, hidden_size, vb.pp("word_embeddings"))?;
        let position_embeddings = candle_nn::embedding(
            max_position_embeddings,
            hidden_size,
            vb.pp("position_embeddings"),
        )?;
        Ok(Self {
            word_embeddings,
            position_embeddings,
            target_dtype,
        })
    }

    /// # Arguments
    /// * `tokens` - [batch, seq_len] U32
    /// * `position_ids` - [batch, seq_len] U32
    pub fn forward(&self, tokens: &Tensor, position_ids: &Tensor) -> Result<Tensor> {
        let words = self.word_embeddings.forward(tokens)?;
        let positions = self.position_embeddings.forward(position_ids)?;
        let output = (words + positions)?;

        if output.dtype() != self.target_dtype {
            output.to_dtype(self.target_dtype)
        } else {
            Ok(output)
        }
    }

    /// [vocab_size, hidden_size]
    pub fn word_embeddings_weight(&self) -> &Tensor {
        self.word_embeddings.embeddings()
    }
}
