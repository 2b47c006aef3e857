//! Knowledge distillation against a frozen teacher

use candle_core::{DType, Tensor, D};

use crate::config::TrainingStepConfig;
use crate::data::curriculum::{effective_seq_len, truncate_seq, CurriculumState};
use crate::models::StagedLanguageModel;

/// Temperature-scaled KL divergence between a frozen teacher and the student.
///
/// `T^2 * KL(softmax(teacher / T) || log_softmax(student / T))`, summed over
/// the vocabulary and sequence, averaged over the batch, then divided by the
/// configured sequence length and scaled by `beta_ce`.
pub struct DistillationEvaluator<'a> {
    config: &'a TrainingStepConfig,
    curriculum: &'a CurriculumState,
}

impl<'a> DistillationEvaluator<'a> {
    pub fn new(config: &'a TrainingStepConfig, curriculum: &'a CurriculumState) -> Self {
        Self { config, curriculum }
    }

    /// Distillation loss for `student_logits` `[batch, seq, vocab]`.
    ///
    /// Returns a zero scalar when no teacher is configured or teacher
    /// forwarding is turned off.
    pub fn evaluate(
        &self,
        student_logits: &Tensor,
        teacher: Option<&dyn StagedLanguageModel>,
        tokens: &Tensor,
        position_ids: &Tensor,
        attention_mask: Option<&Tensor>,
    ) -> crate::Result<Tensor> {
        let (distill, teacher) = match (self.config.distillation.as_ref(), teacher) {
            (Some(distill), Some(teacher)) if distill.teacher_forward => (distill, teacher),
            _ => return Ok(Tensor::zeros((), DType::F32, student_logits.device())?),
        };

        let seq_len = effective_seq_len(self.config, self.curriculum);
        let tokens = truncate_seq(tokens, 1, seq_len)?;
        let position_ids = truncate_seq(position_ids, 1, seq_len)?;
        let attention_mask = match attention_mask {
            Some(mask) => Some(truncate_seq(&truncate_seq(mask, 2, seq_len)?, 3, seq_len)?),
            None => None,
        };

        let (teacher_logits, _) =
            teacher.forward(&tokens, &position_ids, attention_mask.as_ref(), None)?;
        let teacher_logits = teacher_logits.detach();

        if student_logits.dims() != teacher_logits.dims() {
            return Err(crate::PretrainError::ShapeMismatch {
                student: student_logits.dims().to_vec(),
                teacher: teacher_logits.dims().to_vec(),
                curriculum_seqlen: self.curriculum.current_seqlen,
            });
        }

        let kl = kl_div_batchmean(student_logits, &teacher_logits, distill.temperature)?;
        let loss = kl.affine(distill.beta_ce / self.config.seq_length as f64, 0.0)?;

        log::debug!(
            "distillation loss {:.6} at seq len {}",
            loss.to_scalar::<f32>()?,
            seq_len
        );
        Ok(loss)
    }
}

/// `T^2 * sum(p * (log p - log q)) / batch` with `p = softmax(teacher / T)`
/// and `log q = log_softmax(student / T)`, in f32
pub fn kl_div_batchmean(
    student_logits: &Tensor,
    teacher_logits: &Tensor,
    temperature: f64,
) -> candle_core::Result<Tensor> {
    let batch_size = student_logits.dim(0)?;
    let inv_t = 1.0 / temperature;

    let student_log_probs =
        candle_nn::ops::log_softmax(&student_logits.to_dtype(DType::F32)?.affine(inv_t, 0.0)?, D::Minus1)?;
    let teacher_log_probs =
        candle_nn::ops::log_softmax(&teacher_logits.to_dtype(DType::F32)?.affine(inv_t, 0.0)?, D::Minus1)?;
    let teacher_probs = teacher_log_probs.exp()?;

    let kl = (teacher_probs * (teacher_log_probs - student_log_probs)?)?.sum_all()?;
    kl.affine(temperature * temperature / batch_size as f64, 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DistillationConfig, DistillationKind};
    use crate::models::GptModel;
    use crate::GptConfig;
    use candle_core::Device;
    use candle_nn::{VarBuilder, VarMap};

    fn tiny_config() -> GptConfig {
        GptConfig {
            vocab_size: 24,
            hidden_size: 16,
            num_layers: 2,
            num_heads: 2,
            max_position_embeddings: 8,
            expansion: 2.0,
            num_experts: 1,
            expert_interval: 2,
            layernorm_epsilon: 1e-5,
        }
    }

    fn step_config(seq_length: usize) -> TrainingStepConfig {
        TrainingStepConfig {
            seq_length,
            distillation: Some(DistillationConfig {
                temperature: 2.0,
                beta_ce: 0.5,
                ..DistillationConfig::new(DistillationKind::Mos)
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_kl_identical_logits_is_zero() -> candle_core::Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::randn(0f32, 3.0, (2, 3, 7), &device)?;

        let kl = kl_div_batchmean(&logits, &logits, 1.5)?.to_scalar::<f32>()?;
        assert!(kl.abs() < 1e-6);

        Ok(())
    }

    #[test]
    fn test_kl_positive_for_different_logits() -> candle_core::Result<()> {
        let device = Device::Cpu;
        let student = Tensor::new(&[[[0.0f32, 0.0]]], &device)?;
        let teacher = Tensor::new(&[[[2.0f32, 0.0]]], &device)?;

        let kl = kl_div_batchmean(&student, &teacher, 1.0)?.to_scalar::<f32>()?;
        // p = softmax([2, 0]), q = [0.5, 0.5]
        let p0 = 1.0 / (1.0 + (-2.0f32).exp());
        let p1 = 1.0 - p0;
        let expected = p0 * (p0 / 0.5).ln() + p1 * (p1 / 0.5).ln();
        assert!((kl - expected).abs() < 1e-5);

        Ok(())
    }

    #[test]
    fn test_no_teacher_is_zero() -> crate::Result<()> {
        let device = Device::Cpu;
        let config = step_config(4);
        let curriculum = CurriculumState::disabled(4);
        let evaluator = DistillationEvaluator::new(&config, &curriculum);

        let logits = Tensor::randn(0f32, 1.0, (1, 4, 24), &device)?;
        let tokens = Tensor::new(&[[1u32, 2, 3, 4]], &device)?;
        let position_ids = Tensor::new(&[[0u32, 1, 2, 3]], &device)?;

        let loss = evaluator.evaluate(&logits, None, &tokens, &position_ids, None)?;
        assert_eq!(loss.to_scalar::<f32>()?, 0.0);

        Ok(())
    }

    #[test]
    fn test_identical_teacher_gives_zero() -> crate::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let student = GptModel::new(tiny_config(), vb)?;

        let config = step_config(4);
        let curriculum = CurriculumState::disabled(4);
        let evaluator = DistillationEvaluator::new(&config, &curriculum);

        let tokens = Tensor::new(&[[3u32, 1, 4, 1], [5, 9, 2, 6]], &device)?;
        let position_ids = Tensor::new(&[[0u32, 1, 2, 3], [0, 1, 2, 3]], &device)?;
        let (logits, _) = student.forward(&tokens, &position_ids, None, None)?;

        let loss = evaluator.evaluate(&logits, Some(&student), &tokens, &position_ids, None)?;
        assert!(loss.to_scalar::<f32>()?.abs() < 1e-5);

        Ok(())
    }

    #[test]
    fn test_shape_mismatch_reports_curriculum_length() -> crate::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let teacher = GptModel::new(tiny_config(), vb)?;

        let config = TrainingStepConfig {
            curriculum_learning_legacy: true,
            ..step_config(4)
        };
        let curriculum = CurriculumState::new(2, Default::default(), 4)?;
        let evaluator = DistillationEvaluator::new(&config, &curriculum);

        // Student still at full length while the teacher sees the curriculum length
        let logits = Tensor::randn(0f32, 1.0, (1, 4, 24), &device)?;
        let tokens = Tensor::new(&[[1u32, 2, 3, 4]], &device)?;
        let position_ids = Tensor::new(&[[0u32, 1, 2, 3]], &device)?;

        let err = evaluator
            .evaluate(&logits, Some(&teacher), &tokens, &position_ids, None)
            .unwrap_err();
        match err {
            crate::PretrainError::ShapeMismatch {
                student,
                teacher,
                curriculum_seqlen,
            } => {
                assert_eq!(student, vec![1, 4, 24]);
                assert_eq!(teacher, vec![1, 2, 24]);
                assert_eq!(curriculum_seqlen, 2);
            }
            other => panic!("unexpected error: {other}"),
        }

        Ok(())
    }
}
