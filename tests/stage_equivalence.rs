//! Pipelined stages against the monolithic step

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use std::ops::Range;

use gpt_pretrain::data::{BatchBuilder, CurriculumState, RawBatch, TruncationMode};
use gpt_pretrain::distributed::ProcessGroups;
use gpt_pretrain::training::loss::{LM_LOSS, MOE_LOSS};
use gpt_pretrain::training::{forward_batch, run_pipelined, StepContext};
use gpt_pretrain::{GptConfig, GptModel, TrainingStepConfig};

const SEQ_LENGTH: usize = 8;

fn moe_model(device: &Device) -> anyhow::Result<GptModel> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    Ok(GptModel::new(
        GptConfig {
            vocab_size: 16,
            hidden_size: 16,
            num_layers: 4,
            num_heads: 2,
            max_position_embeddings: SEQ_LENGTH,
            expansion: 2.0,
            num_experts: 4,
            expert_interval: 2,
            layernorm_epsilon: 1e-5,
        },
        vb,
    )?)
}

fn raw_batch(device: &Device) -> anyhow::Result<RawBatch> {
    // Token 0 is the end-of-document marker
    let text = Tensor::new(
        &[
            [3u32, 5, 0, 7, 2, 9, 0, 4, 6],
            [1, 8, 8, 0, 3, 3, 5, 11, 2],
        ],
        device,
    )?;
    Ok(RawBatch::new(text))
}

fn step_config() -> TrainingStepConfig {
    TrainingStepConfig {
        seq_length: SEQ_LENGTH,
        eod_token: 0,
        reset_position_ids: true,
        reset_attention_mask: true,
        eod_mask_loss: true,
        num_experts: 4,
        ..Default::default()
    }
}

fn assert_equivalent(
    config: &TrainingStepConfig,
    curriculum: &CurriculumState,
    plans: &[&[Range<usize>]],
) -> anyhow::Result<()> {
    let device = Device::Cpu;
    let model = moe_model(&device)?;
    let groups = ProcessGroups::single();
    let ctx = StepContext {
        config,
        curriculum,
        groups: &groups,
        device: &device,
    };

    let batch = BatchBuilder::new(config, &groups).prepare_raw(&raw_batch(&device)?, curriculum)?;
    let monolithic = forward_batch(&model, None, batch.clone(), &ctx)?;
    let expected = monolithic.total_loss.to_scalar::<f32>()?;

    for plan in plans {
        let staged = run_pipelined(&model, plan, batch.clone(), &ctx.loss_context())?;
        let actual = staged.total_loss.to_scalar::<f32>()?;

        assert!(
            (expected - actual).abs() < 1e-5,
            "plan {:?}: monolithic {} vs staged {}",
            plan,
            expected,
            actual
        );
        assert_eq!(staged.effective_seq_len, monolithic.effective_seq_len);
        assert_eq!(staged.num_tokens, monolithic.num_tokens);
        assert_eq!(staged.num_tokens, batch.num_tokens());
        assert_eq!(
            staged.reported_metrics.keys().collect::<Vec<_>>(),
            monolithic.reported_metrics.keys().collect::<Vec<_>>()
        );
        for (name, value) in &monolithic.reported_metrics {
            assert!((value - staged.reported_metrics[name]).abs() < 1e-5, "{name}");
        }
    }

    Ok(())
}

#[test]
fn every_stage_plan_matches_monolithic_with_document_resets() -> anyhow::Result<()> {
    let config = step_config();
    let curriculum = CurriculumState::disabled(SEQ_LENGTH);

    assert_equivalent(
        &config,
        &curriculum,
        &[&[0..4], &[0..2, 2..4], &[0..1, 1..2, 2..3, 3..4], &[0..3, 3..4]],
    )
}

#[test]
fn legacy_curriculum_shortens_every_stage_consistently() -> anyhow::Result<()> {
    let config = TrainingStepConfig {
        curriculum_learning_legacy: true,
        ..step_config()
    };
    let curriculum = CurriculumState::new(4, TruncationMode::None, SEQ_LENGTH)?;

    assert_equivalent(&config, &curriculum, &[&[0..2, 2..4]])?;

    let device = Device::Cpu;
    let groups = ProcessGroups::single();
    let batch = BatchBuilder::new(&config, &groups).prepare_raw(&raw_batch(&device)?, &curriculum)?;
    assert_eq!(batch.tokens.dims(), &[2, 4]);
    assert_eq!(batch.labels.dims(), &[2, 4]);
    assert_eq!(batch.loss_mask.dims(), &[2, 4]);

    Ok(())
}

#[test]
fn reshape_curriculum_matches_across_stages() -> anyhow::Result<()> {
    let config = TrainingStepConfig {
        data_efficiency_curriculum_learning: true,
        ..step_config()
    };
    let curriculum = CurriculumState::new(2, TruncationMode::Reshape, SEQ_LENGTH)?;

    let device = Device::Cpu;
    let groups = ProcessGroups::single();
    let batch = BatchBuilder::new(&config, &groups).prepare_raw(&raw_batch(&device)?, &curriculum)?;
    // 18 tokens in rows of 3, six rows
    assert_eq!(batch.tokens.dims(), &[6, 2]);

    assert_equivalent(&config, &curriculum, &[&[0..1, 1..4]])
}

#[test]
fn load_balanced_step_reports_both_terms() -> anyhow::Result<()> {
    let device = Device::Cpu;
    let model = moe_model(&device)?;
    let config = step_config();
    let curriculum = CurriculumState::disabled(SEQ_LENGTH);
    let groups = ProcessGroups::single();
    let ctx = StepContext {
        config: &config,
        curriculum: &curriculum,
        groups: &groups,
        device: &device,
    };

    let batch = BatchBuilder::new(&config, &groups).prepare_raw(&raw_batch(&device)?, &curriculum)?;
    let bundle = forward_batch(&model, None, batch, &ctx)?;

    let lm = bundle.metric(LM_LOSS).expect("lm loss");
    let moe = bundle.metric(MOE_LOSS).expect("moe loss");
    assert!(lm.is_finite());
    assert!(moe > 0.0);
    let total = bundle.total_loss.to_scalar::<f32>()? as f64;
    assert!((total - (lm + moe)).abs() < 1e-5);

    Ok(())
}

#[test]
fn fully_masked_batch_gives_nan_loss() -> anyhow::Result<()> {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = GptModel::new(
        GptConfig {
            vocab_size: 16,
            hidden_size: 16,
            num_layers: 2,
            num_heads: 2,
            max_position_embeddings: 4,
            expansion: 2.0,
            num_experts: 1,
            expert_interval: 1,
            layernorm_epsilon: 1e-5,
        },
        vb,
    )?;

    let config = TrainingStepConfig {
        seq_length: 4,
        eod_token: 0,
        eod_mask_loss: true,
        ..Default::default()
    };
    let curriculum = CurriculumState::disabled(4);
    let groups = ProcessGroups::single();
    let ctx = StepContext {
        config: &config,
        curriculum: &curriculum,
        groups: &groups,
        device: &device,
    };

    let raw = RawBatch::new(Tensor::zeros((2, 5), DType::U32, &device)?);
    let batch = BatchBuilder::new(&config, &groups).prepare_raw(&raw, &curriculum)?;
    assert_eq!(batch.loss_mask.sum_all()?.to_scalar::<f32>()?, 0.0);

    let bundle = forward_batch(&model, None, batch, &ctx)?;
    assert!(bundle.total_loss.to_scalar::<f32>()?.is_nan());
    assert!(bundle.metric(LM_LOSS).expect("lm loss").is_nan());

    Ok(())
}
