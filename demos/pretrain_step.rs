/// Single-process GPT pretraining with an MoE model and a truncate curriculum
///
/// Usage: `cargo run --example pretrain_step [-- <dataset_dir|-> [teacher.safetensors]]`
///
/// `dataset_dir` holds `text.npy` (`[N, seq_len + 1]` int64 tokens) and an
/// optional `dataset.json`. Without it (or with `-`), random tokens are used.
///
/// With a teacher checkpoint of the same architecture the run switches to
/// knowledge distillation on the monolithic path. The student is saved to
/// `student.safetensors`, so a second run can use it as the teacher.
use candle_core::{Device, Tensor};
use gpt_pretrain::config::{DistillationConfig, DistillationKind};
use gpt_pretrain::data::{BatchDataLoader, InMemoryLoader, NumpyTokenDataset, NumpyTokenLoader, TruncationMode};
use gpt_pretrain::distributed::ProcessGroups;
use gpt_pretrain::models::loader::load_model;
use gpt_pretrain::training::{CurriculumSchedule, SeqlenSchedulerConfig, Trainer, TrainerConfig};
use gpt_pretrain::{GptConfig, TrainingStepConfig};

const SEQ_LENGTH: usize = 64;
const BATCH_SIZE: usize = 8;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("=== GPT pretraining step demo ===");

    let device = if candle_core::utils::cuda_is_available() {
        Device::new_cuda(0)?
    } else {
        Device::Cpu
    };
    log::info!("Using device: {:?}", device);

    let (mut loader, vocab_size, eod_token): (Box<dyn BatchDataLoader>, usize, u32) =
        match std::env::args().nth(1).filter(|dir| dir != "-") {
            Some(dir) => {
                let dataset = NumpyTokenDataset::from_directory(&dir)?;
                let metadata = dataset.metadata().clone();
                anyhow::ensure!(
                    metadata.seq_len == SEQ_LENGTH,
                    "demo expects seq_len {}, dataset has {}",
                    SEQ_LENGTH,
                    metadata.seq_len
                );
                let eod = metadata.eod_token.unwrap_or(metadata.vocab_size as u32 - 1);
                (
                    Box::new(NumpyTokenLoader::new(dataset, BATCH_SIZE, true)),
                    metadata.vocab_size,
                    eod,
                )
            }
            None => {
                log::info!("No dataset given, using random tokens");
                let vocab_size = 256;
                let batches = (0..32)
                    .map(|_| {
                        Tensor::rand(0f32, vocab_size as f32, (BATCH_SIZE, SEQ_LENGTH + 1), &device)?
                            .floor()?
                            .to_dtype(candle_core::DType::U32)
                    })
                    .collect::<candle_core::Result<Vec<_>>>()?;
                (
                    Box::new(InMemoryLoader::new(batches)),
                    vocab_size,
                    vocab_size as u32 - 1,
                )
            }
        };

    let model_config = GptConfig {
        vocab_size,
        hidden_size: 128,
        num_layers: 4,
        num_heads: 4,
        max_position_embeddings: SEQ_LENGTH,
        expansion: 4.0,
        num_experts: 4,
        expert_interval: 2,
        layernorm_epsilon: 1e-5,
    };
    log::info!("Model configuration: {:#?}", model_config);

    let teacher = match std::env::args().nth(2) {
        Some(path) => Some(load_model(model_config.clone(), &[path], &device)?),
        None => None,
    };

    let step_config = TrainingStepConfig {
        seq_length: SEQ_LENGTH,
        eod_token,
        reset_position_ids: true,
        reset_attention_mask: true,
        eod_mask_loss: true,
        data_efficiency_curriculum_learning: true,
        num_experts: model_config.num_experts,
        distillation: teacher
            .as_ref()
            .map(|_| DistillationConfig::new(DistillationKind::Kd)),
        ..Default::default()
    };

    let training_config = TrainerConfig {
        num_epochs: 2,
        learning_rate: 3e-4,
        log_every: 4,
        // Distillation runs on the monolithic path
        pipeline_stages: teacher.is_none().then(|| vec![0..2, 2..4]),
        curriculum: Some(SeqlenSchedulerConfig {
            min_difficulty: 16,
            max_difficulty: SEQ_LENGTH,
            truncation_mode: TruncationMode::Truncate,
            schedule: CurriculumSchedule::FixedRoot {
                total_curriculum_step: 48,
                difficulty_step: 8,
                root_degree: 2,
            },
        }),
        ..Default::default()
    };

    let mut trainer = Trainer::new(
        model_config,
        step_config,
        training_config,
        ProcessGroups::single(),
        device,
    )?;
    if let Some(teacher) = teacher {
        log::info!("Distilling from the loaded teacher");
        trainer = trainer.with_teacher(teacher);
    }

    let metrics = trainer.train(loader.as_mut())?;
    for (name, value) in &metrics {
        log::info!("final {}: {:.4}", name, value);
    }

    trainer.save("student.safetensors")?;

    Ok(())
}
