/// Training loop for GptModel
use candle_core::{DType, Device};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use std::collections::BTreeMap;
use std::ops::Range;
use std::path::Path;

use super::loss::LossBundle;
use super::scheduler::{SeqlenScheduler, SeqlenSchedulerConfig};
use super::stages::{run_pipelined, validate_stage_ranges};
use super::step::{check_topology, forward_step, StepContext};
use crate::config::{GptConfig, TrainingStepConfig};
use crate::data::curriculum::CurriculumState;
use crate::data::BatchDataLoader;
use crate::distributed::ProcessGroups;
use crate::models::GptModel;

/// Trainer configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TrainerConfig {
    /// Number of passes over the loader
    pub num_epochs: usize,
    /// Stop after this many steps, if set
    #[serde(default)]
    pub max_steps: Option<usize>,
    pub learning_rate: f64,
    pub weight_decay: f64,
    /// Log metrics every N steps
    pub log_every: usize,
    /// Drive the model through the pipeline stages over these layer ranges
    /// instead of the monolithic forward
    #[serde(default)]
    pub pipeline_stages: Option<Vec<Range<usize>>>,
    /// Sequence-length curriculum
    #[serde(default)]
    pub curriculum: Option<SeqlenSchedulerConfig>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            num_epochs: 1,
            max_steps: None,
            learning_rate: 3e-4,
            weight_decay: 0.1,
            log_every: 10,
            pipeline_stages: None,
            curriculum: None,
        }
    }
}

/// Trainer for GptModel
pub struct Trainer {
    model: GptModel,
    teacher: Option<GptModel>,
    varmap: VarMap,
    optimizer: AdamW,
    scheduler: Option<SeqlenScheduler>,
    step_config: TrainingStepConfig,
    config: TrainerConfig,
    groups: ProcessGroups,
    device: Device,
    step: usize,
}

impl Trainer {
    /// Create new trainer
    pub fn new(
        model_config: GptConfig,
        step_config: TrainingStepConfig,
        training_config: TrainerConfig,
        groups: ProcessGroups,
        device: Device,
    ) -> crate::Result<Self> {
        step_config.validate()?;
        check_topology(&step_config, &groups)?;

        if model_config.num_experts != step_config.num_experts {
            return Err(crate::PretrainError::Config(format!(
                "model has {} experts but the step config expects {}",
                model_config.num_experts, step_config.num_experts
            )));
        }
        if step_config.seq_length > model_config.max_position_embeddings {
            return Err(crate::PretrainError::Config(format!(
                "seq_length {} exceeds max_position_embeddings {}",
                step_config.seq_length, model_config.max_position_embeddings
            )));
        }
        if let Some(ref ranges) = training_config.pipeline_stages {
            validate_stage_ranges(ranges, model_config.num_layers)?;
            if step_config.mode().is_distillation() {
                return Err(crate::PretrainError::Config(
                    "distillation runs on the monolithic path only".to_string(),
                ));
            }
        }

        let scheduler = match training_config.curriculum {
            Some(ref curriculum) => {
                if curriculum.max_difficulty > step_config.seq_length {
                    return Err(crate::PretrainError::Config(format!(
                        "curriculum max_difficulty {} exceeds seq_length {}",
                        curriculum.max_difficulty, step_config.seq_length
                    )));
                }
                Some(SeqlenScheduler::new(curriculum.clone())?)
            }
            None => None,
        };

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = GptModel::new(model_config, vb)?;

        // Create optimizer using candle's built-in AdamW
        let optimizer_params = ParamsAdamW {
            lr: training_config.learning_rate,
            beta1: 0.9,
            beta2: 0.95,
            eps: 1e-8,
            weight_decay: training_config.weight_decay,
        };
        let optimizer = AdamW::new(varmap.all_vars(), optimizer_params)?;

        log::info!(
            "Trainer ready: mode {:?}, seq_length {}, {} parameter tensors",
            step_config.mode(),
            step_config.seq_length,
            varmap.all_vars().len()
        );

        Ok(Self {
            model,
            teacher: None,
            varmap,
            optimizer,
            scheduler,
            step_config,
            config: training_config,
            groups,
            device,
            step: 0,
        })
    }

    /// Attach the frozen distillation teacher. Its weights are not part of
    /// the optimizer's variables.
    pub fn with_teacher(mut self, teacher: GptModel) -> Self {
        self.teacher = Some(teacher);
        self
    }

    pub fn model(&self) -> &GptModel {
        &self.model
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// Curriculum state for the upcoming step
    fn next_curriculum(&mut self) -> crate::Result<CurriculumState> {
        let max_seqlen = self.step_config.seq_length;
        match self.scheduler {
            Some(ref mut scheduler) => {
                let seqlen = scheduler.update_difficulty(self.step + 1);
                log::debug!("step {}: curriculum seqlen {}", self.step + 1, seqlen);
                scheduler.curriculum_state(max_seqlen)
            }
            None => Ok(CurriculumState::disabled(max_seqlen)),
        }
    }

    /// Training step: forward, loss, backward and parameter update
    ///
    /// Only the tensor-parallel source rank needs a loader.
    pub fn train_step<L: BatchDataLoader + ?Sized>(
        &mut self,
        loader: Option<&mut L>,
    ) -> crate::Result<LossBundle> {
        let curriculum = self.next_curriculum()?;

        let ctx = StepContext {
            config: &self.step_config,
            curriculum: &curriculum,
            groups: &self.groups,
            device: &self.device,
        };

        let bundle = match self.config.pipeline_stages {
            Some(ref ranges) => {
                let batch = ctx.batch_builder().prepare(loader, &curriculum, &self.device)?;
                run_pipelined(&self.model, ranges, batch, &ctx.loss_context())?
            }
            None => forward_step(
                &self.model,
                self.teacher.as_ref().map(|t| t as &dyn crate::models::StagedLanguageModel),
                loader,
                &ctx,
            )?,
        };

        // Backward pass + parameter update
        self.optimizer.backward_step(&bundle.total_loss)?;
        self.step += 1;

        Ok(bundle)
    }

    /// Full training loop
    ///
    /// Returns the metrics averaged over the last epoch.
    pub fn train<L: BatchDataLoader + ?Sized>(
        &mut self,
        loader: &mut L,
    ) -> crate::Result<BTreeMap<String, f64>> {
        log::info!("Starting training for {} epochs", self.config.num_epochs);
        log::info!("Total batches per epoch: {}", loader.num_batches());

        let mut epoch_metrics = BTreeMap::new();

        for epoch in 0..self.config.num_epochs {
            loader.reset();
            epoch_metrics.clear();
            let mut num_steps = 0usize;

            for _ in 0..loader.num_batches() {
                if self.config.max_steps.is_some_and(|max| self.step >= max) {
                    break;
                }

                let bundle = self.train_step(Some(&mut *loader))?;
                num_steps += 1;

                for (name, value) in &bundle.reported_metrics {
                    *epoch_metrics.entry(name.clone()).or_insert(0.0) += value;
                }

                if self.config.log_every > 0 && self.step % self.config.log_every == 0 {
                    log::info!(
                        "Step {}: {} | seqlen {} | tokens {}",
                        self.step,
                        format_metrics(&bundle.reported_metrics),
                        bundle.effective_seq_len,
                        bundle.num_tokens
                    );
                }
            }

            for value in epoch_metrics.values_mut() {
                *value /= num_steps.max(1) as f64;
            }
            log::info!(
                "Epoch {} complete: {} | step={}",
                epoch + 1,
                format_metrics(&epoch_metrics),
                self.step
            );

            if self.config.max_steps.is_some_and(|max| self.step >= max) {
                break;
            }
        }

        log::info!("Training complete!");
        Ok(epoch_metrics)
    }

    /// Save the trained weights as safetensors
    pub fn save<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        log::info!("Saving model to {:?}", path.as_ref());
        self.varmap.save(path)?;
        Ok(())
    }
}

fn format_metrics(metrics: &BTreeMap<String, f64>) -> String {
    metrics
        .iter()
        .map(|(name, value)| format!("{}={:.4}", name, value))
        .collect::<Vec<_>>()
        .join(", ")
}
