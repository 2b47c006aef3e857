/// Training step orchestration
///
/// - [`stages`]: the forward pass split into pre-process / layer range /
///   post-process / loss stages for a pipelined engine
/// - [`loss`]: masked LM loss and per-mode loss combination
/// - [`distill`]: divergence against a frozen teacher
/// - [`step`]: the monolithic forward step
/// - [`scheduler`]: sequence-length curriculum schedule
/// - [`trainer`]: optimizer loop

pub mod distill;
pub mod loss;
pub mod scheduler;
pub mod stages;
pub mod step;
pub mod trainer;

pub use distill::DistillationEvaluator;
pub use loss::{combine, masked_lm_loss, LossBundle, LossContext};
pub use scheduler::{CurriculumSchedule, SeqlenScheduler, SeqlenSchedulerConfig};
pub use stages::{
    layer_range, loss_stage, post_process, pre_process, run_pipelined, split_batch,
    validate_stage_ranges, StagedTensor,
};
pub use step::{check_topology, forward_batch, forward_step, StepContext};
pub use trainer::{Trainer, TrainerConfig};
