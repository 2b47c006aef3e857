//! GPT pretraining step orchestration
//!
//! The per-step layer of a distributed GPT pretraining job: it builds
//! identical mini-batches across tensor/sequence-parallel ranks, applies
//! curriculum truncation to the sequence axis, drives the model either as
//! one monolithic forward or as four composable pipeline stages, and
//! combines the language-model, load-balancing and distillation losses.
//!
//! # Architecture
//!
//! - **Batch builder** ([`data::batch`]): broadcast, token/label split,
//!   masks and sequence-parallel slicing
//! - **Curriculum** ([`data::curriculum`]): truncate / reshape modes and
//!   the single `effective_seq_len` used by every truncation site
//! - **Stages** ([`training::stages`]): pre-process, layer range,
//!   post-process and loss stages sharing one layer-iteration routine
//! - **Loss** ([`training::loss`]) and **distillation** ([`training::distill`])
//!
//! # Example
//!
//! ```ignore
//! use gpt_pretrain::{GptConfig, TrainingStepConfig};
//! use gpt_pretrain::training::{Trainer, TrainerConfig};
//!
//! let mut trainer = Trainer::new(GptConfig::default(), TrainingStepConfig::default(),
//!     TrainerConfig::default(), groups, device)?;
//! let bundle = trainer.train_step(Some(&mut loader))?;
//! ```

pub mod config;
pub mod data;
pub mod distributed;
pub mod layers;
pub mod models;
pub mod training;
pub mod utils;

// Re-export commonly used items
pub use config::{GptConfig, TrainingMode, TrainingStepConfig};
pub use models::GptModel;

/// Library error types
#[derive(Debug, thiserror::Error)]
pub enum PretrainError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Precondition violated: {0}")]
    Precondition(String),

    #[error(
        "teacher and student output should match in size. Student: {student:?}, Teacher: {teacher:?}, CL seq length {curriculum_seqlen}"
    )]
    ShapeMismatch {
        student: Vec<usize>,
        teacher: Vec<usize>,
        curriculum_seqlen: usize,
    },

    #[error("Distributed error: {0}")]
    Distributed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PretrainError>;
