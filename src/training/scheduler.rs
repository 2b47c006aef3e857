/// Sequence-length curriculum scheduler
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::data::curriculum::{CurriculumState, TruncationMode, SEQLEN_RESHAPE, SEQLEN_TRUNCATE};

/// How the difficulty grows with the global step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "schedule_type", rename_all = "snake_case")]
pub enum CurriculumSchedule {
    /// Linear ramp from min to max over `total_curriculum_step`
    FixedLinear {
        total_curriculum_step: usize,
        difficulty_step: usize,
    },
    /// `(step / total)^(1 / root_degree)` ramp
    FixedRoot {
        total_curriculum_step: usize,
        difficulty_step: usize,
        root_degree: u32,
    },
    /// `difficulty[i]` while `step <= max_step[i]`, the last difficulty after
    FixedDiscrete {
        difficulty: Vec<usize>,
        max_step: Vec<usize>,
    },
}

/// Sequence-length scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeqlenSchedulerConfig {
    /// Starting sequence length
    pub min_difficulty: usize,
    /// Final sequence length, normally the configured `seq_length`
    pub max_difficulty: usize,
    /// `truncate` / `reshape` drive the data-efficiency curriculum; `none`
    /// only sets the length, for the legacy curriculum
    #[serde(default)]
    pub truncation_mode: TruncationMode,
    #[serde(flatten)]
    pub schedule: CurriculumSchedule,
}

/// Produces the [`CurriculumState`] of every step.
///
/// The state is computed once, before the step starts, and is read-only
/// for the rest of it.
pub struct SeqlenScheduler {
    config: SeqlenSchedulerConfig,
    current_difficulty: usize,
}

impl SeqlenScheduler {
    /// Create new scheduler, starting at `min_difficulty`
    pub fn new(config: SeqlenSchedulerConfig) -> crate::Result<Self> {
        validate(&config)?;
        let current_difficulty = config.min_difficulty;
        Ok(Self {
            config,
            current_difficulty,
        })
    }

    pub fn config(&self) -> &SeqlenSchedulerConfig {
        &self.config
    }

    /// Difficulty for a specific global step
    pub fn difficulty_at_step(&self, global_step: usize) -> usize {
        let (min, max) = (self.config.min_difficulty, self.config.max_difficulty);

        match self.config.schedule {
            CurriculumSchedule::FixedLinear {
                total_curriculum_step,
                difficulty_step,
            } => root_difficulty(global_step, total_curriculum_step, difficulty_step, 1, min, max),
            CurriculumSchedule::FixedRoot {
                total_curriculum_step,
                difficulty_step,
                root_degree,
            } => root_difficulty(
                global_step,
                total_curriculum_step,
                difficulty_step,
                root_degree,
                min,
                max,
            ),
            CurriculumSchedule::FixedDiscrete {
                ref difficulty,
                ref max_step,
            } => max_step
                .iter()
                .position(|&threshold| global_step <= threshold)
                .map_or(difficulty[difficulty.len() - 1], |i| difficulty[i]),
        }
    }

    /// Advance to `global_step` and return the new difficulty
    pub fn update_difficulty(&mut self, global_step: usize) -> usize {
        self.current_difficulty = self.difficulty_at_step(global_step);
        self.current_difficulty
    }

    pub fn current_difficulty(&self) -> usize {
        self.current_difficulty
    }

    /// Named difficulties for the current step, as the curriculum schedule
    /// interface reports them
    pub fn difficulties(&self) -> HashMap<String, usize> {
        let mut difficulties = HashMap::new();
        match self.config.truncation_mode {
            TruncationMode::Truncate => {
                difficulties.insert(SEQLEN_TRUNCATE.to_string(), self.current_difficulty);
            }
            TruncationMode::Reshape => {
                difficulties.insert(SEQLEN_RESHAPE.to_string(), self.current_difficulty);
            }
            TruncationMode::None => {}
        }
        difficulties
    }

    /// Curriculum state for the current step
    pub fn curriculum_state(&self, max_seqlen: usize) -> crate::Result<CurriculumState> {
        match self.config.truncation_mode {
            TruncationMode::None => {
                CurriculumState::new(self.current_difficulty, TruncationMode::None, max_seqlen)
            }
            _ => CurriculumState::from_difficulties(&self.difficulties(), max_seqlen),
        }
    }
}

fn root_difficulty(
    global_step: usize,
    total_curriculum_step: usize,
    difficulty_step: usize,
    root_degree: u32,
    min: usize,
    max: usize,
) -> usize {
    let progress = (global_step as f64 / total_curriculum_step as f64).powf(1.0 / root_degree as f64);
    let next = (progress * (max - min) as f64 + min as f64).floor() as usize;
    let next = next - next % difficulty_step;
    next.min(max)
}

fn validate(config: &SeqlenSchedulerConfig) -> crate::Result<()> {
    let err = |msg: String| -> crate::Result<()> { Err(crate::PretrainError::Config(msg)) };

    if config.min_difficulty == 0 || config.min_difficulty > config.max_difficulty {
        return err(format!(
            "curriculum difficulties must satisfy 0 < min ({}) <= max ({})",
            config.min_difficulty, config.max_difficulty
        ));
    }

    match config.schedule {
        CurriculumSchedule::FixedLinear {
            total_curriculum_step,
            difficulty_step,
        }
        | CurriculumSchedule::FixedRoot {
            total_curriculum_step,
            difficulty_step,
            ..
        } => {
            if total_curriculum_step == 0 || difficulty_step == 0 {
                return err("total_curriculum_step and difficulty_step must be > 0".to_string());
            }
            if config.min_difficulty % difficulty_step != 0 {
                return err(format!(
                    "min_difficulty {} is not a multiple of difficulty_step {}",
                    config.min_difficulty, difficulty_step
                ));
            }
            if let CurriculumSchedule::FixedRoot { root_degree: 0, .. } = config.schedule {
                return err("root_degree must be > 0".to_string());
            }
        }
        CurriculumSchedule::FixedDiscrete {
            ref difficulty,
            ref max_step,
        } => {
            if difficulty.len() != max_step.len() + 1 {
                return err(format!(
                    "fixed_discrete needs one more difficulty than max_step, got {} and {}",
                    difficulty.len(),
                    max_step.len()
                ));
            }
            if difficulty.iter().any(|&d| d == 0 || d > config.max_difficulty) {
                return err("fixed_discrete difficulties must lie in 1..=max_difficulty".to_string());
            }
        }
    }

    Ok(())
}
