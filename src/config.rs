use std::path::Path;

/// Configuration for the GPT model
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GptConfig {
    /// Vocabulary size (input embedding rows, tied output head columns)
    pub vocab_size: usize,

    /// Embedding/hidden dimension
    pub hidden_size: usize,

    /// Number of transformer layers
    pub num_layers: usize,

    /// Number of attention heads
    pub num_heads: usize,

    /// Rows of the learned position embedding
    pub max_position_embeddings: usize,

    /// FFN expansion factor (hidden_size * expansion)
    pub expansion: f32,

    /// Experts per MoE layer; 1 means every layer is dense
    pub num_experts: usize,

    /// Every `expert_interval`-th layer is an MoE layer when `num_experts > 1`
    pub expert_interval: usize,

    /// Epsilon of the layer norms
    pub layernorm_epsilon: f64,
}

impl Default for GptConfig {
    fn default() -> Self {
        Self {
            vocab_size: 50257, // GPT-2 vocab size as default
            hidden_size: 768,
            num_layers: 12,
            num_heads: 12,
            max_position_embeddings: 2048,
            expansion: 4.0,
            num_experts: 1,
            expert_interval: 2,
            layernorm_epsilon: 1e-5,
        }
    }
}

impl GptConfig {
    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.hidden_size == 0 || self.num_layers == 0 {
            return Err(crate::PretrainError::Config(
                "hidden_size and num_layers must be > 0".to_string(),
            ));
        }

        if self.num_heads == 0 || self.hidden_size % self.num_heads != 0 {
            return Err(crate::PretrainError::Config(
                "hidden_size must be divisible by num_heads".to_string(),
            ));
        }

        if self.num_experts == 0 || self.expert_interval == 0 {
            return Err(crate::PretrainError::Config(
                "num_experts and expert_interval must be >= 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Get head dimension
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }

    /// Whether layer `index` routes through experts
    pub fn is_moe_layer(&self, index: usize) -> bool {
        self.num_experts > 1 && (index + 1) % self.expert_interval == 0
    }
}

/// Where the sequence-parallel world size and rank come from.
///
/// The two modes compute the loss differently, so they also differ in
/// whether labels are sliced along the sequence axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceParallelMode {
    /// No sequence slicing
    #[default]
    Disabled,
    /// Framework-native sequence parallelism over the tensor-parallel group.
    /// Labels stay whole on every rank.
    TensorParallel,
    /// Dedicated sequence-parallel group. Labels are sliced like tokens.
    Dedicated,
}

/// Which distillation loss is reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistillationKind {
    /// Mixture-of-students
    Mos,
    /// Knowledge distillation
    Kd,
}

impl DistillationKind {
    /// Metric name the distillation term is reported under
    pub fn metric_name(&self) -> &'static str {
        match self {
            DistillationKind::Mos => "mos loss",
            DistillationKind::Kd => "kd loss",
        }
    }
}

/// Distillation options
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DistillationConfig {
    pub kind: DistillationKind,
    /// Cross-entropy weight. Carried for configuration compatibility; the
    /// combined loss does not scale the language-model term by it.
    #[serde(default = "default_alpha_ce")]
    pub alpha_ce: f64,
    /// Weight of the divergence term
    #[serde(default = "default_beta_ce")]
    pub beta_ce: f64,
    /// Softmax temperature
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Run the teacher forward at all
    #[serde(default = "default_true")]
    pub teacher_forward: bool,
}

fn default_alpha_ce() -> f64 {
    1.0
}

fn default_beta_ce() -> f64 {
    1.0
}

fn default_temperature() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

impl DistillationConfig {
    pub fn new(kind: DistillationKind) -> Self {
        Self {
            kind,
            alpha_ce: default_alpha_ce(),
            beta_ce: default_beta_ce(),
            temperature: default_temperature(),
            teacher_forward: true,
        }
    }
}

/// Step-scoped training options, passed explicitly to every component
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TrainingStepConfig {
    /// Configured (maximum) training sequence length
    pub seq_length: usize,

    /// End-of-document token id
    pub eod_token: u32,

    /// Restart position ids after every end-of-document token
    #[serde(default)]
    pub reset_position_ids: bool,

    /// Block attention across document boundaries
    #[serde(default)]
    pub reset_attention_mask: bool,

    /// Zero the loss mask on end-of-document tokens
    #[serde(default)]
    pub eod_mask_loss: bool,

    /// Fused attention supplies causality itself; no explicit mask is built
    #[serde(default)]
    pub use_flash_attn: bool,

    #[serde(default)]
    pub sequence_parallel: SequenceParallelMode,

    /// Static, argument-driven curriculum: truncate downstream tensors to
    /// the curriculum sequence length
    #[serde(default)]
    pub curriculum_learning_legacy: bool,

    /// Scheduler-driven curriculum (truncate or reshape the raw batch)
    #[serde(default)]
    pub data_efficiency_curriculum_learning: bool,

    /// Scale applied to the summed auxiliary losses
    #[serde(default = "default_moe_loss_coeff")]
    pub moe_loss_coeff: f64,

    /// Experts per MoE layer (matches `GptConfig::num_experts`)
    #[serde(default = "default_num_experts")]
    pub num_experts: usize,

    #[serde(default)]
    pub distillation: Option<DistillationConfig>,
}

fn default_moe_loss_coeff() -> f64 {
    0.1
}

fn default_num_experts() -> usize {
    1
}

impl Default for TrainingStepConfig {
    fn default() -> Self {
        Self {
            seq_length: 1024,
            eod_token: 50256,
            reset_position_ids: false,
            reset_attention_mask: false,
            eod_mask_loss: false,
            use_flash_attn: false,
            sequence_parallel: SequenceParallelMode::Disabled,
            curriculum_learning_legacy: false,
            data_efficiency_curriculum_learning: false,
            moe_loss_coeff: default_moe_loss_coeff(),
            num_experts: default_num_experts(),
            distillation: None,
        }
    }
}

impl TrainingStepConfig {
    /// Load from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let config: Self = serde_json::from_reader(std::io::BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.seq_length == 0 {
            return Err(crate::PretrainError::Config(
                "seq_length must be > 0".to_string(),
            ));
        }

        if self.curriculum_learning_legacy && self.data_efficiency_curriculum_learning {
            return Err(crate::PretrainError::Config(
                "curriculum_learning_legacy and data_efficiency_curriculum_learning are mutually exclusive"
                    .to_string(),
            ));
        }

        if let Some(ref distill) = self.distillation {
            if distill.temperature <= 0.0 {
                return Err(crate::PretrainError::Config(format!(
                    "distillation temperature must be > 0, got {}",
                    distill.temperature
                )));
            }
        }

        Ok(())
    }

    /// Training mode selected once for the run
    pub fn mode(&self) -> TrainingMode {
        TrainingMode::from_config(self)
    }
}

/// Loss-combination mode, fixed for the whole run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingMode {
    /// Language-model loss only
    Standard,
    /// Language-model loss plus load-balancing loss
    LoadBalanced,
    /// Language-model, load-balancing and distillation losses
    Distillation(DistillationKind),
}

impl TrainingMode {
    pub fn from_config(config: &TrainingStepConfig) -> Self {
        match config.distillation {
            Some(ref distill) => TrainingMode::Distillation(distill.kind),
            None if config.num_experts > 1 => TrainingMode::LoadBalanced,
            None => TrainingMode::Standard,
        }
    }

    pub fn is_distillation(&self) -> bool {
        matches!(self, TrainingMode::Distillation(_))
    }
}
