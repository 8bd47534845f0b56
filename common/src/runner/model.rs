// Model runner capability contract

use crate::errors::RunnerError;
use async_trait::async_trait;

/// Fixed sampling parameters applied to every request in a job
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingOptions {
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u32,
}

impl From<&crate::config::RunnerConfig> for SamplingOptions {
    fn from(config: &crate::config::RunnerConfig) -> Self {
        Self {
            temperature: config.temperature,
            top_p: config.top_p,
            max_tokens: config.max_tokens,
        }
    }
}

/// One generation result with token accounting
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutput {
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub finish_reason: String,
}

impl GenerationOutput {
    pub fn total_tokens(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// The external inference capability the runner drives.
///
/// `load` may take seconds; the runner checks the heartbeat's
/// `loaded_model` first to avoid needless reloads.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModelRunner: Send + Sync {
    async fn load(&self, model: &str) -> Result<(), RunnerError>;

    async fn unload(&self) -> Result<(), RunnerError>;

    async fn generate(
        &self,
        prompts: &[String],
        options: &SamplingOptions,
    ) -> Result<Vec<GenerationOutput>, RunnerError>;
}
