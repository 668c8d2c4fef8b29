//! The bounded generation step.
//!
//! Builds the prompt for a [`ProjectContext`], sends it through a
//! [`MessageSender`] on a separate task, and waits at most the configured
//! timeout. On expiry the task is aborted and [`GenerationError::Timeout`] is
//! returned. The reply is unwrapped from any code fence and parsed into
//! [`DevOpsFiles`].

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::anthropic::{AnthropicError, Message, MessageSender, MessagesRequest};
use crate::job::{DevOpsFiles, ProjectContext};

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Timeout after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("{0}")]
    Configuration(String),

    #[error("AI error: {0}")]
    Remote(AnthropicError),

    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("generation task aborted: {0}")]
    Aborted(String),
}

impl From<AnthropicError> for GenerationError {
    fn from(err: AnthropicError) -> Self {
        match err {
            AnthropicError::MissingApiKey => GenerationError::Configuration(err.to_string()),
            other => GenerationError::Remote(other),
        }
    }
}

/// Model settings for the generation request.
#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-5-20250929".to_string(),
            max_tokens: 3000,
            temperature: 0.1,
            timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Clone)]
pub struct BoundedGeneration {
    sender: Arc<dyn MessageSender>,
    settings: GenerationSettings,
}

impl BoundedGeneration {
    pub fn new(sender: Arc<dyn MessageSender>, settings: GenerationSettings) -> Self {
        Self { sender, settings }
    }

    pub fn timeout(&self) -> Duration {
        self.settings.timeout
    }

    /// Generates the artifact triple for `context` within the configured timeout.
    pub async fn run(&self, context: &ProjectContext) -> Result<DevOpsFiles, GenerationError> {
        let request = MessagesRequest {
            model: self.settings.model.clone(),
            max_tokens: self.settings.max_tokens,
            temperature: Some(self.settings.temperature),
            messages: vec![Message::user(build_prompt(context))],
        };

        let sender = Arc::clone(&self.sender);
        let mut task = tokio::spawn(async move { sender.send_message(&request).await });

        let started = Instant::now();
        let response = match tokio::time::timeout(self.settings.timeout, &mut task).await {
            Ok(Ok(reply)) => reply?,
            Ok(Err(join_err)) => return Err(GenerationError::Aborted(join_err.to_string())),
            Err(_) => {
                task.abort();
                warn!(
                    timeout_secs = self.settings.timeout.as_secs_f64(),
                    stack = %context.stack,
                    "generation timed out, abandoning request"
                );
                return Err(GenerationError::Timeout(self.settings.timeout));
            }
        };
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            output_tokens = response.usage.output_tokens,
            "generation finished"
        );

        parse_files(&response.text())
    }
}

/// Lists every sampled file under a `--- <name> ---` header and asks for the
/// three artifacts as a JSON object.
pub fn build_prompt(context: &ProjectContext) -> String {
    let mut files = String::new();
    for (name, content) in &context.files {
        let _ = writeln!(files, "--- {name} ---\n{content}");
    }
    format!(
        "You are 'Spectra', an expert DevOps engineer. Generate production-ready DevOps files.\n\
         \n\
         Project: {stack}\n\
         Files:\n\
         {files}\n\
         Return ONLY valid JSON with keys: dockerfile, compose, github_action.",
        stack = context.stack,
    )
}

/// Removes a surrounding Markdown code fence (with or without a language tag).
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (e.g. `json`) on the opening line. A reply that
    // fits on one line carries the tag right before the payload.
    let body = match rest.find('\n') {
        Some(newline) if !rest[..newline].contains(['{', '[']) => &rest[newline + 1..],
        _ => rest.trim_start().trim_start_matches("json"),
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

pub fn parse_files(text: &str) -> Result<DevOpsFiles, GenerationError> {
    Ok(serde_json::from_str(strip_code_fence(text))?)
}
