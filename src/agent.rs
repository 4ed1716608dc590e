//! Agent session port.
//!
//! The orchestrator never talks to a model provider directly. It prepares an
//! [`AgentInvocation`] and hands it to the embedding application's
//! [`AgentRunner`], which owns transport, streaming, and transcript capture.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// One agent session: a prompt executed to completion in a working
/// directory.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    /// Project root the feature belongs to.
    pub project_path: PathBuf,
    /// Directory the agent works in (project root or a worktree).
    pub work_dir: PathBuf,
    pub feature_id: String,
    pub prompt: String,
    /// Image attachments, passed through from the feature.
    pub images: Vec<PathBuf>,
    /// Model tag, when the feature pins one.
    pub model: Option<String>,
    /// Cancelled when the run should stop; runners are expected to honor it.
    pub cancel: CancellationToken,
}

impl AgentInvocation {
    pub fn new(
        project_path: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
        feature_id: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            project_path: project_path.into(),
            work_dir: work_dir.into(),
            feature_id: feature_id.into(),
            prompt: prompt.into(),
            images: Vec::new(),
            model: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_images(mut self, images: Vec<PathBuf>) -> Self {
        self.images = images;
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Executes agent sessions on behalf of the orchestrator.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Run one session to completion. A run stopped through the invocation's
    /// cancel token should return an error mentioning the cancellation so
    /// classification can tell it apart from a real failure.
    async fn run(&self, invocation: AgentInvocation) -> anyhow::Result<()>;
}
