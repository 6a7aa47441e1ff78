//! Error taxonomy for the orchestration pipeline.
//!
//! A malformed plan reply is deliberately absent here: it degrades to a run
//! without a task breakdown instead of failing.

use thiserror::Error;

use crate::types::RunStatus;

pub type Result<T> = std::result::Result<T, FanoutError>;

#[derive(Debug, Error)]
pub enum FanoutError {
    /// Missing or invalid model credentials, malformed config, missing tools.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The repository root cannot be enumerated at all.
    #[error("repository access error: {0}")]
    RepositoryAccess(String),

    /// The planning model call itself failed (network, auth, timeout).
    #[error("plan generation failed: {0}")]
    PlanGeneration(String),

    /// Creating the multiplexer session or one of its panes failed.
    #[error("launch failed: {0}")]
    Launch(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("run cannot move from `{from}` to `{to}`")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    #[error("run state error: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
