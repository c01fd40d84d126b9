use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForemanError {
    #[error("not initialized: run 'foreman init'")]
    NotInitialized,

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid kind '{0}': must be lowercase alphanumeric with underscores")]
    InvalidKind(String),

    #[error("proposal not found: {0}")]
    ProposalNotFound(String),

    #[error("mission not found: {0}")]
    MissionNotFound(String),

    #[error("step not found: {0}")]
    StepNotFound(String),

    #[error("trigger not found: {0}")]
    TriggerNotFound(String),

    #[error("reaction not found: {0}")]
    ReactionNotFound(String),

    #[error("invalid {entity} transition from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("invalid status: {0}")]
    InvalidStatus(String),

    #[error("step execution failed: {0}")]
    StepExecution(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ForemanError>;
