use thiserror::Error;

/// Errors raised by the shared resource pool.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("duplicate resource id: {0}")]
    Duplicate(String),

    #[error("resource not found id={0}")]
    NotFound(String),

    #[error("component `{0}` does not support shared use")]
    NotShared(String),

    #[error("no builder registered for component type `{0}`")]
    UnknownComponent(String),

    #[error("definition decode failed: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("component build failed: {0}")]
    Build(String),
}

/// Errors raised by the tenant registry and engine services.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workflow `{0}` not found")]
    WorkflowNotFound(String),

    #[error("tenant `{0}` not found")]
    TenantNotFound(String),

    #[error("workflow `{0}` is not deployed")]
    NotDeployed(String),

    #[error("definition decode failed: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("workflow `{id}` failed to compile: {reason}")]
    Compile { id: String, reason: String },

    #[error("invalid workflow definition: {0}")]
    Validation(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("tenant bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("script compile failed in {file}: {reason}")]
    Script { file: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Resource(#[from] ResourceError),
}
