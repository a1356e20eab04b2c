use thiserror::Error;

pub type Result<T> = std::result::Result<T, CmError>;

#[derive(Debug, Error)]
pub enum CmError {
    #[error(transparent)]
    Engine(#[from] cm::Error),

    #[error("invalid argument: {0}")]
    Usage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}
