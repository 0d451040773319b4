use thiserror::Error;

#[derive(Debug, Error)]
pub enum TeachbackError {
    #[error("provider error: {0}")]
    Provider(String),

    #[error("provider returned no text")]
    EmptyReply,

    #[error("{0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("stage already submitted: {0}")]
    StageClosed(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type TbResult<T> = Result<T, TeachbackError>;
