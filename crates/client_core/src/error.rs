use shared::error::ErrorCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{0}")]
    Validation(String),
    #[error("not authenticated")]
    Unauthorized,
    #[error("api request failed ({status}): {message}")]
    Api {
        status: u16,
        code: ErrorCode,
        message: String,
    },
    #[error("http transport failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("upload failed: {0}")]
    Upload(String),
    #[error("no conversation is open")]
    NoActiveConversation,
}

impl ClientError {
    pub fn is_validation(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<ClientError>(), Some(ClientError::Validation(_)))
    }
}
