use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    RateLimited,
    #[default]
    Internal,
}

impl ErrorCode {
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            400 | 413 | 422 => Self::Validation,
            429 => Self::RateLimited,
            _ => Self::Internal,
        }
    }
}

/// Error body returned by the messaging API. Only `message` is guaranteed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: ErrorCode,
    #[serde(default = "default_error_message")]
    pub message: String,
}

fn default_error_message() -> String {
    "An error occurred".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_fills_missing_fields() {
        let body: ApiError =
            serde_json::from_str(r#"{"message":"Message not found"}"#).expect("body");
        assert_eq!(body.code, ErrorCode::Internal);
        assert_eq!(body.message, "Message not found");

        let body: ApiError = serde_json::from_str(r#"{"code":"rate_limited"}"#).expect("body");
        assert_eq!(body.code, ErrorCode::RateLimited);
        assert_eq!(body.message, "An error occurred");
    }
}
