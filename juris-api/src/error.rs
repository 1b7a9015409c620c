//! Error types for the API crate

use juris_core::JurisError;
use thiserror::Error;

/// Errors raised while assembling or running the service.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Juris(#[from] JurisError),

    #[error("Telemetry initialization failed: {reason}")]
    Telemetry { reason: String },

    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("Startup failed: {reason}")]
    Startup { reason: String },
}

impl ApiError {
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub fn startup(reason: impl Into<String>) -> Self {
        Self::Startup {
            reason: reason.into(),
        }
    }
}

macro_rules! impl_from_domain {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for ApiError {
                fn from(err: $ty) -> Self {
                    ApiError::Juris(JurisError::from(err))
                }
            }
        )*
    };
}

impl_from_domain!(
    juris_core::ConnectionError,
    juris_core::LockError,
    juris_core::CacheError,
    juris_core::StorageError,
    juris_core::LlmError,
    juris_core::ConfigError,
);

/// Result type alias for API operations.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use juris_core::{LockError, StorageError};

    #[test]
    fn test_domain_errors_convert_through_juris_error() {
        let err = ApiError::from(LockError::Timeout {
            key: "chat:7".to_string(),
            timeout_ms: 3000,
        });
        assert!(matches!(err, ApiError::Juris(JurisError::Lock(_))));
        assert!(err.to_string().contains("chat:7"));

        let err = ApiError::from(StorageError::NotFound {
            id: "7".to_string(),
        });
        assert!(matches!(err, ApiError::Juris(JurisError::Storage(_))));
    }

    #[test]
    fn test_startup_error_display() {
        let err = ApiError::startup("no store URI");
        assert_eq!(err.to_string(), "Startup failed: no store URI");
    }
}
