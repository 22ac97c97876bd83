use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

/// Stable wire codes carried in every non-2xx error envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidArgument,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    Timeout,
    UpstreamUnavailable,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::Timeout => "TIMEOUT",
            Self::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            Self::Internal => "INTERNAL",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidArgument => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::Timeout => 504,
            Self::UpstreamUnavailable => 503,
            Self::Internal => 500,
        }
    }
}

/// Typed error surface shared across every component boundary.
#[derive(Debug, Clone, Error)]
pub enum HubError {
    #[error("{message}")]
    InvalidArgument {
        message: String,
        details: Map<String, Value>,
    },
    #[error("{message}")]
    Unauthorized {
        message: String,
        details: Map<String, Value>,
    },
    #[error("{message}")]
    Forbidden {
        message: String,
        details: Map<String, Value>,
    },
    #[error("{message}")]
    NotFound {
        message: String,
        details: Map<String, Value>,
    },
    #[error("{message}")]
    Conflict {
        message: String,
        details: Map<String, Value>,
    },
    #[error("{message}")]
    Timeout {
        message: String,
        details: Map<String, Value>,
    },
    #[error("{message}")]
    UpstreamUnavailable {
        message: String,
        details: Map<String, Value>,
    },
    #[error("{message}")]
    Internal {
        message: String,
        details: Map<String, Value>,
    },
}

impl HubError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
            details: Map::new(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
            details: Map::new(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
            details: Map::new(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
            details: Map::new(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
            details: Map::new(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
            details: Map::new(),
        }
    }

    pub fn upstream_unavailable(message: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            message: message.into(),
            details: Map::new(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            details: Map::new(),
        }
    }

    /// Attaches one structured detail entry to the envelope.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details_mut().insert(key.into(), value.into());
        self
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            Self::Unauthorized { .. } => ErrorCode::Unauthorized,
            Self::Forbidden { .. } => ErrorCode::Forbidden,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::Conflict { .. } => ErrorCode::Conflict,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::UpstreamUnavailable { .. } => ErrorCode::UpstreamUnavailable,
            Self::Internal { .. } => ErrorCode::Internal,
        }
    }

    pub fn status_code(&self) -> u16 {
        self.code().status_code()
    }

    pub fn message(&self) -> &str {
        match self {
            Self::InvalidArgument { message, .. }
            | Self::Unauthorized { message, .. }
            | Self::Forbidden { message, .. }
            | Self::NotFound { message, .. }
            | Self::Conflict { message, .. }
            | Self::Timeout { message, .. }
            | Self::UpstreamUnavailable { message, .. }
            | Self::Internal { message, .. } => message,
        }
    }

    pub fn details(&self) -> &Map<String, Value> {
        match self {
            Self::InvalidArgument { details, .. }
            | Self::Unauthorized { details, .. }
            | Self::Forbidden { details, .. }
            | Self::NotFound { details, .. }
            | Self::Conflict { details, .. }
            | Self::Timeout { details, .. }
            | Self::UpstreamUnavailable { details, .. }
            | Self::Internal { details, .. } => details,
        }
    }

    fn details_mut(&mut self) -> &mut Map<String, Value> {
        match self {
            Self::InvalidArgument { details, .. }
            | Self::Unauthorized { details, .. }
            | Self::Forbidden { details, .. }
            | Self::NotFound { details, .. }
            | Self::Conflict { details, .. }
            | Self::Timeout { details, .. }
            | Self::UpstreamUnavailable { details, .. }
            | Self::Internal { details, .. } => details,
        }
    }

    pub fn to_envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            error: ErrorBody {
                code: self.code(),
                message: self.message().to_string(),
                details: self.details().clone(),
            },
        }
    }
}

/// Unified JSON error envelope: `{"error":{"code","message","details"}}`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    #[schema(value_type = Object)]
    pub details: Map<String, Value>,
}

impl From<HubError> for ErrorEnvelope {
    fn from(value: HubError) -> Self {
        value.to_envelope()
    }
}

impl From<&HubError> for ErrorEnvelope {
    fn from(value: &HubError) -> Self {
        value.to_envelope()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_to_expected_statuses() {
        assert_eq!(ErrorCode::InvalidArgument.status_code(), 400);
        assert_eq!(ErrorCode::Unauthorized.status_code(), 401);
        assert_eq!(ErrorCode::Forbidden.status_code(), 403);
        assert_eq!(ErrorCode::NotFound.status_code(), 404);
        assert_eq!(ErrorCode::Conflict.status_code(), 409);
        assert_eq!(ErrorCode::Timeout.status_code(), 504);
        assert_eq!(ErrorCode::UpstreamUnavailable.status_code(), 503);
        assert_eq!(ErrorCode::Internal.status_code(), 500);
    }

    #[test]
    fn envelope_serializes_stable_codes() {
        let envelope = HubError::conflict("thread already has an active turn")
            .with_detail("threadId", "th_1")
            .to_envelope();
        let encoded = serde_json::to_value(&envelope).expect("serialize envelope");
        assert_eq!(encoded["error"]["code"], "CONFLICT");
        assert_eq!(encoded["error"]["details"]["threadId"], "th_1");
    }
}
