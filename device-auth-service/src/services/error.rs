use service_core::error::AppError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    Database(anyhow::Error),

    #[error("Cache error: {0}")]
    Cache(anyhow::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("Device id invalid after sanitization")]
    InvalidDeviceId,

    #[error("Device already registered")]
    DuplicateDevice,

    #[error("Device limit exceeded (max {max_devices})")]
    DeviceLimitExceeded { max_devices: u32 },

    #[error("Device not found")]
    DeviceNotFound,

    #[error("Device already trusted")]
    AlreadyTrusted,

    #[error("Device is not trusted")]
    DeviceNotTrusted,

    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("Invalid or untrusted device")]
    InvalidDevice,

    #[error("Request timestamp outside tolerance")]
    TimestampSkew,

    #[error("Nonce already used")]
    NonceReused,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Token not found")]
    TokenNotFound,

    #[error("Token missing required ability")]
    MissingAbility,

    #[error("Token expired")]
    TokenExpired,

    #[error("Token refreshed too frequently")]
    RefreshTooFrequent { retry_after_seconds: u64 },
}

impl ServiceError {
    /// True for the request-verification failures that must not leak detail
    /// beyond a generic category in the HTTP response.
    pub fn is_security_validation(&self) -> bool {
        matches!(
            self,
            ServiceError::InvalidApiKey
                | ServiceError::InvalidDevice
                | ServiceError::TimestampSkew
                | ServiceError::NonceReused
                | ServiceError::InvalidSignature
        )
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        // Signature-scheme failures collapse into one generic 401 category to
        // avoid acting as an oracle for the signing scheme.
        if err.is_security_validation() {
            return AppError::AuthError(anyhow::anyhow!("Security validation failed"));
        }

        match err {
            ServiceError::Database(e) => AppError::DatabaseError(e),
            ServiceError::Cache(e) => AppError::InternalError(e),
            ServiceError::Internal(e) => AppError::InternalError(e),
            ServiceError::InvalidDeviceId => {
                AppError::BadRequest(anyhow::anyhow!("Device id must be 10-255 characters of [A-Za-z0-9_-]"))
            }
            ServiceError::DuplicateDevice => {
                AppError::Conflict(anyhow::anyhow!("Device already registered"))
            }
            ServiceError::DeviceLimitExceeded { max_devices } => AppError::Conflict(anyhow::anyhow!(
                "Device limit exceeded (max {} devices per user)",
                max_devices
            )),
            ServiceError::DeviceNotFound => AppError::NotFound(anyhow::anyhow!("Device not found")),
            ServiceError::AlreadyTrusted => {
                AppError::Conflict(anyhow::anyhow!("Device already trusted"))
            }
            ServiceError::DeviceNotTrusted => {
                AppError::Forbidden(anyhow::anyhow!("Device must be trusted for this operation"))
            }
            ServiceError::TokenNotFound => AppError::AuthError(anyhow::anyhow!("Invalid token")),
            ServiceError::MissingAbility => {
                AppError::Forbidden(anyhow::anyhow!("Token missing required ability"))
            }
            ServiceError::TokenExpired => AppError::AuthError(anyhow::anyhow!("Token expired")),
            ServiceError::RefreshTooFrequent {
                retry_after_seconds,
            } => AppError::TooManyRequests(
                "Token refreshed too frequently. Please try again later.".to_string(),
                Some(retry_after_seconds),
            ),
            // Handled above; unreachable but keeps the match exhaustive
            ServiceError::InvalidApiKey
            | ServiceError::InvalidDevice
            | ServiceError::TimestampSkew
            | ServiceError::NonceReused
            | ServiceError::InvalidSignature => {
                AppError::AuthError(anyhow::anyhow!("Security validation failed"))
            }
        }
    }
}
