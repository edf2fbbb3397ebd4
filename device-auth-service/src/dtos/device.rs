use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::models::TrustStatus;
use crate::services::VerificationMethod;

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct RegisterDeviceRequest {
    #[schema(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub user_id: Uuid,

    /// Client-generated device identifier. Sanitized server-side; must be
    /// 10-255 characters of [A-Za-z0-9_-] after sanitization.
    #[validate(length(min = 1, max = 512, message = "Device id is required"))]
    #[schema(example = "ios-A1B2C3D4E5F6")]
    pub device_id: String,

    #[schema(example = json!({"platform": "ios", "model": "iPhone 15", "os_version": "17.4"}))]
    #[serde(default)]
    pub device_info: serde_json::Value,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RegisterDeviceResponse {
    #[schema(example = "ios-A1B2C3D4E5F6")]
    pub device_id: String,
    /// The HMAC signing secret. Returned exactly once; store it in the
    /// device keychain.
    pub device_secret: String,
    pub trust_status: TrustStatus,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct TrustDeviceRequest {
    pub verification_method: VerificationMethod,
    /// Opaque proof payload for the chosen method; validated upstream.
    #[serde(default)]
    pub verification_data: Option<serde_json::Value>,
    /// Requested trust window in seconds, clamped to [3600, 7776000].
    #[schema(example = 2592000)]
    pub trust_duration_seconds: Option<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TrustDeviceResponse {
    pub trust_status: TrustStatus,
    pub trusted_until: DateTime<Utc>,
}
