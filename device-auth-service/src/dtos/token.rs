use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct RefreshRequest {
    #[validate(length(min = 1, message = "Refresh token is required"))]
    #[schema(example = "550e8400-e29b-41d4-a716-446655440000|9f8e7d...")]
    pub refresh_token: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LongTermTokenResponse {
    /// Limited-ability token for background sync. Returned exactly once.
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RevokeTokensResponse {
    #[schema(example = 2)]
    pub tokens_revoked: u64,
}
