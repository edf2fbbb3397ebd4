//! Token registry - links the live access/refresh pair for a device.
//!
//! At most one entry per (user, device); issuing a new pair overwrites the
//! row and revokes the tokens the old row pointed at, so stale pairs cannot
//! be retained indefinitely.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

use super::AuthToken;

/// The registry row. Status is not stored; it is derived at read time from
/// the referenced tokens.
#[derive(Debug, Clone, FromRow)]
pub struct TokenRegistryEntry {
    pub user_id: Uuid,
    pub device_id: String,
    pub access_token_id: Uuid,
    pub refresh_token_id: Uuid,
    /// Expiry of the pair as a whole (the refresh token's expiry).
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl TokenRegistryEntry {
    pub fn new(
        user_id: Uuid,
        device_id: String,
        access_token_id: Uuid,
        refresh_token_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id,
            device_id,
            access_token_id,
            refresh_token_id,
            expires_at,
            created_at: Utc::now(),
        }
    }
}

/// Derived pair status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RegistryStatus {
    /// Both tokens live.
    Active,
    /// Access expired, refresh still usable.
    RefreshOnly,
    /// Both expired.
    Expired,
    /// Either reference unresolvable or revoked.
    Invalid,
}

impl RegistryStatus {
    /// Compute the status from the resolved token references.
    pub fn derive(access: Option<&AuthToken>, refresh: Option<&AuthToken>) -> Self {
        let (access, refresh) = match (access, refresh) {
            (Some(a), Some(r)) => (a, r),
            _ => return RegistryStatus::Invalid,
        };

        if access.revoked || refresh.revoked {
            return RegistryStatus::Invalid;
        }

        match (access.is_expired(), refresh.is_expired()) {
            (false, false) => RegistryStatus::Active,
            (true, false) => RegistryStatus::RefreshOnly,
            (true, true) => RegistryStatus::Expired,
            // An access token outliving its refresh token does not occur with
            // the configured lifetimes; treat the pair as refresh-dead.
            (false, true) => RegistryStatus::Expired,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TokenKind;
    use chrono::Duration;

    fn pair() -> (AuthToken, AuthToken) {
        let user_id = Uuid::new_v4();
        let (access, _) = AuthToken::mint(
            user_id,
            "dev-abc1234567".into(),
            TokenKind::Access,
            Duration::minutes(15),
        );
        let (refresh, _) = AuthToken::mint(
            user_id,
            "dev-abc1234567".into(),
            TokenKind::Refresh,
            Duration::hours(24),
        );
        (access, refresh)
    }

    #[test]
    fn status_active_when_both_live() {
        let (access, refresh) = pair();
        assert_eq!(
            RegistryStatus::derive(Some(&access), Some(&refresh)),
            RegistryStatus::Active
        );
    }

    #[test]
    fn status_refresh_only_when_access_expired() {
        let (mut access, refresh) = pair();
        access.expires_at = Utc::now() - Duration::seconds(1);
        assert_eq!(
            RegistryStatus::derive(Some(&access), Some(&refresh)),
            RegistryStatus::RefreshOnly
        );
    }

    #[test]
    fn status_expired_when_both_expired() {
        let (mut access, mut refresh) = pair();
        access.expires_at = Utc::now() - Duration::hours(1);
        refresh.expires_at = Utc::now() - Duration::seconds(1);
        assert_eq!(
            RegistryStatus::derive(Some(&access), Some(&refresh)),
            RegistryStatus::Expired
        );
    }

    #[test]
    fn status_invalid_on_missing_or_revoked_reference() {
        let (access, mut refresh) = pair();
        assert_eq!(
            RegistryStatus::derive(None, Some(&refresh)),
            RegistryStatus::Invalid
        );
        assert_eq!(
            RegistryStatus::derive(Some(&access), None),
            RegistryStatus::Invalid
        );

        refresh.revoked = true;
        assert_eq!(
            RegistryStatus::derive(Some(&access), Some(&refresh)),
            RegistryStatus::Invalid
        );
    }
}
