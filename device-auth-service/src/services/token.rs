//! Token issuance, refresh, validation and revocation.
//!
//! Access/refresh pairs are registry-backed: issuing a new pair for a device
//! atomically supersedes the previous one, so at most one pair per
//! (user, device) is ever live. Long-term tokens sit outside the registry
//! and are only issued to currently-trusted devices.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::{
    should_rotate, AuthToken, RegistryStatus, SecurityEvent, SecurityEventType, TokenKind,
    TokenRegistryEntry, ABILITY_REFRESH,
};
use crate::services::{
    DeviceStore, RequestMeta, SecurityEventService, ServiceError, TokenStore,
};

#[derive(Debug, Clone)]
pub struct TokenSettings {
    pub access_lifetime_minutes: i64,
    pub refresh_lifetime_hours: i64,
    pub long_term_lifetime_days: i64,
    /// Fraction of the access token's lifetime after which rotation is due.
    pub rotation_threshold: f64,
    /// When off, introspection never advises rotation; clients renew only
    /// on expiry.
    pub auto_rotate: bool,
    /// Minimum seconds between pair issuances for one device.
    pub min_refresh_interval_seconds: i64,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            access_lifetime_minutes: 15,
            refresh_lifetime_hours: 24,
            long_term_lifetime_days: 30,
            rotation_threshold: 0.8,
            auto_rotate: true,
            min_refresh_interval_seconds: 60,
        }
    }
}

/// Freshly issued pair. The plaintext wire tokens appear here once and are
/// never recoverable afterwards.
#[derive(Debug, Serialize, ToSchema)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
}

/// Introspection result. Invalid and expired tokens still produce a 200
/// response carrying this body, so the fields are optional.
#[derive(Debug, Serialize, ToSchema)]
pub struct TokenValidation {
    pub valid: bool,
    pub expired: bool,
    pub should_rotate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<TokenKind>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub abilities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenValidation {
    fn invalid() -> Self {
        Self {
            valid: false,
            expired: false,
            should_rotate: false,
            kind: None,
            abilities: Vec::new(),
            user_id: None,
            device_id: None,
            expires_at: None,
        }
    }
}

/// Registry pair status for a device.
#[derive(Debug, Serialize, ToSchema)]
pub struct RegistryInfo {
    pub status: RegistryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct TokenService {
    tokens: Arc<dyn TokenStore>,
    devices: Arc<dyn DeviceStore>,
    events: SecurityEventService,
    settings: TokenSettings,
}

impl TokenService {
    pub fn new(
        tokens: Arc<dyn TokenStore>,
        devices: Arc<dyn DeviceStore>,
        events: SecurityEventService,
        settings: TokenSettings,
    ) -> Self {
        Self {
            tokens,
            devices,
            events,
            settings,
        }
    }

    fn mint_pair(&self, user_id: Uuid, device_id: &str) -> (AuthToken, AuthToken, TokenPair) {
        let (access, access_wire) = AuthToken::mint(
            user_id,
            device_id.to_string(),
            TokenKind::Access,
            Duration::minutes(self.settings.access_lifetime_minutes),
        );
        let (refresh, refresh_wire) = AuthToken::mint(
            user_id,
            device_id.to_string(),
            TokenKind::Refresh,
            Duration::hours(self.settings.refresh_lifetime_hours),
        );

        let pair = TokenPair {
            access_token: access_wire,
            refresh_token: refresh_wire,
            token_type: "Bearer".to_string(),
            access_expires_at: access.expires_at,
            refresh_expires_at: refresh.expires_at,
        };
        (access, refresh, pair)
    }

    /// Issue a fresh access/refresh pair for a registered device, superseding
    /// any pair the registry currently holds for it.
    pub async fn generate_tokens(
        &self,
        user_id: Uuid,
        device_id: &str,
        meta: &RequestMeta,
    ) -> Result<TokenPair, ServiceError> {
        if self
            .devices
            .find_device(user_id, device_id)
            .await
            .map_err(ServiceError::Database)?
            .is_none()
        {
            return Err(ServiceError::DeviceNotFound);
        }

        let (access, refresh, pair) = self.mint_pair(user_id, device_id);
        let entry = TokenRegistryEntry::new(
            user_id,
            device_id.to_string(),
            access.token_id,
            refresh.token_id,
            refresh.expires_at,
        );

        // Unconditional overwrite: generation always wins over whatever pair
        // was live before.
        self.tokens
            .supersede_pair(&entry, &access, &refresh, None)
            .await
            .map_err(ServiceError::Database)?;

        tracing::info!(user_id = %user_id, device_id = %device_id, "Token pair issued");

        self.events.log_async(
            SecurityEvent::new(SecurityEventType::TokensGenerated, 0.1, meta.ip_address.clone())
                .user(user_id)
                .device(device_id),
        );

        Ok(pair)
    }

    /// Exchange a refresh token for a new pair. The presented pair is revoked
    /// as part of the same atomic supersession.
    ///
    /// `device_id` is the caller's verified device; a refresh token bound to
    /// any other device is treated as unknown. The minimum-interval throttle
    /// is keyed on when the live pair was issued, so a refresh attempted
    /// within the interval of the initial `generate_tokens` call is also
    /// throttled.
    pub async fn refresh_tokens(
        &self,
        refresh_wire: &str,
        device_id: &str,
        meta: &RequestMeta,
    ) -> Result<TokenPair, ServiceError> {
        let token = self.resolve(refresh_wire).await?;

        // A token presented by a device other than the one it was minted for
        // is indistinguishable from an unknown token
        if token.device_id != device_id {
            return Err(ServiceError::TokenNotFound);
        }

        if !token.can(ABILITY_REFRESH) {
            return Err(ServiceError::MissingAbility);
        }
        if token.is_expired() {
            return Err(ServiceError::TokenExpired);
        }

        let entry = self
            .tokens
            .find_registry_entry(token.user_id, &token.device_id)
            .await
            .map_err(ServiceError::Database)?
            // A refresh token whose registry row is gone (or points elsewhere)
            // has been superseded or revoked
            .filter(|e| e.refresh_token_id == token.token_id)
            .ok_or(ServiceError::TokenNotFound)?;

        let pair_age = (Utc::now() - entry.created_at).num_seconds();
        if pair_age < self.settings.min_refresh_interval_seconds {
            let retry_after = (self.settings.min_refresh_interval_seconds - pair_age).max(1) as u64;
            self.events.log_async(
                SecurityEvent::new(
                    SecurityEventType::RateLimitExceeded,
                    0.4,
                    meta.ip_address.clone(),
                )
                .user(token.user_id)
                .device(token.device_id.clone())
                .context(serde_json::json!({ "operation": "token_refresh" })),
            );
            return Err(ServiceError::RefreshTooFrequent {
                retry_after_seconds: retry_after,
            });
        }

        let (access, refresh, pair) = self.mint_pair(token.user_id, &token.device_id);
        let new_entry = TokenRegistryEntry::new(
            token.user_id,
            token.device_id.clone(),
            access.token_id,
            refresh.token_id,
            refresh.expires_at,
        );

        let superseded = self
            .tokens
            .supersede_pair(
                &new_entry,
                &access,
                &refresh,
                Some((entry.access_token_id, entry.refresh_token_id)),
            )
            .await
            .map_err(ServiceError::Database)?;
        if !superseded {
            // Lost the race to a concurrent refresh; the presented token is
            // no longer the live one
            return Err(ServiceError::TokenNotFound);
        }

        tracing::info!(
            user_id = %token.user_id,
            device_id = %token.device_id,
            "Token pair refreshed"
        );

        self.events.log_async(
            SecurityEvent::new(SecurityEventType::TokensRefreshed, 0.1, meta.ip_address.clone())
                .user(token.user_id)
                .device(token.device_id.clone()),
        );

        Ok(pair)
    }

    /// Issue a long-term limited token. Only currently-trusted devices
    /// qualify; the token survives pair supersession.
    pub async fn issue_long_term(
        &self,
        user_id: Uuid,
        device_id: &str,
        meta: &RequestMeta,
    ) -> Result<(String, DateTime<Utc>), ServiceError> {
        let device = self
            .devices
            .find_device(user_id, device_id)
            .await
            .map_err(ServiceError::Database)?
            .ok_or(ServiceError::DeviceNotFound)?;

        if !device.is_currently_trusted() {
            return Err(ServiceError::DeviceNotTrusted);
        }

        let (token, wire) = AuthToken::mint(
            user_id,
            device_id.to_string(),
            TokenKind::LongTerm,
            Duration::days(self.settings.long_term_lifetime_days),
        );
        let expires_at = token.expires_at;
        self.tokens
            .insert_token(&token)
            .await
            .map_err(ServiceError::Database)?;

        tracing::info!(user_id = %user_id, device_id = %device_id, "Long-term token issued");

        self.events.log_async(
            SecurityEvent::new(SecurityEventType::TokensGenerated, 0.2, meta.ip_address.clone())
                .user(user_id)
                .device(device_id)
                .context(serde_json::json!({ "kind": "long_term" })),
        );

        Ok((wire, expires_at))
    }

    /// Resolve a wire token to its stored record, checking the secret hash
    /// and revocation. Expiry is left to the caller.
    async fn resolve(&self, wire: &str) -> Result<AuthToken, ServiceError> {
        let (token_id, secret) =
            AuthToken::parse_wire(wire).ok_or(ServiceError::TokenNotFound)?;
        let token = self
            .tokens
            .find_token(token_id)
            .await
            .map_err(ServiceError::Database)?
            .ok_or(ServiceError::TokenNotFound)?;

        if token.token_hash != AuthToken::hash_secret(secret) || token.revoked {
            return Err(ServiceError::TokenNotFound);
        }
        Ok(token)
    }

    /// Authenticate a bearer token for request handling. Expired and revoked
    /// tokens fail; the returned record carries the ability set.
    pub async fn authenticate(&self, wire: &str) -> Result<AuthToken, ServiceError> {
        let token = self.resolve(wire).await?;
        if token.is_expired() {
            return Err(ServiceError::TokenExpired);
        }
        self.tokens
            .touch_token(token.token_id)
            .await
            .map_err(ServiceError::Database)?;
        Ok(token)
    }

    /// Introspect a wire token. Never errors on bad input; an unparseable or
    /// unknown token is simply invalid.
    pub async fn validate_token(&self, wire: &str) -> Result<TokenValidation, ServiceError> {
        let token = match self.resolve(wire).await {
            Ok(token) => token,
            Err(ServiceError::TokenNotFound) => return Ok(TokenValidation::invalid()),
            Err(e) => return Err(e),
        };

        let expired = token.is_expired();
        Ok(TokenValidation {
            valid: !expired,
            expired,
            should_rotate: self.settings.auto_rotate
                && should_rotate(
                    token.created_at,
                    token.expires_at,
                    self.settings.rotation_threshold,
                    Utc::now(),
                ),
            kind: token.kind(),
            abilities: token.abilities.clone(),
            user_id: Some(token.user_id),
            device_id: Some(token.device_id.clone()),
            expires_at: Some(token.expires_at),
        })
    }

    /// Status of the registry pair for a device.
    pub async fn registry_info(
        &self,
        user_id: Uuid,
        device_id: &str,
    ) -> Result<RegistryInfo, ServiceError> {
        let entry = match self
            .tokens
            .find_registry_entry(user_id, device_id)
            .await
            .map_err(ServiceError::Database)?
        {
            Some(entry) => entry,
            None => {
                return Ok(RegistryInfo {
                    status: RegistryStatus::Invalid,
                    issued_at: None,
                    expires_at: None,
                })
            }
        };

        let access = self
            .tokens
            .find_token(entry.access_token_id)
            .await
            .map_err(ServiceError::Database)?;
        let refresh = self
            .tokens
            .find_token(entry.refresh_token_id)
            .await
            .map_err(ServiceError::Database)?;

        Ok(RegistryInfo {
            status: RegistryStatus::derive(access.as_ref(), refresh.as_ref()),
            issued_at: Some(entry.created_at),
            expires_at: Some(entry.expires_at),
        })
    }

    /// Revoke every live token for one device.
    pub async fn revoke_device_tokens(
        &self,
        user_id: Uuid,
        device_id: &str,
        meta: &RequestMeta,
    ) -> Result<u64, ServiceError> {
        let revoked = self
            .tokens
            .revoke_device_tokens(user_id, device_id)
            .await
            .map_err(ServiceError::Database)?;

        tracing::info!(
            user_id = %user_id,
            device_id = %device_id,
            tokens_revoked = revoked,
            "Device tokens revoked"
        );

        self.events.log_async(
            SecurityEvent::new(SecurityEventType::TokensRevoked, 0.3, meta.ip_address.clone())
                .user(user_id)
                .device(device_id)
                .context(serde_json::json!({ "tokens_revoked": revoked })),
        );

        Ok(revoked)
    }

    /// Revoke every live token for the user across all devices.
    pub async fn revoke_all_tokens(
        &self,
        user_id: Uuid,
        meta: &RequestMeta,
    ) -> Result<u64, ServiceError> {
        let revoked = self
            .tokens
            .revoke_all_tokens(user_id)
            .await
            .map_err(ServiceError::Database)?;

        tracing::info!(user_id = %user_id, tokens_revoked = revoked, "All user tokens revoked");

        self.events.log_async(
            SecurityEvent::new(SecurityEventType::TokensRevoked, 0.4, meta.ip_address.clone())
                .user(user_id)
                .context(serde_json::json!({ "tokens_revoked": revoked, "scope": "all_devices" })),
        );

        Ok(revoked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeviceRegistration;
    use crate::services::MemoryStore;

    const DEVICE_ID: &str = "dev-abc1234567";

    async fn setup(settings: TokenSettings) -> (TokenService, Arc<MemoryStore>, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let events = SecurityEventService::new(store.clone());
        let service = TokenService::new(store.clone(), store.clone(), events, settings);

        let user_id = Uuid::new_v4();
        store
            .insert_device(&DeviceRegistration::new(
                user_id,
                DEVICE_ID.to_string(),
                serde_json::json!({}),
                "device-secret".to_string(),
            ))
            .await
            .unwrap();
        (service, store, user_id)
    }

    fn no_throttle() -> TokenSettings {
        TokenSettings {
            min_refresh_interval_seconds: 0,
            ..TokenSettings::default()
        }
    }

    fn meta() -> RequestMeta {
        RequestMeta::new("10.0.0.1")
    }

    #[tokio::test]
    async fn generated_pair_validates() {
        let (service, _, user_id) = setup(no_throttle()).await;
        let pair = service
            .generate_tokens(user_id, DEVICE_ID, &meta())
            .await
            .unwrap();

        let access = service.validate_token(&pair.access_token).await.unwrap();
        assert!(access.valid);
        assert!(!access.expired);
        assert!(!access.should_rotate);
        assert_eq!(access.kind, Some(TokenKind::Access));
        assert_eq!(access.user_id, Some(user_id));
        assert_eq!(access.device_id.as_deref(), Some(DEVICE_ID));

        let refresh = service.validate_token(&pair.refresh_token).await.unwrap();
        assert!(refresh.valid);
        assert_eq!(refresh.kind, Some(TokenKind::Refresh));
    }

    #[tokio::test]
    async fn generate_requires_registered_device() {
        let (service, _, user_id) = setup(no_throttle()).await;
        let err = service
            .generate_tokens(user_id, "dev-unknown0000", &meta())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::DeviceNotFound));
    }

    #[tokio::test]
    async fn refresh_supersedes_old_pair() {
        let (service, _, user_id) = setup(no_throttle()).await;
        let old = service
            .generate_tokens(user_id, DEVICE_ID, &meta())
            .await
            .unwrap();

        let new = service
            .refresh_tokens(&old.refresh_token, DEVICE_ID, &meta())
            .await
            .unwrap();
        assert_ne!(new.access_token, old.access_token);

        // The superseded pair is dead immediately
        let stale_access = service.validate_token(&old.access_token).await.unwrap();
        assert!(!stale_access.valid);
        let err = service
            .refresh_tokens(&old.refresh_token, DEVICE_ID, &meta())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::TokenNotFound));

        // The new pair works
        assert!(service.validate_token(&new.access_token).await.unwrap().valid);
        service
            .refresh_tokens(&new.refresh_token, DEVICE_ID, &meta())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn refresh_rejects_token_bound_to_another_device() {
        let (service, store, user_id) = setup(no_throttle()).await;
        store
            .insert_device(&DeviceRegistration::new(
                user_id,
                "dev-second00001".to_string(),
                serde_json::json!({}),
                "other-secret".to_string(),
            ))
            .await
            .unwrap();

        let pair = service
            .generate_tokens(user_id, DEVICE_ID, &meta())
            .await
            .unwrap();

        // Presenting the pair from the second device must not rotate it
        let err = service
            .refresh_tokens(&pair.refresh_token, "dev-second00001", &meta())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::TokenNotFound));

        // The pair is untouched and the owning device can still refresh
        assert!(service.validate_token(&pair.access_token).await.unwrap().valid);
        service
            .refresh_tokens(&pair.refresh_token, DEVICE_ID, &meta())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn refresh_rejects_non_refresh_tokens() {
        let (service, store, user_id) = setup(no_throttle()).await;

        // Long-term tokens lack the refresh ability
        store
            .set_trust(
                user_id,
                DEVICE_ID,
                true,
                Some(Utc::now()),
                Some(Utc::now() + Duration::days(30)),
            )
            .await
            .unwrap();
        let (long_term, _) = service
            .issue_long_term(user_id, DEVICE_ID, &meta())
            .await
            .unwrap();
        assert!(matches!(
            service.refresh_tokens(&long_term, DEVICE_ID, &meta()).await,
            Err(ServiceError::MissingAbility)
        ));

        // An access token carries "*" and passes the ability check, but its
        // registry row references it as the access half, not the refresh half
        let pair = service
            .generate_tokens(user_id, DEVICE_ID, &meta())
            .await
            .unwrap();
        assert!(matches!(
            service
                .refresh_tokens(&pair.access_token, DEVICE_ID, &meta())
                .await,
            Err(ServiceError::TokenNotFound)
        ));

        // Malformed and unknown tokens
        assert!(matches!(
            service.refresh_tokens("garbage", DEVICE_ID, &meta()).await,
            Err(ServiceError::TokenNotFound)
        ));
        assert!(matches!(
            service
                .refresh_tokens(
                    &format!("{}|wrong-secret", Uuid::new_v4()),
                    DEVICE_ID,
                    &meta()
                )
                .await,
            Err(ServiceError::TokenNotFound)
        ));
    }

    #[tokio::test]
    async fn refresh_throttled_by_pair_age() {
        let (service, _, user_id) = setup(TokenSettings::default()).await;
        let pair = service
            .generate_tokens(user_id, DEVICE_ID, &meta())
            .await
            .unwrap();

        let err = service
            .refresh_tokens(&pair.refresh_token, DEVICE_ID, &meta())
            .await
            .unwrap_err();
        match err {
            ServiceError::RefreshTooFrequent {
                retry_after_seconds,
            } => assert!(retry_after_seconds >= 1 && retry_after_seconds <= 60),
            other => panic!("expected RefreshTooFrequent, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn expired_refresh_token_is_rejected() {
        let (service, store, user_id) = setup(no_throttle()).await;
        let pair = service
            .generate_tokens(user_id, DEVICE_ID, &meta())
            .await
            .unwrap();

        // Force the refresh token past its expiry
        let (token_id, _) = AuthToken::parse_wire(&pair.refresh_token).unwrap();
        let mut token = store.find_token(token_id).await.unwrap().unwrap();
        token.expires_at = Utc::now() - Duration::seconds(1);
        store.insert_token(&token).await.unwrap();

        let err = service
            .refresh_tokens(&pair.refresh_token, DEVICE_ID, &meta())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::TokenExpired));
    }

    #[tokio::test]
    async fn long_term_requires_current_trust() {
        let (service, store, user_id) = setup(no_throttle()).await;

        let err = service
            .issue_long_term(user_id, DEVICE_ID, &meta())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::DeviceNotTrusted));

        store
            .set_trust(
                user_id,
                DEVICE_ID,
                true,
                Some(Utc::now()),
                Some(Utc::now() + Duration::days(30)),
            )
            .await
            .unwrap();

        let (wire, expires_at) = service
            .issue_long_term(user_id, DEVICE_ID, &meta())
            .await
            .unwrap();
        assert!(expires_at > Utc::now() + Duration::days(29));

        let validation = service.validate_token(&wire).await.unwrap();
        assert!(validation.valid);
        assert_eq!(validation.kind, Some(TokenKind::LongTerm));
        assert_eq!(validation.abilities, vec!["limited".to_string()]);
    }

    #[tokio::test]
    async fn long_term_survives_pair_supersession() {
        let (service, store, user_id) = setup(no_throttle()).await;
        store
            .set_trust(
                user_id,
                DEVICE_ID,
                true,
                Some(Utc::now()),
                Some(Utc::now() + Duration::days(30)),
            )
            .await
            .unwrap();

        let (long_term, _) = service
            .issue_long_term(user_id, DEVICE_ID, &meta())
            .await
            .unwrap();
        let pair = service
            .generate_tokens(user_id, DEVICE_ID, &meta())
            .await
            .unwrap();
        service
            .refresh_tokens(&pair.refresh_token, DEVICE_ID, &meta())
            .await
            .unwrap();

        assert!(service.validate_token(&long_term).await.unwrap().valid);
    }

    #[tokio::test]
    async fn revoke_all_kills_every_token() {
        let (service, store, user_id) = setup(no_throttle()).await;
        store
            .insert_device(&DeviceRegistration::new(
                user_id,
                "dev-second00001".to_string(),
                serde_json::json!({}),
                "other-secret".to_string(),
            ))
            .await
            .unwrap();

        let first = service
            .generate_tokens(user_id, DEVICE_ID, &meta())
            .await
            .unwrap();
        let second = service
            .generate_tokens(user_id, "dev-second00001", &meta())
            .await
            .unwrap();

        let revoked = service.revoke_all_tokens(user_id, &meta()).await.unwrap();
        assert_eq!(revoked, 4);

        assert!(!service.validate_token(&first.access_token).await.unwrap().valid);
        assert!(!service.validate_token(&second.access_token).await.unwrap().valid);
        assert!(matches!(
            service
                .refresh_tokens(&first.refresh_token, DEVICE_ID, &meta())
                .await,
            Err(ServiceError::TokenNotFound)
        ));
    }

    #[tokio::test]
    async fn revoke_device_scoped_to_one_device() {
        let (service, store, user_id) = setup(no_throttle()).await;
        store
            .insert_device(&DeviceRegistration::new(
                user_id,
                "dev-second00001".to_string(),
                serde_json::json!({}),
                "other-secret".to_string(),
            ))
            .await
            .unwrap();

        let first = service
            .generate_tokens(user_id, DEVICE_ID, &meta())
            .await
            .unwrap();
        let second = service
            .generate_tokens(user_id, "dev-second00001", &meta())
            .await
            .unwrap();

        let revoked = service
            .revoke_device_tokens(user_id, DEVICE_ID, &meta())
            .await
            .unwrap();
        assert_eq!(revoked, 2);

        assert!(!service.validate_token(&first.access_token).await.unwrap().valid);
        assert!(service.validate_token(&second.access_token).await.unwrap().valid);
    }

    #[tokio::test]
    async fn authenticate_rejects_expired_and_revoked() {
        let (service, store, user_id) = setup(no_throttle()).await;
        let pair = service
            .generate_tokens(user_id, DEVICE_ID, &meta())
            .await
            .unwrap();

        let token = service.authenticate(&pair.access_token).await.unwrap();
        assert!(token.can("anything"));

        let (token_id, _) = AuthToken::parse_wire(&pair.access_token).unwrap();
        let mut stored = store.find_token(token_id).await.unwrap().unwrap();
        stored.expires_at = Utc::now() - Duration::seconds(1);
        store.insert_token(&stored).await.unwrap();
        assert!(matches!(
            service.authenticate(&pair.access_token).await,
            Err(ServiceError::TokenExpired)
        ));

        service
            .revoke_device_tokens(user_id, DEVICE_ID, &meta())
            .await
            .unwrap();
        assert!(matches!(
            service.authenticate(&pair.refresh_token).await,
            Err(ServiceError::TokenNotFound)
        ));
    }

    #[tokio::test]
    async fn validation_reports_rotation_due() {
        let settings = TokenSettings {
            rotation_threshold: 0.0,
            ..no_throttle()
        };
        let (service, _, user_id) = setup(settings).await;
        let pair = service
            .generate_tokens(user_id, DEVICE_ID, &meta())
            .await
            .unwrap();

        let validation = service.validate_token(&pair.access_token).await.unwrap();
        assert!(validation.valid);
        assert!(validation.should_rotate);
    }

    #[tokio::test]
    async fn disabled_auto_rotate_suppresses_rotation_advice() {
        let settings = TokenSettings {
            rotation_threshold: 0.0,
            auto_rotate: false,
            ..no_throttle()
        };
        let (service, _, user_id) = setup(settings).await;
        let pair = service
            .generate_tokens(user_id, DEVICE_ID, &meta())
            .await
            .unwrap();

        let validation = service.validate_token(&pair.access_token).await.unwrap();
        assert!(validation.valid);
        assert!(!validation.should_rotate);
    }

    #[tokio::test]
    async fn registry_info_tracks_pair_status() {
        let (service, store, user_id) = setup(no_throttle()).await;

        let info = service.registry_info(user_id, DEVICE_ID).await.unwrap();
        assert_eq!(info.status, RegistryStatus::Invalid);

        let pair = service
            .generate_tokens(user_id, DEVICE_ID, &meta())
            .await
            .unwrap();
        let info = service.registry_info(user_id, DEVICE_ID).await.unwrap();
        assert_eq!(info.status, RegistryStatus::Active);
        assert!(info.expires_at.is_some());

        // Expire the access token only
        let (access_id, _) = AuthToken::parse_wire(&pair.access_token).unwrap();
        let mut access = store.find_token(access_id).await.unwrap().unwrap();
        access.expires_at = Utc::now() - Duration::seconds(1);
        store.insert_token(&access).await.unwrap();
        let info = service.registry_info(user_id, DEVICE_ID).await.unwrap();
        assert_eq!(info.status, RegistryStatus::RefreshOnly);
    }

    #[tokio::test]
    async fn unknown_token_is_invalid_not_an_error() {
        let (service, _, _) = setup(no_throttle()).await;

        let validation = service.validate_token("garbage").await.unwrap();
        assert!(!validation.valid);
        assert!(validation.user_id.is_none());

        let validation = service
            .validate_token(&format!("{}|deadbeef", Uuid::new_v4()))
            .await
            .unwrap();
        assert!(!validation.valid);
    }
}
