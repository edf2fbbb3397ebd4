//! Device trust lifecycle.
//!
//! Trust is a time-boxed grant recorded against a registration after the
//! user proves presence through a secondary verification. Granting never
//! changes what endpoints a signed request may reach; it unlocks long-term
//! token issuance and feeds risk scoring.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::{SecurityEvent, SecurityEventType, TrustStatus};
use crate::services::{DeviceStore, RequestMeta, SecurityEventService, ServiceError};

const MIN_TRUST_SECONDS: i64 = 3600;
const MAX_TRUST_DAYS: i64 = 90;

/// Default trust window when no configured override applies.
pub const DEFAULT_TRUST_DAYS: i64 = 30;

/// How the user proved presence for the trust grant. The method feeds the
/// risk score of the recorded event, not the grant itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMethod {
    Biometric,
    Password,
    Otp,
}

impl VerificationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationMethod::Biometric => "biometric",
            VerificationMethod::Password => "password",
            VerificationMethod::Otp => "otp",
        }
    }

    /// Baseline risk of a grant made with this method. Biometric proof is
    /// the hardest to phish, password the easiest.
    pub fn grant_risk(&self) -> f64 {
        match self {
            VerificationMethod::Biometric => 0.05,
            VerificationMethod::Otp => 0.10,
            VerificationMethod::Password => 0.20,
        }
    }
}

#[derive(Debug)]
pub struct TrustGrant {
    pub trust_status: TrustStatus,
    pub trusted_until: DateTime<Utc>,
}

#[derive(Clone)]
pub struct TrustService {
    devices: Arc<dyn DeviceStore>,
    events: SecurityEventService,
    default_trust_days: i64,
}

impl TrustService {
    pub fn new(
        devices: Arc<dyn DeviceStore>,
        events: SecurityEventService,
        default_trust_days: i64,
    ) -> Self {
        Self {
            devices,
            events,
            default_trust_days,
        }
    }

    /// Grant trust to a registered device for a bounded window.
    ///
    /// The requested duration is clamped to [1 hour, 90 days]; omitting it
    /// yields the 30-day default. Re-granting over an expired window is
    /// allowed and refreshes the timestamps; re-granting while the window is
    /// still open is a conflict.
    pub async fn trust_device(
        &self,
        user_id: Uuid,
        device_id: &str,
        method: VerificationMethod,
        duration_seconds: Option<i64>,
        meta: &RequestMeta,
    ) -> Result<TrustGrant, ServiceError> {
        let device = self
            .devices
            .find_device(user_id, device_id)
            .await
            .map_err(ServiceError::Database)?
            .ok_or(ServiceError::DeviceNotFound)?;

        if device.is_currently_trusted() {
            return Err(ServiceError::AlreadyTrusted);
        }

        let duration = duration_seconds
            .unwrap_or(self.default_trust_days * 24 * 3600)
            .clamp(MIN_TRUST_SECONDS, MAX_TRUST_DAYS * 24 * 3600);

        let now = Utc::now();
        let trusted_until = now + Duration::seconds(duration);
        self.devices
            .set_trust(user_id, device_id, true, Some(now), Some(trusted_until))
            .await
            .map_err(ServiceError::Database)?;

        tracing::info!(
            user_id = %user_id,
            device_id = %device_id,
            method = method.as_str(),
            trusted_until = %trusted_until,
            "Device trusted"
        );

        self.events.log_async(
            SecurityEvent::new(
                SecurityEventType::DeviceTrusted,
                method.grant_risk(),
                meta.ip_address.clone(),
            )
            .user(user_id)
            .device(device_id)
            .context(serde_json::json!({
                "method": method.as_str(),
                "duration_seconds": duration,
            })),
        );

        Ok(TrustGrant {
            trust_status: TrustStatus::Trusted,
            trusted_until,
        })
    }

    /// Revoke trust from a device. Idempotent: revoking an untrusted device
    /// succeeds without an event.
    pub async fn revoke_trust(
        &self,
        user_id: Uuid,
        device_id: &str,
        meta: &RequestMeta,
    ) -> Result<(), ServiceError> {
        let device = self
            .devices
            .find_device(user_id, device_id)
            .await
            .map_err(ServiceError::Database)?
            .ok_or(ServiceError::DeviceNotFound)?;

        if !device.is_trusted {
            return Ok(());
        }

        self.devices
            .set_trust(user_id, device_id, false, None, None)
            .await
            .map_err(ServiceError::Database)?;

        tracing::info!(user_id = %user_id, device_id = %device_id, "Device trust revoked");

        self.events.log_async(
            SecurityEvent::new(
                SecurityEventType::DeviceTrustRevoked,
                0.3,
                meta.ip_address.clone(),
            )
            .user(user_id)
            .device(device_id),
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeviceRegistration;
    use crate::services::MemoryStore;

    const DEVICE_ID: &str = "dev-abc1234567";

    async fn setup() -> (TrustService, Arc<MemoryStore>, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let events = SecurityEventService::new(store.clone());
        let service = TrustService::new(store.clone(), events, DEFAULT_TRUST_DAYS);

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

    fn meta() -> RequestMeta {
        RequestMeta::new("10.0.0.1")
    }

    #[tokio::test]
    async fn default_grant_is_thirty_days() {
        let (service, store, user_id) = setup().await;

        let grant = service
            .trust_device(user_id, DEVICE_ID, VerificationMethod::Biometric, None, &meta())
            .await
            .unwrap();
        assert_eq!(grant.trust_status, TrustStatus::Trusted);
        assert!(grant.trusted_until > Utc::now() + Duration::days(29));
        assert!(grant.trusted_until <= Utc::now() + Duration::days(30));

        let device = store.find_device(user_id, DEVICE_ID).await.unwrap().unwrap();
        assert!(device.is_currently_trusted());
    }

    #[tokio::test]
    async fn duration_is_clamped_to_bounds() {
        let (service, _, user_id) = setup().await;

        // Below the floor: one hour minimum
        let grant = service
            .trust_device(
                user_id,
                DEVICE_ID,
                VerificationMethod::Otp,
                Some(10),
                &meta(),
            )
            .await
            .unwrap();
        assert!(grant.trusted_until >= Utc::now() + Duration::minutes(59));
        assert!(grant.trusted_until <= Utc::now() + Duration::hours(1));
    }

    #[tokio::test]
    async fn duration_capped_at_ninety_days() {
        let (service, _, user_id) = setup().await;

        let grant = service
            .trust_device(
                user_id,
                DEVICE_ID,
                VerificationMethod::Password,
                Some(365 * 24 * 3600),
                &meta(),
            )
            .await
            .unwrap();
        assert!(grant.trusted_until <= Utc::now() + Duration::days(90));
        assert!(grant.trusted_until > Utc::now() + Duration::days(89));
    }

    #[tokio::test]
    async fn trusting_an_already_trusted_device_conflicts() {
        let (service, _, user_id) = setup().await;

        service
            .trust_device(user_id, DEVICE_ID, VerificationMethod::Biometric, None, &meta())
            .await
            .unwrap();
        let err = service
            .trust_device(user_id, DEVICE_ID, VerificationMethod::Biometric, None, &meta())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::AlreadyTrusted));
    }

    #[tokio::test]
    async fn regrant_after_expiry_refreshes_the_window() {
        let (service, store, user_id) = setup().await;

        // Simulate a lapsed grant
        store
            .set_trust(
                user_id,
                DEVICE_ID,
                true,
                Some(Utc::now() - Duration::days(40)),
                Some(Utc::now() - Duration::days(10)),
            )
            .await
            .unwrap();
        let device = store.find_device(user_id, DEVICE_ID).await.unwrap().unwrap();
        assert!(device.is_trust_expired());

        let grant = service
            .trust_device(user_id, DEVICE_ID, VerificationMethod::Otp, None, &meta())
            .await
            .unwrap();
        assert_eq!(grant.trust_status, TrustStatus::Trusted);

        let device = store.find_device(user_id, DEVICE_ID).await.unwrap().unwrap();
        assert!(device.is_currently_trusted());
    }

    #[tokio::test]
    async fn revoke_clears_flag_and_timestamps() {
        let (service, store, user_id) = setup().await;

        service
            .trust_device(user_id, DEVICE_ID, VerificationMethod::Biometric, None, &meta())
            .await
            .unwrap();
        service.revoke_trust(user_id, DEVICE_ID, &meta()).await.unwrap();

        let device = store.find_device(user_id, DEVICE_ID).await.unwrap().unwrap();
        assert!(!device.is_trusted);
        assert!(device.trusted_at.is_none());
        assert!(device.trusted_until.is_none());
        assert_eq!(device.trust_status(), TrustStatus::Untrusted);
    }

    #[tokio::test]
    async fn revoke_is_idempotent() {
        let (service, store, user_id) = setup().await;

        service.revoke_trust(user_id, DEVICE_ID, &meta()).await.unwrap();
        service.revoke_trust(user_id, DEVICE_ID, &meta()).await.unwrap();

        // No trust-revoked event for a device that was never trusted
        assert!(store
            .events()
            .iter()
            .all(|e| e.event_type != "device_trust_revoked"));
    }

    #[tokio::test]
    async fn unknown_device_is_not_found() {
        let (service, _, user_id) = setup().await;

        assert!(matches!(
            service
                .trust_device(
                    user_id,
                    "dev-unknown0000",
                    VerificationMethod::Otp,
                    None,
                    &meta()
                )
                .await,
            Err(ServiceError::DeviceNotFound)
        ));
        assert!(matches!(
            service.revoke_trust(user_id, "dev-unknown0000", &meta()).await,
            Err(ServiceError::DeviceNotFound)
        ));
    }
}
