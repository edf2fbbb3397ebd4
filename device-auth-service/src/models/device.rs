//! Device registration model - one row per (user, device) pair.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// Minimum length of a device id after sanitization.
pub const DEVICE_ID_MIN_LEN: usize = 10;
/// Maximum length of a device id after sanitization.
pub const DEVICE_ID_MAX_LEN: usize = 255;

/// Strip characters outside `[A-Za-z0-9_-]` from a client-supplied device id.
///
/// Sanitization is deliberately permissive: disallowed characters are dropped
/// rather than rejected, and only the post-strip length check can fail the
/// request. The sanitized id is the one stored and the one the client must
/// sign with.
pub fn sanitize_device_id(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect()
}

/// Computed trust state exposed to clients instead of the raw stored flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TrustStatus {
    Trusted,
    TrustExpired,
    Untrusted,
}

impl TrustStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustStatus::Trusted => "trusted",
            TrustStatus::TrustExpired => "trust_expired",
            TrustStatus::Untrusted => "untrusted",
        }
    }
}

/// Device registration entity.
///
/// The stored `is_trusted` flag is never eagerly cleared when trust lapses;
/// "was trusted, lapsed" and "never trusted" are distinct states with audit
/// value. Callers must go through [`DeviceRegistration::is_currently_trusted`]
/// or [`DeviceRegistration::trust_status`].
#[derive(Debug, Clone, FromRow)]
pub struct DeviceRegistration {
    pub user_id: Uuid,
    pub device_id: String,
    pub device_info: serde_json::Value,
    /// Shared HMAC secret. Never logged, never serialized into responses
    /// after the initial registration reply.
    pub device_secret: String,
    pub is_trusted: bool,
    pub registered_at: DateTime<Utc>,
    pub trusted_at: Option<DateTime<Utc>>,
    pub trusted_until: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl DeviceRegistration {
    /// Create a new, untrusted registration.
    pub fn new(
        user_id: Uuid,
        device_id: String,
        device_info: serde_json::Value,
        device_secret: String,
    ) -> Self {
        Self {
            user_id,
            device_id,
            device_info,
            device_secret,
            is_trusted: false,
            registered_at: Utc::now(),
            trusted_at: None,
            trusted_until: None,
            last_used_at: None,
        }
    }

    /// True when the stored trust grant exists but its window has passed.
    pub fn is_trust_expired(&self) -> bool {
        self.is_trusted
            && self
                .trusted_until
                .map(|until| until < Utc::now())
                .unwrap_or(true)
    }

    /// Current-trust check: trusted flag set and the window still open.
    pub fn is_currently_trusted(&self) -> bool {
        self.is_trusted
            && self
                .trusted_until
                .map(|until| until >= Utc::now())
                .unwrap_or(false)
    }

    pub fn trust_status(&self) -> TrustStatus {
        if self.is_currently_trusted() {
            TrustStatus::Trusted
        } else if self.is_trusted {
            TrustStatus::TrustExpired
        } else {
            TrustStatus::Untrusted
        }
    }

    /// Convert to a response without the device secret.
    pub fn sanitized(&self) -> DeviceResponse {
        DeviceResponse {
            device_id: self.device_id.clone(),
            device_info: self.device_info.clone(),
            trust_status: self.trust_status(),
            registered_at: self.registered_at,
            trusted_until: self.trusted_until,
            last_used_at: self.last_used_at,
        }
    }
}

/// Device listing entry for API responses (no secret, computed trust).
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DeviceResponse {
    pub device_id: String,
    pub device_info: serde_json::Value,
    pub trust_status: TrustStatus,
    pub registered_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trusted_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn device() -> DeviceRegistration {
        DeviceRegistration::new(
            Uuid::new_v4(),
            "dev-abc1234567".to_string(),
            serde_json::json!({"platform": "ios"}),
            "secret".to_string(),
        )
    }

    #[test]
    fn sanitize_strips_disallowed_characters() {
        assert_eq!(sanitize_device_id("dev-abc 123!@#4567"), "dev-abc1234567");
        assert_eq!(sanitize_device_id("dev_ABC-123.4567"), "dev_ABC-1234567");
        assert_eq!(sanitize_device_id("!!!"), "");
    }

    #[test]
    fn fresh_registration_is_untrusted() {
        let d = device();
        assert!(!d.is_currently_trusted());
        assert!(!d.is_trust_expired());
        assert_eq!(d.trust_status(), TrustStatus::Untrusted);
    }

    #[test]
    fn lapsed_trust_keeps_stored_flag_but_reports_expired() {
        let mut d = device();
        d.is_trusted = true;
        d.trusted_at = Some(Utc::now() - Duration::hours(2));
        d.trusted_until = Some(Utc::now() - Duration::minutes(1));

        assert!(d.is_trust_expired());
        assert!(!d.is_currently_trusted());
        // The stored flag is deliberately left set until explicit revocation
        assert!(d.is_trusted);
        assert_eq!(d.trust_status(), TrustStatus::TrustExpired);
    }

    #[test]
    fn open_trust_window_is_currently_trusted() {
        let mut d = device();
        d.is_trusted = true;
        d.trusted_at = Some(Utc::now());
        d.trusted_until = Some(Utc::now() + Duration::days(30));

        assert!(d.is_currently_trusted());
        assert!(!d.is_trust_expired());
        assert_eq!(d.trust_status(), TrustStatus::Trusted);
    }

    #[test]
    fn sanitized_response_omits_secret() {
        let d = device();
        let json = serde_json::to_value(d.sanitized()).unwrap();
        assert!(json.get("device_secret").is_none());
        assert_eq!(json["trust_status"], "untrusted");
    }
}
