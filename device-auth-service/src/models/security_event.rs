//! Append-only security events with a numeric risk score.
//!
//! Events are consumed by external monitoring; the core never updates or
//! deletes them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Authentication-relevant event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    DeviceRegistered,
    DeviceRemoved,
    DeviceTrusted,
    DeviceTrustRevoked,
    TokensGenerated,
    TokensRefreshed,
    TokensRevoked,
    ApiKeyValidationFailed,
    DeviceValidationFailed,
    TimestampValidationFailed,
    NonceValidationFailed,
    SignatureValidationFailed,
    SecurityValidationSuccess,
    RateLimitExceeded,
}

impl SecurityEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityEventType::DeviceRegistered => "device_registered",
            SecurityEventType::DeviceRemoved => "device_removed",
            SecurityEventType::DeviceTrusted => "device_trusted",
            SecurityEventType::DeviceTrustRevoked => "device_trust_revoked",
            SecurityEventType::TokensGenerated => "tokens_generated",
            SecurityEventType::TokensRefreshed => "tokens_refreshed",
            SecurityEventType::TokensRevoked => "tokens_revoked",
            SecurityEventType::ApiKeyValidationFailed => "api_key_validation_failed",
            SecurityEventType::DeviceValidationFailed => "device_validation_failed",
            SecurityEventType::TimestampValidationFailed => "timestamp_validation_failed",
            SecurityEventType::NonceValidationFailed => "nonce_validation_failed",
            SecurityEventType::SignatureValidationFailed => "signature_validation_failed",
            SecurityEventType::SecurityValidationSuccess => "security_validation_success",
            SecurityEventType::RateLimitExceeded => "rate_limit_exceeded",
        }
    }
}

/// Severity tier derived from the risk score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskTier {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.90 {
            RiskTier::Critical
        } else if score >= 0.80 {
            RiskTier::High
        } else if score >= 0.60 {
            RiskTier::Medium
        } else if score >= 0.30 {
            RiskTier::Low
        } else {
            RiskTier::Info
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTier::Info => "info",
            RiskTier::Low => "low",
            RiskTier::Medium => "medium",
            RiskTier::High => "high",
            RiskTier::Critical => "critical",
        }
    }
}

/// One immutable security event.
#[derive(Debug, Clone, FromRow)]
pub struct SecurityEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub user_id: Option<Uuid>,
    pub tenant_id: Option<Uuid>,
    pub ip_address: String,
    pub user_agent: Option<String>,
    pub device_id: Option<String>,
    pub session_id: Option<String>,
    pub context: serde_json::Value,
    pub risk_score: f64,
    pub occurred_at: DateTime<Utc>,
}

impl SecurityEvent {
    pub fn new(event_type: SecurityEventType, risk_score: f64, ip_address: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.as_str().to_string(),
            user_id: None,
            tenant_id: None,
            ip_address: ip_address.into(),
            user_agent: None,
            device_id: None,
            session_id: None,
            context: serde_json::Value::Null,
            risk_score: risk_score.clamp(0.0, 1.0),
            occurred_at: Utc::now(),
        }
    }

    pub fn user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    pub fn risk_tier(&self) -> RiskTier {
        RiskTier::from_score(self.risk_score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_tier_boundaries() {
        assert_eq!(RiskTier::from_score(0.0), RiskTier::Info);
        assert_eq!(RiskTier::from_score(0.29), RiskTier::Info);
        assert_eq!(RiskTier::from_score(0.30), RiskTier::Low);
        assert_eq!(RiskTier::from_score(0.59), RiskTier::Low);
        assert_eq!(RiskTier::from_score(0.60), RiskTier::Medium);
        assert_eq!(RiskTier::from_score(0.79), RiskTier::Medium);
        assert_eq!(RiskTier::from_score(0.80), RiskTier::High);
        assert_eq!(RiskTier::from_score(0.89), RiskTier::High);
        assert_eq!(RiskTier::from_score(0.90), RiskTier::Critical);
        assert_eq!(RiskTier::from_score(1.0), RiskTier::Critical);
    }

    #[test]
    fn scores_are_clamped_to_unit_interval() {
        let event = SecurityEvent::new(SecurityEventType::DeviceRegistered, 1.7, "10.0.0.1");
        assert_eq!(event.risk_score, 1.0);
        let event = SecurityEvent::new(SecurityEventType::DeviceRegistered, -0.2, "10.0.0.1");
        assert_eq!(event.risk_score, 0.0);
    }

    #[test]
    fn builder_attaches_identity_fields() {
        let user_id = Uuid::new_v4();
        let event = SecurityEvent::new(SecurityEventType::DeviceTrusted, 0.1, "10.0.0.1")
            .user(user_id)
            .device("dev-abc1234567")
            .session("sess-0123456789")
            .context(serde_json::json!({"method": "otp"}));

        assert_eq!(event.user_id, Some(user_id));
        assert_eq!(event.device_id.as_deref(), Some("dev-abc1234567"));
        assert_eq!(event.session_id.as_deref(), Some("sess-0123456789"));
        assert_eq!(event.context["method"], "otp");
        assert_eq!(event.risk_tier(), RiskTier::Info);
    }
}
