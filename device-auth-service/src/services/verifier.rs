//! Signed-request verification.
//!
//! Checks run cheapest-first and every failure is recorded as a security
//! event with its own risk weight. Callers translate any failure into one
//! generic response; the event log keeps the real reason.
//!
//! The nonce is burned before the signature is checked, so a request that
//! fails signature verification still consumes its nonce. Replaying a
//! captured-but-broken request therefore never gets a second chance at the
//! MAC.

use chrono::Utc;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use service_core::utils::signature::verify_signature;

use crate::models::{SecurityEvent, SecurityEventType};
use crate::services::{
    DeviceStore, NonceCache, RequestMeta, SecurityEventService, ServiceError,
};

#[derive(Debug, Clone)]
pub struct SignatureSettings {
    /// Shared mobile API key, checked before anything device-specific.
    pub api_key: String,
    pub require_nonce: bool,
    /// Maximum absolute skew between the request timestamp and server time.
    /// Doubles as the nonce TTL: a nonce only needs remembering while its
    /// timestamp is still acceptable.
    pub timestamp_tolerance_seconds: i64,
    /// Path prefixes that only currently-trusted devices may reach.
    pub trusted_paths: Vec<String>,
    /// Consecutive signature failures before the device is locked out.
    pub max_failed_attempts: i64,
    pub lockout_duration_seconds: i64,
    /// Record an event on every successful verification too.
    pub instrument_success: bool,
}

impl Default for SignatureSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            require_nonce: true,
            timestamp_tolerance_seconds: 300,
            trusted_paths: Vec::new(),
            max_failed_attempts: 5,
            lockout_duration_seconds: 900,
            instrument_success: false,
        }
    }
}

/// The signature-relevant parts of an incoming request.
#[derive(Debug)]
pub struct SignedRequest<'a> {
    pub api_key: &'a str,
    pub device_id: &'a str,
    pub method: &'a str,
    pub path: &'a str,
    pub timestamp: i64,
    pub nonce: &'a str,
    pub body: Option<&'a str>,
    pub signature: &'a str,
}

/// Identity attached to a request that passed verification.
#[derive(Debug, Clone)]
pub struct VerifiedDevice {
    pub user_id: Uuid,
    pub device_id: String,
    pub trusted: bool,
}

#[derive(Clone)]
pub struct SignatureVerifier {
    devices: Arc<dyn DeviceStore>,
    nonces: Arc<dyn NonceCache>,
    events: SecurityEventService,
    settings: SignatureSettings,
}

impl SignatureVerifier {
    pub fn new(
        devices: Arc<dyn DeviceStore>,
        nonces: Arc<dyn NonceCache>,
        events: SecurityEventService,
        settings: SignatureSettings,
    ) -> Self {
        Self {
            devices,
            nonces,
            events,
            settings,
        }
    }

    /// Verify a signed request. On success the device's last-used timestamp
    /// is advanced and its failure counter cleared.
    pub async fn verify(
        &self,
        request: &SignedRequest<'_>,
        meta: &RequestMeta,
    ) -> Result<VerifiedDevice, ServiceError> {
        if request
            .api_key
            .as_bytes()
            .ct_eq(self.settings.api_key.as_bytes())
            .unwrap_u8()
            == 0
        {
            self.record_failure_event(
                SecurityEventType::ApiKeyValidationFailed,
                0.6,
                request,
                meta,
                None,
            );
            return Err(ServiceError::InvalidApiKey);
        }

        if self
            .nonces
            .is_locked_out(request.device_id)
            .await
            .map_err(ServiceError::Cache)?
        {
            self.record_failure_event(
                SecurityEventType::SignatureValidationFailed,
                0.85,
                request,
                meta,
                Some(serde_json::json!({ "reason": "locked_out" })),
            );
            return Err(ServiceError::InvalidDevice);
        }

        let device = match self
            .devices
            .find_device_by_id(request.device_id)
            .await
            .map_err(ServiceError::Database)?
        {
            Some(device) => device,
            None => {
                self.record_failure_event(
                    SecurityEventType::DeviceValidationFailed,
                    0.6,
                    request,
                    meta,
                    None,
                );
                return Err(ServiceError::InvalidDevice);
            }
        };

        let trusted = device.is_currently_trusted();
        if !trusted && self.path_requires_trust(request.path) {
            self.record_failure_event(
                SecurityEventType::DeviceValidationFailed,
                0.6,
                request,
                meta,
                Some(serde_json::json!({
                    "reason": "trust_required",
                    "trust_status": device.trust_status().as_str(),
                })),
            );
            return Err(ServiceError::InvalidDevice);
        }

        let skew = (Utc::now().timestamp() - request.timestamp).abs();
        if skew > self.settings.timestamp_tolerance_seconds {
            self.record_failure_event(
                SecurityEventType::TimestampValidationFailed,
                0.5,
                request,
                meta,
                Some(serde_json::json!({ "skew_seconds": skew })),
            );
            return Err(ServiceError::TimestampSkew);
        }

        if self.settings.require_nonce {
            let fresh = self
                .nonces
                .reserve_nonce(
                    request.device_id,
                    request.nonce,
                    self.settings.timestamp_tolerance_seconds,
                )
                .await
                .map_err(ServiceError::Cache)?;
            if !fresh {
                self.record_failure_event(
                    SecurityEventType::NonceValidationFailed,
                    0.8,
                    request,
                    meta,
                    None,
                );
                return Err(ServiceError::NonceReused);
            }
        }

        let matches = verify_signature(
            &device.device_secret,
            request.method,
            request.path,
            request.timestamp,
            request.nonce,
            request.body,
            request.signature,
        )
        .map_err(ServiceError::Internal)?;

        if !matches {
            let failures = self
                .nonces
                .record_failure(request.device_id, self.settings.lockout_duration_seconds)
                .await
                .map_err(ServiceError::Cache)?;

            if failures >= self.settings.max_failed_attempts {
                self.nonces
                    .lock_out(request.device_id, self.settings.lockout_duration_seconds)
                    .await
                    .map_err(ServiceError::Cache)?;
                self.record_failure_event(
                    SecurityEventType::SignatureValidationFailed,
                    0.85,
                    request,
                    meta,
                    Some(serde_json::json!({
                        "reason": "lockout_triggered",
                        "failures": failures,
                    })),
                );
            } else {
                self.record_failure_event(
                    SecurityEventType::SignatureValidationFailed,
                    0.7,
                    request,
                    meta,
                    Some(serde_json::json!({ "failures": failures })),
                );
            }
            return Err(ServiceError::InvalidSignature);
        }

        self.nonces
            .clear_failures(request.device_id)
            .await
            .map_err(ServiceError::Cache)?;
        self.devices
            .touch_device(device.user_id, &device.device_id)
            .await
            .map_err(ServiceError::Database)?;

        if self.settings.instrument_success {
            self.events.log_async(
                SecurityEvent::new(
                    SecurityEventType::SecurityValidationSuccess,
                    0.0,
                    meta.ip_address.clone(),
                )
                .user(device.user_id)
                .device(device.device_id.clone()),
            );
        }

        Ok(VerifiedDevice {
            user_id: device.user_id,
            device_id: device.device_id,
            trusted,
        })
    }

    fn path_requires_trust(&self, path: &str) -> bool {
        self.settings
            .trusted_paths
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    fn record_failure_event(
        &self,
        event_type: SecurityEventType,
        risk: f64,
        request: &SignedRequest<'_>,
        meta: &RequestMeta,
        context: Option<serde_json::Value>,
    ) {
        let mut event = SecurityEvent::new(event_type, risk, meta.ip_address.clone())
            .device(request.device_id)
            .context(context.unwrap_or_else(|| {
                serde_json::json!({
                    "method": request.method,
                    "path": request.path,
                })
            }));
        if let Some(agent) = &meta.user_agent {
            event = event.user_agent(agent.clone());
        }
        if let Some(session) = &meta.session_id {
            event = event.session(session.clone());
        }
        self.events.log_async(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeviceRegistration;
    use crate::services::{MemoryNonceCache, MemoryStore};
    use chrono::Duration;
    use service_core::utils::signature::generate_signature;

    const API_KEY: &str = "test-api-key";
    const DEVICE_ID: &str = "dev-abc1234567";
    const SECRET: &str = "device-secret";

    struct Harness {
        verifier: SignatureVerifier,
        store: Arc<MemoryStore>,
        user_id: Uuid,
    }

    async fn setup(settings: SignatureSettings) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let nonces = Arc::new(MemoryNonceCache::new());
        let events = SecurityEventService::new(store.clone());
        let verifier = SignatureVerifier::new(store.clone(), nonces, events, settings);

        let user_id = Uuid::new_v4();
        store
            .insert_device(&DeviceRegistration::new(
                user_id,
                DEVICE_ID.to_string(),
                serde_json::json!({}),
                SECRET.to_string(),
            ))
            .await
            .unwrap();

        Harness {
            verifier,
            store,
            user_id,
        }
    }

    fn settings() -> SignatureSettings {
        SignatureSettings {
            api_key: API_KEY.to_string(),
            ..SignatureSettings::default()
        }
    }

    fn meta() -> RequestMeta {
        RequestMeta::new("10.0.0.1")
    }

    fn signed<'a>(
        nonce: &'a str,
        timestamp: i64,
        body: Option<&'a str>,
        signature: &'a str,
    ) -> SignedRequest<'a> {
        SignedRequest {
            api_key: API_KEY,
            device_id: DEVICE_ID,
            method: "POST",
            path: "/api/inspections",
            timestamp,
            nonce,
            body,
            signature,
        }
    }

    fn sign(timestamp: i64, nonce: &str, body: Option<&str>) -> String {
        generate_signature(SECRET, "POST", "/api/inspections", timestamp, nonce, body).unwrap()
    }

    #[tokio::test]
    async fn valid_request_passes_and_touches_device() {
        let h = setup(settings()).await;
        let ts = Utc::now().timestamp();
        let sig = sign(ts, "nonce-1", Some(r#"{"a":1}"#));

        let verified = h
            .verifier
            .verify(&signed("nonce-1", ts, Some(r#"{"a":1}"#), &sig), &meta())
            .await
            .unwrap();
        assert_eq!(verified.user_id, h.user_id);
        assert_eq!(verified.device_id, DEVICE_ID);
        assert!(!verified.trusted);

        let device = h
            .store
            .find_device(h.user_id, DEVICE_ID)
            .await
            .unwrap()
            .unwrap();
        assert!(device.last_used_at.is_some());
    }

    #[tokio::test]
    async fn wrong_api_key_rejected_before_device_lookup() {
        let h = setup(settings()).await;
        let ts = Utc::now().timestamp();
        let sig = sign(ts, "nonce-1", None);

        let mut request = signed("nonce-1", ts, None, &sig);
        request.api_key = "wrong-key";
        let err = h.verifier.verify(&request, &meta()).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidApiKey));
    }

    #[tokio::test]
    async fn unknown_device_rejected() {
        let h = setup(settings()).await;
        let ts = Utc::now().timestamp();
        let sig = sign(ts, "nonce-1", None);

        let mut request = signed("nonce-1", ts, None, &sig);
        request.device_id = "dev-unknown0000";
        let err = h.verifier.verify(&request, &meta()).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidDevice));
    }

    #[tokio::test]
    async fn timestamp_tolerance_boundaries() {
        let h = setup(settings()).await;

        // One second inside the 300s window
        let ts = Utc::now().timestamp() - 299;
        let sig = sign(ts, "nonce-1", None);
        h.verifier
            .verify(&signed("nonce-1", ts, None, &sig), &meta())
            .await
            .unwrap();

        // Skew equal to the tolerance is still accepted; only strictly
        // greater skew is rejected
        let ts = Utc::now().timestamp() + 300;
        let sig = sign(ts, "nonce-2", None);
        h.verifier
            .verify(&signed("nonce-2", ts, None, &sig), &meta())
            .await
            .unwrap();

        // Outside it, in either direction
        let ts = Utc::now().timestamp() - 301;
        let sig = sign(ts, "nonce-3", None);
        assert!(matches!(
            h.verifier
                .verify(&signed("nonce-3", ts, None, &sig), &meta())
                .await,
            Err(ServiceError::TimestampSkew)
        ));

        let ts = Utc::now().timestamp() + 301;
        let sig = sign(ts, "nonce-4", None);
        assert!(matches!(
            h.verifier
                .verify(&signed("nonce-4", ts, None, &sig), &meta())
                .await,
            Err(ServiceError::TimestampSkew)
        ));
    }

    #[tokio::test]
    async fn nonce_replay_rejected() {
        let h = setup(settings()).await;
        let ts = Utc::now().timestamp();
        let sig = sign(ts, "nonce-1", None);

        h.verifier
            .verify(&signed("nonce-1", ts, None, &sig), &meta())
            .await
            .unwrap();
        let err = h
            .verifier
            .verify(&signed("nonce-1", ts, None, &sig), &meta())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NonceReused));
    }

    #[tokio::test]
    async fn nonce_burned_even_when_signature_fails() {
        let h = setup(settings()).await;
        let ts = Utc::now().timestamp();

        let err = h
            .verifier
            .verify(&signed("nonce-1", ts, None, "bad-signature"), &meta())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidSignature));

        // Retrying with the correct signature on the same nonce still fails
        let sig = sign(ts, "nonce-1", None);
        let err = h
            .verifier
            .verify(&signed("nonce-1", ts, None, &sig), &meta())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NonceReused));
    }

    #[tokio::test]
    async fn tampered_body_fails_signature() {
        let h = setup(settings()).await;
        let ts = Utc::now().timestamp();
        let sig = sign(ts, "nonce-1", Some(r#"{"amount":10}"#));

        let err = h
            .verifier
            .verify(
                &signed("nonce-1", ts, Some(r#"{"amount":99}"#), &sig),
                &meta(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidSignature));
    }

    #[tokio::test]
    async fn repeated_failures_lock_the_device_out() {
        let h = setup(SignatureSettings {
            max_failed_attempts: 3,
            ..settings()
        })
        .await;

        for i in 0..3 {
            let ts = Utc::now().timestamp();
            let nonce = format!("nonce-{}", i);
            let err = h
                .verifier
                .verify(&signed(&nonce, ts, None, "bad-signature"), &meta())
                .await
                .unwrap_err();
            assert!(matches!(err, ServiceError::InvalidSignature));
        }

        // A correctly signed request is now refused
        let ts = Utc::now().timestamp();
        let sig = sign(ts, "nonce-good", None);
        let err = h
            .verifier
            .verify(&signed("nonce-good", ts, None, &sig), &meta())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidDevice));
    }

    #[tokio::test]
    async fn success_resets_the_failure_counter() {
        let h = setup(SignatureSettings {
            max_failed_attempts: 3,
            ..settings()
        })
        .await;

        for i in 0..2 {
            let ts = Utc::now().timestamp();
            let nonce = format!("nonce-{}", i);
            let _ = h
                .verifier
                .verify(&signed(&nonce, ts, None, "bad-signature"), &meta())
                .await;
        }

        let ts = Utc::now().timestamp();
        let sig = sign(ts, "nonce-ok", None);
        h.verifier
            .verify(&signed("nonce-ok", ts, None, &sig), &meta())
            .await
            .unwrap();

        // Two more failures: still under the threshold after the reset
        for i in 2..4 {
            let ts = Utc::now().timestamp();
            let nonce = format!("nonce-{}", i);
            let _ = h
                .verifier
                .verify(&signed(&nonce, ts, None, "bad-signature"), &meta())
                .await;
        }
        let ts = Utc::now().timestamp();
        let sig = sign(ts, "nonce-ok2", None);
        h.verifier
            .verify(&signed("nonce-ok2", ts, None, &sig), &meta())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn trusted_paths_require_current_trust() {
        let h = setup(SignatureSettings {
            trusted_paths: vec!["/api/admin".to_string()],
            ..settings()
        })
        .await;
        let ts = Utc::now().timestamp();

        fn request<'a>(ts: i64, nonce: &'a str, sig: &'a str) -> SignedRequest<'a> {
            SignedRequest {
                api_key: API_KEY,
                device_id: DEVICE_ID,
                method: "GET",
                path: "/api/admin/reports",
                timestamp: ts,
                nonce,
                body: None,
                signature: sig,
            }
        }

        let sig =
            generate_signature(SECRET, "GET", "/api/admin/reports", ts, "nonce-1", None).unwrap();
        let err = h
            .verifier
            .verify(&request(ts, "nonce-1", &sig), &meta())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidDevice));

        // Grant trust and retry with a fresh nonce
        h.store
            .set_trust(
                h.user_id,
                DEVICE_ID,
                true,
                Some(Utc::now()),
                Some(Utc::now() + Duration::days(30)),
            )
            .await
            .unwrap();
        let sig2 =
            generate_signature(SECRET, "GET", "/api/admin/reports", ts, "nonce-2", None).unwrap();
        let verified = h
            .verifier
            .verify(&request(ts, "nonce-2", &sig2), &meta())
            .await
            .unwrap();
        assert!(verified.trusted);
    }

    #[tokio::test]
    async fn expired_trust_is_not_current_trust() {
        let h = setup(SignatureSettings {
            trusted_paths: vec!["/api/admin".to_string()],
            ..settings()
        })
        .await;

        h.store
            .set_trust(
                h.user_id,
                DEVICE_ID,
                true,
                Some(Utc::now() - Duration::days(40)),
                Some(Utc::now() - Duration::days(10)),
            )
            .await
            .unwrap();

        let ts = Utc::now().timestamp();
        let sig =
            generate_signature(SECRET, "GET", "/api/admin/reports", ts, "nonce-1", None).unwrap();
        let request = SignedRequest {
            api_key: API_KEY,
            device_id: DEVICE_ID,
            method: "GET",
            path: "/api/admin/reports",
            timestamp: ts,
            nonce: "nonce-1",
            body: None,
            signature: &sig,
        };
        let err = h.verifier.verify(&request, &meta()).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidDevice));
    }

    #[tokio::test]
    async fn failure_events_carry_typed_reasons_and_request_meta() {
        let h = setup(settings()).await;
        let ts = Utc::now().timestamp();

        let meta = RequestMeta {
            ip_address: "10.0.0.1".to_string(),
            user_agent: Some("inspect-app/2.1".to_string()),
            session_id: Some("sess-0123456789".to_string()),
        };
        let _ = h
            .verifier
            .verify(&signed("nonce-1", ts, None, "bad-signature"), &meta)
            .await;
        // The event write is spawned; give it a tick to land
        tokio::task::yield_now().await;

        let events = h.store.events();
        let event = events
            .iter()
            .find(|e| e.event_type == "signature_validation_failed")
            .expect("failure event recorded");
        assert_eq!(event.user_agent.as_deref(), Some("inspect-app/2.1"));
        assert_eq!(event.session_id.as_deref(), Some("sess-0123456789"));
    }
}
