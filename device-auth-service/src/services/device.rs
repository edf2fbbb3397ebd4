//! Device registration lifecycle.

use chrono::{Duration, Utc};
use rand::RngCore;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{
    sanitize_device_id, DeviceRegistration, DeviceResponse, SecurityEvent, SecurityEventType,
    TrustStatus, DEVICE_ID_MAX_LEN, DEVICE_ID_MIN_LEN,
};
use crate::services::{
    DeviceStore, RequestMeta, SecurityEventService, ServiceError, TokenStore,
};

/// Window used for registration-velocity risk scoring.
const VELOCITY_WINDOW_MINUTES: i64 = 60;

/// Result of a successful registration. The secret appears here exactly
/// once and is never retrievable again.
#[derive(Debug)]
pub struct RegisteredDevice {
    pub device_id: String,
    pub device_secret: String,
    pub trust_status: TrustStatus,
}

#[derive(Clone)]
pub struct DeviceService {
    devices: Arc<dyn DeviceStore>,
    tokens: Arc<dyn TokenStore>,
    events: SecurityEventService,
    max_devices_per_user: u32,
}

impl DeviceService {
    pub fn new(
        devices: Arc<dyn DeviceStore>,
        tokens: Arc<dyn TokenStore>,
        events: SecurityEventService,
        max_devices_per_user: u32,
    ) -> Self {
        Self {
            devices,
            tokens,
            events,
            max_devices_per_user,
        }
    }

    /// Register a device for a user and issue its signing secret.
    pub async fn register(
        &self,
        user_id: Uuid,
        raw_device_id: &str,
        device_info: serde_json::Value,
        meta: &RequestMeta,
    ) -> Result<RegisteredDevice, ServiceError> {
        let device_id = sanitize_device_id(raw_device_id);
        if device_id.len() < DEVICE_ID_MIN_LEN || device_id.len() > DEVICE_ID_MAX_LEN {
            return Err(ServiceError::InvalidDeviceId);
        }

        if self
            .devices
            .find_device(user_id, &device_id)
            .await
            .map_err(ServiceError::Database)?
            .is_some()
        {
            return Err(ServiceError::DuplicateDevice);
        }

        let count = self
            .devices
            .count_devices(user_id)
            .await
            .map_err(ServiceError::Database)?;
        if count >= i64::from(self.max_devices_per_user) {
            return Err(ServiceError::DeviceLimitExceeded {
                max_devices: self.max_devices_per_user,
            });
        }

        let recent = self
            .devices
            .count_registered_since(user_id, Utc::now() - Duration::minutes(VELOCITY_WINDOW_MINUTES))
            .await
            .map_err(ServiceError::Database)?;

        let device_secret = generate_device_secret();
        let device = DeviceRegistration::new(
            user_id,
            device_id.clone(),
            device_info,
            device_secret.clone(),
        );

        let inserted = self
            .devices
            .insert_device(&device)
            .await
            .map_err(ServiceError::Database)?;
        if !inserted {
            // Concurrent registration won the race
            return Err(ServiceError::DuplicateDevice);
        }

        tracing::info!(user_id = %user_id, device_id = %device_id, "Device registered");

        self.events.log_async(
            SecurityEvent::new(
                SecurityEventType::DeviceRegistered,
                registration_velocity_risk(recent),
                meta.ip_address.clone(),
            )
            .user(user_id)
            .device(device_id.clone())
            .context(serde_json::json!({ "recent_registrations": recent })),
        );

        Ok(RegisteredDevice {
            device_id,
            device_secret,
            trust_status: device.trust_status(),
        })
    }

    pub async fn list_devices(&self, user_id: Uuid) -> Result<Vec<DeviceResponse>, ServiceError> {
        let devices = self
            .devices
            .list_devices(user_id)
            .await
            .map_err(ServiceError::Database)?;
        Ok(devices.iter().map(DeviceRegistration::sanitized).collect())
    }

    /// Remove a device and revoke everything bound to it.
    pub async fn remove_device(
        &self,
        user_id: Uuid,
        device_id: &str,
        meta: &RequestMeta,
    ) -> Result<(), ServiceError> {
        let removed = self
            .devices
            .delete_device(user_id, device_id)
            .await
            .map_err(ServiceError::Database)?;
        if !removed {
            return Err(ServiceError::DeviceNotFound);
        }

        let revoked = self
            .tokens
            .revoke_device_tokens(user_id, device_id)
            .await
            .map_err(ServiceError::Database)?;

        tracing::info!(
            user_id = %user_id,
            device_id = %device_id,
            tokens_revoked = revoked,
            "Device removed"
        );

        self.events.log_async(
            SecurityEvent::new(SecurityEventType::DeviceRemoved, 0.2, meta.ip_address.clone())
                .user(user_id)
                .device(device_id)
                .context(serde_json::json!({ "tokens_revoked": revoked })),
        );

        Ok(())
    }
}

/// Many registrations for the same user in a short window raise suspicion.
fn registration_velocity_risk(recent_registrations: i64) -> f64 {
    (0.10 + 0.15 * recent_registrations as f64).min(0.90)
}

/// 32 bytes from the OS RNG, hex-encoded: 256 bits of entropy.
fn generate_device_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
