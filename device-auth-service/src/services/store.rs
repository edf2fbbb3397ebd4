//! Storage seams for the auth subsystem.
//!
//! Production implementations live in [`super::Database`] (Postgres); the
//! in-memory [`MemoryStore`] backs single-process deployments and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::models::{AuthToken, DeviceRegistration, SecurityEvent, TokenRegistryEntry};

#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Insert a registration. Returns false when a row for the
    /// (user, device) pair already exists (the stored row is untouched).
    async fn insert_device(&self, device: &DeviceRegistration) -> Result<bool, anyhow::Error>;

    async fn find_device(
        &self,
        user_id: Uuid,
        device_id: &str,
    ) -> Result<Option<DeviceRegistration>, anyhow::Error>;

    /// Lookup by device id alone, used by the signature verifier which has
    /// no user context yet. Device ids are client-generated per physical
    /// device; on the rare collision the most recent registration wins.
    async fn find_device_by_id(
        &self,
        device_id: &str,
    ) -> Result<Option<DeviceRegistration>, anyhow::Error>;

    async fn list_devices(&self, user_id: Uuid) -> Result<Vec<DeviceRegistration>, anyhow::Error>;

    async fn count_devices(&self, user_id: Uuid) -> Result<i64, anyhow::Error>;

    /// Registrations for this user since `since`, for velocity scoring.
    async fn count_registered_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64, anyhow::Error>;

    /// Returns false when the device row does not exist.
    async fn set_trust(
        &self,
        user_id: Uuid,
        device_id: &str,
        is_trusted: bool,
        trusted_at: Option<DateTime<Utc>>,
        trusted_until: Option<DateTime<Utc>>,
    ) -> Result<bool, anyhow::Error>;

    async fn touch_device(&self, user_id: Uuid, device_id: &str) -> Result<(), anyhow::Error>;

    async fn delete_device(&self, user_id: Uuid, device_id: &str) -> Result<bool, anyhow::Error>;
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn insert_token(&self, token: &AuthToken) -> Result<(), anyhow::Error>;

    async fn find_token(&self, token_id: Uuid) -> Result<Option<AuthToken>, anyhow::Error>;

    async fn touch_token(&self, token_id: Uuid) -> Result<(), anyhow::Error>;

    async fn find_registry_entry(
        &self,
        user_id: Uuid,
        device_id: &str,
    ) -> Result<Option<TokenRegistryEntry>, anyhow::Error>;

    /// Atomically install a new token pair for the entry's (user, device):
    /// revoke the tokens the current registry row points at, insert the new
    /// pair, and overwrite the row.
    ///
    /// When `expected_prior` is set, the overwrite is conditional on the
    /// current row still referencing exactly those token ids; a concurrent
    /// supersession that got there first makes this call return false with
    /// no changes applied. This conditional update is the serialization
    /// point required for per-device linearizability.
    async fn supersede_pair(
        &self,
        entry: &TokenRegistryEntry,
        access: &AuthToken,
        refresh: &AuthToken,
        expected_prior: Option<(Uuid, Uuid)>,
    ) -> Result<bool, anyhow::Error>;

    /// Revoke every live token for the device and drop its registry row.
    /// Returns the number of tokens revoked.
    async fn revoke_device_tokens(
        &self,
        user_id: Uuid,
        device_id: &str,
    ) -> Result<u64, anyhow::Error>;

    /// Revoke every live token for the user across all devices.
    async fn revoke_all_tokens(&self, user_id: Uuid) -> Result<u64, anyhow::Error>;
}

#[async_trait]
pub trait SecurityEventStore: Send + Sync {
    async fn insert_event(&self, event: &SecurityEvent) -> Result<(), anyhow::Error>;
}

/// In-memory store implementing all three seams.
#[derive(Default)]
pub struct MemoryStore {
    devices: Mutex<HashMap<(Uuid, String), DeviceRegistration>>,
    tokens: Mutex<HashMap<Uuid, AuthToken>>,
    registry: Mutex<HashMap<(Uuid, String), TokenRegistryEntry>>,
    events: Mutex<Vec<SecurityEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded security events (test inspection).
    pub fn events(&self) -> Vec<SecurityEvent> {
        self.events
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    fn lock_err() -> anyhow::Error {
        anyhow::anyhow!("Memory store mutex poisoned")
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn insert_device(&self, device: &DeviceRegistration) -> Result<bool, anyhow::Error> {
        let mut devices = self.devices.lock().map_err(|_| Self::lock_err())?;
        let key = (device.user_id, device.device_id.clone());
        if devices.contains_key(&key) {
            return Ok(false);
        }
        devices.insert(key, device.clone());
        Ok(true)
    }

    async fn find_device(
        &self,
        user_id: Uuid,
        device_id: &str,
    ) -> Result<Option<DeviceRegistration>, anyhow::Error> {
        let devices = self.devices.lock().map_err(|_| Self::lock_err())?;
        Ok(devices.get(&(user_id, device_id.to_string())).cloned())
    }

    async fn find_device_by_id(
        &self,
        device_id: &str,
    ) -> Result<Option<DeviceRegistration>, anyhow::Error> {
        let devices = self.devices.lock().map_err(|_| Self::lock_err())?;
        Ok(devices
            .values()
            .filter(|d| d.device_id == device_id)
            .max_by_key(|d| d.registered_at)
            .cloned())
    }

    async fn list_devices(&self, user_id: Uuid) -> Result<Vec<DeviceRegistration>, anyhow::Error> {
        let devices = self.devices.lock().map_err(|_| Self::lock_err())?;
        let mut list: Vec<_> = devices
            .values()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect();
        list.sort_by_key(|d| d.registered_at);
        Ok(list)
    }

    async fn count_devices(&self, user_id: Uuid) -> Result<i64, anyhow::Error> {
        let devices = self.devices.lock().map_err(|_| Self::lock_err())?;
        Ok(devices.values().filter(|d| d.user_id == user_id).count() as i64)
    }

    async fn count_registered_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64, anyhow::Error> {
        let devices = self.devices.lock().map_err(|_| Self::lock_err())?;
        Ok(devices
            .values()
            .filter(|d| d.user_id == user_id && d.registered_at >= since)
            .count() as i64)
    }

    async fn set_trust(
        &self,
        user_id: Uuid,
        device_id: &str,
        is_trusted: bool,
        trusted_at: Option<DateTime<Utc>>,
        trusted_until: Option<DateTime<Utc>>,
    ) -> Result<bool, anyhow::Error> {
        let mut devices = self.devices.lock().map_err(|_| Self::lock_err())?;
        match devices.get_mut(&(user_id, device_id.to_string())) {
            Some(device) => {
                device.is_trusted = is_trusted;
                device.trusted_at = trusted_at;
                device.trusted_until = trusted_until;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn touch_device(&self, user_id: Uuid, device_id: &str) -> Result<(), anyhow::Error> {
        let mut devices = self.devices.lock().map_err(|_| Self::lock_err())?;
        if let Some(device) = devices.get_mut(&(user_id, device_id.to_string())) {
            device.last_used_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn delete_device(&self, user_id: Uuid, device_id: &str) -> Result<bool, anyhow::Error> {
        let mut devices = self.devices.lock().map_err(|_| Self::lock_err())?;
        Ok(devices.remove(&(user_id, device_id.to_string())).is_some())
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn insert_token(&self, token: &AuthToken) -> Result<(), anyhow::Error> {
        let mut tokens = self.tokens.lock().map_err(|_| Self::lock_err())?;
        tokens.insert(token.token_id, token.clone());
        Ok(())
    }

    async fn find_token(&self, token_id: Uuid) -> Result<Option<AuthToken>, anyhow::Error> {
        let tokens = self.tokens.lock().map_err(|_| Self::lock_err())?;
        Ok(tokens.get(&token_id).cloned())
    }

    async fn touch_token(&self, token_id: Uuid) -> Result<(), anyhow::Error> {
        let mut tokens = self.tokens.lock().map_err(|_| Self::lock_err())?;
        if let Some(token) = tokens.get_mut(&token_id) {
            token.last_used_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn find_registry_entry(
        &self,
        user_id: Uuid,
        device_id: &str,
    ) -> Result<Option<TokenRegistryEntry>, anyhow::Error> {
        let registry = self.registry.lock().map_err(|_| Self::lock_err())?;
        Ok(registry.get(&(user_id, device_id.to_string())).cloned())
    }

    async fn supersede_pair(
        &self,
        entry: &TokenRegistryEntry,
        access: &AuthToken,
        refresh: &AuthToken,
        expected_prior: Option<(Uuid, Uuid)>,
    ) -> Result<bool, anyhow::Error> {
        let mut registry = self.registry.lock().map_err(|_| Self::lock_err())?;
        let mut tokens = self.tokens.lock().map_err(|_| Self::lock_err())?;

        let key = (entry.user_id, entry.device_id.clone());
        let prior = registry.get(&key).cloned();

        if let Some(expected) = expected_prior {
            match &prior {
                Some(p) if (p.access_token_id, p.refresh_token_id) == expected => {}
                _ => return Ok(false),
            }
        }

        if let Some(p) = &prior {
            for id in [p.access_token_id, p.refresh_token_id] {
                if let Some(token) = tokens.get_mut(&id) {
                    token.revoked = true;
                }
            }
        }

        tokens.insert(access.token_id, access.clone());
        tokens.insert(refresh.token_id, refresh.clone());
        registry.insert(key, entry.clone());
        Ok(true)
    }

    async fn revoke_device_tokens(
        &self,
        user_id: Uuid,
        device_id: &str,
    ) -> Result<u64, anyhow::Error> {
        let mut registry = self.registry.lock().map_err(|_| Self::lock_err())?;
        let mut tokens = self.tokens.lock().map_err(|_| Self::lock_err())?;

        registry.remove(&(user_id, device_id.to_string()));

        let mut revoked = 0u64;
        for token in tokens.values_mut() {
            if token.user_id == user_id && token.device_id == device_id && !token.revoked {
                token.revoked = true;
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn revoke_all_tokens(&self, user_id: Uuid) -> Result<u64, anyhow::Error> {
        let mut registry = self.registry.lock().map_err(|_| Self::lock_err())?;
        let mut tokens = self.tokens.lock().map_err(|_| Self::lock_err())?;

        registry.retain(|(uid, _), _| *uid != user_id);

        let mut revoked = 0u64;
        for token in tokens.values_mut() {
            if token.user_id == user_id && !token.revoked {
                token.revoked = true;
                revoked += 1;
            }
        }
        Ok(revoked)
    }
}

#[async_trait]
impl SecurityEventStore for MemoryStore {
    async fn insert_event(&self, event: &SecurityEvent) -> Result<(), anyhow::Error> {
        let mut events = self.events.lock().map_err(|_| Self::lock_err())?;
        events.push(event.clone());
        Ok(())
    }
}
