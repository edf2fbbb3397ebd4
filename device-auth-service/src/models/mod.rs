//! Persistent models owned by the device-auth subsystem.

mod device;
mod security_event;
mod token;
mod token_registry;

pub use device::{
    sanitize_device_id, DeviceRegistration, DeviceResponse, TrustStatus, DEVICE_ID_MAX_LEN,
    DEVICE_ID_MIN_LEN,
};
pub use security_event::{RiskTier, SecurityEvent, SecurityEventType};
pub use token::{should_rotate, AuthToken, TokenKind, ABILITY_ALL, ABILITY_LIMITED, ABILITY_REFRESH};
pub use token_registry::{RegistryStatus, TokenRegistryEntry};
