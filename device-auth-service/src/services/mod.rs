//! Services layer for the device auth service.
//!
//! Business logic for device registration, trust, token issuance and
//! signed-request verification.

mod database;
mod device;
pub mod error;
mod events;
pub mod metrics;
mod nonce;
mod store;
mod token;
mod trust;
mod verifier;

pub use database::Database;
pub use device::{DeviceService, RegisteredDevice};
pub use error::ServiceError;
pub use events::{RequestMeta, SecurityEventService};
pub use nonce::{MemoryNonceCache, NonceCache, RedisNonceCache};
pub use store::{DeviceStore, MemoryStore, SecurityEventStore, TokenStore};
pub use token::{RegistryInfo, TokenPair, TokenService, TokenSettings, TokenValidation};
pub use trust::{TrustGrant, TrustService, VerificationMethod, DEFAULT_TRUST_DAYS};
pub use verifier::{SignatureSettings, SignatureVerifier, SignedRequest, VerifiedDevice};
