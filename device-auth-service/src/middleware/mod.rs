pub mod api_key;
pub mod auth;
pub mod metrics;
pub mod signature;

pub use api_key::api_key_middleware;
pub use auth::{auth_middleware, BearerToken};
pub use metrics::metrics_middleware;
pub use signature::{signature_validation_middleware, DeviceIdentity};
