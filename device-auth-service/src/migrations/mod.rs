pub mod v1_device_auth;

pub use v1_device_auth::apply_v1_device_auth;
