pub mod signature;

pub use signature::{canonical_string, generate_signature, verify_signature};
