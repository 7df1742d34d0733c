//! Router Module
//!
//! Handles model routing and API key pool management.

pub mod key_pool;
pub mod rotation;
pub mod route;

pub use key_pool::{
    Credential, CredentialStatus, KeyHandle, KeyLimits, KeyPool, KeyPoolStatus, KeyState,
    Outcome, RotationPolicy,
};
pub use rotation::KeyRing;
pub use route::{ModelRoute, RouteSource};
