//! Credential handling for authenticated API access.
//!
//! This module provides:
//! - `DeviceIdentity`: stable per-install fingerprint
//! - `TokenStore` / `Credential`: the persisted access/refresh token pair
//! - `RefreshCoordinator`: single-flight token refresh

pub mod device;
pub mod refresh;
pub mod tokens;

pub use device::DeviceIdentity;
pub use refresh::RefreshCoordinator;
pub use tokens::{Credential, TokenStore};
