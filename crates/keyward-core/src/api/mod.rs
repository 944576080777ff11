//! HTTP layer.
//!
//! This module provides the `AuthApi` client for the remote authentication
//! endpoints and the `AuthenticatedRequestExecutor` that attaches bearer
//! tokens to outbound calls and re-authenticates after a 401.

pub mod client;
pub mod error;
pub mod executor;

pub use client::{AuthApi, HttpAuthApi, LoginResponse, RefreshResponse, User};
pub use error::ApiError;
pub use executor::{ApiRequest, AuthenticatedRequestExecutor};
