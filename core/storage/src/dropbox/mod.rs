//! Dropbox backend.
//!
//! This module provides the reference HTTP backend:
//! - OAuth2 authorization-code flow with an operator-entered code
//! - Upload, delete, recursive listing and streamed download over the
//!   Dropbox v2 API
//! - A fresh HTTP client handle per store operation

pub mod auth;
pub mod client;

pub use auth::{authorization_url, exchange_code};
pub use client::{DropboxBackend, DropboxConfig};
