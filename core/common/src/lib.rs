//! Common utilities and types shared across the chasm crates.
//!
//! This module provides the error taxonomy every store backend reports
//! through, and the identifiers that travel between the orchestrator
//! and the stores.

pub mod error;
pub mod types;

pub use error::{Error, RemoteOp, Result};
pub use types::{AccessToken, AccountId, Share, ShareId};
