//! Common types used throughout chasm.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Stable identifier of a share, used verbatim as the remote object name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ShareId(String);

impl ShareId {
    /// Create a new ShareId.
    ///
    /// # Preconditions
    /// - `sid` must be non-empty
    /// - `sid` must be a single path component (no separators, not `.` or `..`)
    ///
    /// # Errors
    /// - Returns error if the id cannot be used as a remote object name
    pub fn new(sid: impl Into<String>) -> crate::Result<Self> {
        let sid = sid.into();
        if sid.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Share id cannot be empty".to_string(),
            ));
        }
        if sid.contains('/') || sid.contains('\\') {
            return Err(crate::Error::InvalidInput(format!(
                "Share id cannot contain separators: {}",
                sid
            )));
        }
        if sid == "." || sid == ".." {
            return Err(crate::Error::InvalidInput(format!(
                "Share id is reserved: {}",
                sid
            )));
        }
        Ok(Self(sid))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ShareId {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::new(value)
    }
}

impl From<ShareId> for String {
    fn from(id: ShareId) -> Self {
        id.0
    }
}

impl fmt::Display for ShareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A logical backup unit: an identifier plus its opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Share {
    pub sid: ShareId,
    pub data: Vec<u8>,
}

impl Share {
    pub fn new(sid: ShareId, data: Vec<u8>) -> Self {
        Self { sid, data }
    }

    /// Exact payload length handed to the remote put.
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Stable identity of a remote account, unique per backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bearer credential for one remote account.
///
/// Opaque to everything but the backend that issued it. Zeroized on drop
/// and redacted from debug output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct AccessToken(String);

impl AccessToken {
    /// Wrap a token issued by a backend.
    ///
    /// # Errors
    /// - Returns error if the token is empty
    pub fn new(token: impl Into<String>) -> crate::Result<Self> {
        let token = token.into();
        if token.is_empty() {
            return Err(crate::Error::TokenExchange(
                "Backend issued an empty access token".to_string(),
            ));
        }
        Ok(Self(token))
    }

    /// Get the secret value.
    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessToken([REDACTED])")
    }
}
