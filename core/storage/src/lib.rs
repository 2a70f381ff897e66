//! Store abstraction for chasm.
//!
//! A [`Store`] is one account on one backend that shares are uploaded to,
//! deleted from, listed, cleaned and restored from. Backends plug in through
//! the [`RemoteConnector`] / [`RemoteObjectStore`] traits; the workflows in
//! [`store`] are written once against those traits.
//!
//! # Design Principles
//! - Stateless clients: only the access token is kept, and each operation
//!   builds a fresh client handle from it
//! - Bounded calls: every remote call runs under a deadline, and only
//!   transient failures are retried
//! - Structured results: every operation reports failure as an [`Error`]
//!   in addition to logging it
//!
//! [`Error`]: chasm_common::Error

pub mod broker;
pub mod dropbox;
pub mod local;
pub mod memory;
pub mod preferences;
pub mod registry;
pub mod remote;
pub mod retry;
pub mod store;

pub use broker::{AuthCodeSource, Authorization, CredentialBroker, TerminalPrompt};
pub use dropbox::{DropboxBackend, DropboxConfig};
pub use local::LocalBackend;
pub use memory::MemoryBackend;
pub use preferences::Preferences;
pub use registry::{create_default_registry, ConnectorFactory, ConnectorRegistry, StoreRecord, StoreRegistry};
pub use remote::{AccountInfo, AppCredentials, RemoteConnector, RemoteEntry, RemoteObjectStore};
pub use retry::{RetryConfig, RetryExecutor};
pub use store::{CleanReport, RemoteStore, RestoredShares, Store, StoreConfig};
