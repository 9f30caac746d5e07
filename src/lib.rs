//! Password-authenticated, end-to-end encrypted peer-to-peer synchronization
//! engine: a CRDT-backed Shared Document, a durable local mirror, a bridge
//! into a legacy record-oriented store, and an encrypted relay transport,
//! wired together behind a Sync Controller state machine and an optional
//! Worker Facade for running off the caller's own execution context.

pub mod bridge;
pub mod codec;
pub mod config;
pub mod controller;
pub mod credentials;
pub mod crypto;
pub mod doc;
pub mod engine;
pub mod error;
pub mod legacy_db;
pub mod manager;
pub mod mirror;
pub mod provider;
pub mod transport;
pub mod worker;

pub use codec::{Kind, PreferenceEntry, Record};
pub use config::SyncConfig;
pub use controller::{PersistedSessionState, SessionState, SyncMode};
pub use credentials::{CredentialError, CredentialStore, InMemoryCredentialStore};
pub use engine::{build_join_url, default_instance, install_default, parse_join_param, Engine, StatusSnapshot};
pub use error::SyncError;
pub use manager::SyncStatus;
pub use provider::{ActivitySample, PeerDescriptor};
pub use worker::{spawn_worker, WorkerEvent, WorkerHandle, WorkerRequest, WorkerResponse};
