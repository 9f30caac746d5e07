use thiserror::Error;

use crate::credentials::CredentialError;
use crate::crypto::CryptoError;
use crate::legacy_db::LegacyDbError;
use crate::manager::ManagerError;
use crate::mirror::MirrorError;
use crate::transport::TransportError;

/// Top-level error type returned by every fallible public `Engine` method.
///
/// Per-module error enums convert into this via `#[from]`; only configuration
/// errors and explicit `disable_sync` calls are meant to ever reach a caller —
/// everything else is handled internally and logged.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync cannot be enabled with an empty password")]
    EmptyPassword,

    #[error("sync requires a room id")]
    MissingRoomId,

    #[error("engine is not initialized")]
    NotInitialized,

    #[error("sync is already disabled")]
    AlreadyDisabled,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error(transparent)]
    Mirror(#[from] MirrorError),

    #[error(transparent)]
    LegacyDb(#[from] LegacyDbError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("worker request timed out")]
    WorkerTimeout,

    #[error("worker channel closed")]
    WorkerChannelClosed,

    #[error(transparent)]
    Codec(#[from] serde_json::Error),
}
