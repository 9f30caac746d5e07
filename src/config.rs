use std::time::Duration;

/// Tunable constants for one `Engine`. A host application or test harness
/// overrides the handful of values that matter; everything else follows the
/// defaults baked into the named maps and the transport.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Default relay URL used when `enable_sync` is called without an explicit `server_url`.
    pub default_server_url: String,
    /// PBKDF2-HMAC-SHA256 iteration count for both the room-name and key derivations.
    pub pbkdf2_iterations: u32,
    /// Window during which a locally updated record survives a remote delete.
    pub recent_write_protection_window: Duration,
    /// Bounded ring size for `Activity Sample`s kept by the Sync Manager.
    pub activity_ring_capacity: usize,
    /// Bound on `DurableMirror::init` before it declares itself ready in degraded mode.
    pub mirror_ready_timeout: Duration,
    /// Bound on a single Worker Facade request/response round trip.
    pub worker_request_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_server_url: "wss://relay.sync-engine.example/".to_string(),
            pbkdf2_iterations: 210_000,
            recent_write_protection_window: Duration::from_secs(300),
            activity_ring_capacity: 50,
            mirror_ready_timeout: Duration::from_secs(10),
            worker_request_timeout: Duration::from_secs(30),
        }
    }
}
