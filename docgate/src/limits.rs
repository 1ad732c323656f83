//! Process-wide tunables.

/// Default port browsers connect to.
pub const DEFAULT_CLIENT_PORT: u16 = 9980;

/// Default loopback port workers announce themselves on.
pub const DEFAULT_MASTER_PORT: u16 = 9981;

/// Upper bound on concurrently open documents.
pub const MAX_DOCUMENTS: usize = 10_000;

/// Upper bound on concurrent client connections.
pub const MAX_CONNECTIONS: usize = 100_000;

/// Baseline reactor poll timeout.
pub const DEFAULT_POLL_TIMEOUT_MS: i32 = 5_000;

/// Largest assembled websocket message we accept before closing 1009.
///
/// Typically bounded earlier by a fronting proxy; this is a backstop.
pub const WS_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Seconds without activity before a websocket is shut down 1001.
pub const WS_IDLE_TIMEOUT_SECS: u64 = 3_600;

/// Documents idle this long are terminated with reason "idle".
pub const IDLE_DOC_TIMEOUT_SECS: u64 = 3_600;

/// Root of a worker's document jail, below `<child_root>/<jail_id>`.
pub const JAILED_DOCUMENT_ROOT: &str = "/tmp/user/docs/";

/// Version hash baked into asset URLs and ETags.
pub const VERSION_HASH: &str = "f2e3a9c1";

/// Close-frame payload prefix when admission limits are hit.
pub fn limit_reached_payload(max_documents: usize, max_connections: usize) -> String {
    format!("error: cmd=internal kind=limitreached params={max_documents},{max_connections}")
}

/// Broadcast to every session when disk space runs low.
pub const PAYLOAD_DISKFULL: &str = "error: cmd=internal kind=diskfull";
