//! Helpers for testing the JSON-RPC implementation.
//!
//! This module is only compiled when `test` is enabled
use std::sync::OnceLock;

use tokio::io::DuplexStream;

/// Create a pair of connected in-memory byte duplexes, suitable for hooking
/// up a client and a server without a real socket.
///
/// The first call also installs a test-writer tracing subscriber, so every
/// test that builds a pipe gets captured log output for free.  Override the
/// filter with `RUST_LOG` as usual.  The framing is chosen by whoever
/// mounts a channel on each half; both sides must pick the same one.
pub fn byte_pipe() -> (DuplexStream, DuplexStream) {
    static SUBSCRIBER: OnceLock<()> = OnceLock::new();
    SUBSCRIBER.get_or_init(|| {
        let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "jsonrpc_peer=debug".into());
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
    tokio::io::duplex(64 * 1024)
}
