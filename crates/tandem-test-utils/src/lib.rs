// tandem-test-utils: Shared test utilities for the RPC suites.
//
// Provides a raw wire-level peer (hand-encoded frames, no engine) and a
// set of stock controllers for end-to-end scenarios.

pub mod controllers;
pub mod harness;
pub mod raw_peer;

pub use controllers::{
    stock_registry, stock_scopes, CallLog, HomeController, MathController, SecretController,
};
pub use harness::{spawn_server, start_server_with, start_stock_server, TEST_VAULT_KEY};
pub use raw_peer::{RawEvent, RawPeer};

/// Install a permissive tracing subscriber for a test binary.  Safe to
/// call repeatedly; only the first call wins.
pub fn install_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}
