//! Skips wiremock-based tests on hosts that cannot bind a localhost socket.
//!
//! Set `SEGFETCH_REQUIRE_SOCKET_TESTS=1` in CI so a sandbox that blocks
//! sockets fails loudly instead of passing vacuously.

use std::net::TcpListener;
use std::panic::Location;

use wiremock::MockServer;

const REQUIRE_ENV: &str = "SEGFETCH_REQUIRE_SOCKET_TESTS";

fn sockets_required() -> bool {
    std::env::var(REQUIRE_ENV)
        .is_ok_and(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes"
            )
        })
}

/// True (after logging why) when the caller should return early.
#[track_caller]
#[must_use]
pub fn localhost_unavailable() -> bool {
    let Err(error) = TcpListener::bind("127.0.0.1:0") else {
        return false;
    };

    let caller = Location::caller();
    let reason = format!(
        "[socket-bound-test] {}:{}: cannot bind 127.0.0.1 ({error})",
        caller.file(),
        caller.line()
    );
    assert!(!sockets_required(), "{reason}; {REQUIRE_ENV} is set");
    eprintln!("{reason}; skipping. Set {REQUIRE_ENV}=1 to fail instead.");
    true
}

/// A fresh mock server, or `None` when sockets are unavailable.
pub async fn start_mock_server_or_skip() -> Option<MockServer> {
    if localhost_unavailable() {
        None
    } else {
        Some(MockServer::start().await)
    }
}
