// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory collaborators for tests.
mod homeserver;
mod rooms;

pub use homeserver::{MockError, MockHomeserver, MockNetwork};
pub use rooms::MockRooms;

pub fn setup_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}
