// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

pub mod address;
pub mod connection;
pub mod hvsock;
pub mod listener;
pub mod server;
pub mod socket;

pub use crate::address::{ListenAddress, PeerAddress};
pub use crate::connection::{Connection, ConnectionInfo, ConnectionStream};
pub use crate::hvsock::{HvSocketListenerFactory, HvSocketServerExt};
pub use crate::listener::{ConnectionListener, ListenerFactory};
pub use crate::server::{Incoming, ServerOptions, Transport};
pub use crate::socket::{SocketListener, SocketListenerFactory, SocketTransportOptions};

pub use hvsock_client as client;
pub use hvsock_common as common;

use anyhow::Context;

/// Initialize tracing from `HVSOCK_LOG`, with journald output when started by systemd.
///
/// # Errors
/// Fails if a global subscriber is already installed.
pub fn trace_init() -> anyhow::Result<()> {
    use std::env;
    use tracing::Level;
    use tracing_subscriber::{EnvFilter, Layer, filter::LevelFilter, layer::SubscriberExt};

    let env_filter =
        EnvFilter::try_from_env("HVSOCK_LOG").unwrap_or_else(|_| EnvFilter::from("info"));
    let is_debug_log_level = env_filter
        .max_level_hint()
        .is_some_and(|level| level >= Level::DEBUG);

    let output = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(is_debug_log_level)
        .with_file(is_debug_log_level)
        .with_line_number(is_debug_log_level)
        .with_thread_ids(is_debug_log_level);

    let output = if is_debug_log_level {
        output.pretty().boxed()
    } else {
        output.boxed()
    };

    // journald only when running as a systemd unit
    let journald = match env::var("INVOCATION_ID") {
        Err(_) => None,
        Ok(_) => tracing_journald::layer().ok(),
    };

    let subscriber = tracing_subscriber::registry()
        .with(journald.with_filter(LevelFilter::INFO))
        .with(output.with_filter(env_filter));

    tracing::subscriber::set_global_default(subscriber)
        .context("tracing shouldn't already have been set up")?;
    Ok(())
}
