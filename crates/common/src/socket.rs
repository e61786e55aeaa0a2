// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

use std::io;

use socket2::{Domain, Protocol, Socket, Type};

use crate::address::{AF_HYPERV, EndpointAddress, HV_PROTOCOL_RAW};

/// Default `listen(2)` backlog, same as the one used for TCP listeners.
pub const DEFAULT_BACKLOG: i32 = 512;

/// Blocking `AF_HYPERV` stream socket with the raw protocol.
///
/// # Errors
/// Fails where the platform has no Hyper-V socket provider.
pub fn new_socket() -> io::Result<Socket> {
    Socket::new(
        Domain::from(i32::from(AF_HYPERV)),
        Type::STREAM,
        Some(Protocol::from(HV_PROTOCOL_RAW)),
    )
}

/// Socket bound to `endpoint`, not listening yet.
///
/// # Errors
/// Socket creation or `bind` failure.
pub fn create_bound_socket(endpoint: &EndpointAddress) -> io::Result<Socket> {
    let socket = new_socket()?;
    socket.bind(&endpoint.to_sock_addr())?;
    Ok(socket)
}
