// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

pub mod address;
pub mod connect;
pub mod error;
pub mod listener;
pub mod socket;
pub mod stream;
mod sys;

pub use crate::address::EndpointAddress;
pub use crate::connect::connect;
pub use crate::error::Error;
pub use crate::listener::HvSocketListener;
pub use crate::stream::HvSocketStream;
pub use tokio_util::sync::CancellationToken;
