// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

pub mod client;
pub mod connector;
pub mod endpoint;
pub use crate::client::HvHttpClient;
pub use crate::connector::{ConnectorOptions, HvSocketConnector};
pub use crate::endpoint::EndpointConfig;
