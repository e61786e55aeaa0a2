// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Hyper-V socket endpoint: `(vm_id, service_id)` and its `SOCKADDR_HV` wire form.
//!
//! ```text
//!  0       2       4                  20                 36
//!  +-------+-------+------------------+------------------+
//!  | family| rsvd  |      vm_id       |    service_id    |
//!  +-------+-------+------------------+------------------+
//! ```
//!
//! Both identifiers use the platform GUID byte layout: `Data1` (u32), `Data2` (u16) and
//! `Data3` (u16) little-endian, followed by the 8 `Data4` bytes as-is.

use std::fmt;
use std::str::FromStr;

use socket2::SockAddr;
use uuid::{Uuid, uuid};

use crate::error::Error;

/// `AF_HYPERV` from `ws2def.h`.
pub const AF_HYPERV: u16 = 34;

/// `HV_PROTOCOL_RAW`, the only protocol paired with `AF_HYPERV`.
pub const HV_PROTOCOL_RAW: i32 = 1;

/// `sizeof(SOCKADDR_HV)`.
pub const HYPERV_SOCK_ADDR_SIZE: usize = 36;

const VM_ID_OFFSET: usize = 4;
const SERVICE_ID_OFFSET: usize = 20;

/// Listen for connections from any partition.
pub const HV_GUID_WILDCARD: Uuid = Uuid::nil();
/// Same value as [`HV_GUID_WILDCARD`], named as in `hvsocket.h`.
pub const HV_GUID_ZERO: Uuid = Uuid::nil();
pub const HV_GUID_BROADCAST: Uuid = uuid!("ffffffff-ffff-ffff-ffff-ffffffffffff");
/// All child partitions of the caller.
pub const HV_GUID_CHILDREN: Uuid = uuid!("90db8b89-0d35-4f79-8ce9-49ea0ac8b7cd");
/// The partition the caller runs in.
pub const HV_GUID_LOOPBACK: Uuid = uuid!("e0e16197-dd56-4a10-9195-5ee7a155a838");
/// The parent partition, i.e. the host when called from a guest.
pub const HV_GUID_PARENT: Uuid = uuid!("a42e7cda-d03f-480c-9cc2-a4de20abb878");
pub const HV_GUID_SILOHOST: Uuid = uuid!("36bd0c5c-7276-4223-88ba-7d03b654c568");

/// Service ids reachable from Linux guests as vsock ports: the port replaces `Data1`.
pub const HV_GUID_VSOCK_TEMPLATE: Uuid = uuid!("00000000-facb-11e6-bd58-64006a7986d3");

/// Service id under which a Linux guest sees vsock port `port`.
#[must_use]
pub fn service_id_from_vsock_port(port: u32) -> Uuid {
    let (_, d2, d3, d4) = HV_GUID_VSOCK_TEMPLATE.as_fields();
    Uuid::from_fields(port, d2, d3, d4)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointAddress {
    vm_id: Uuid,
    service_id: Uuid,
}

impl EndpointAddress {
    #[must_use]
    pub const fn new(vm_id: Uuid, service_id: Uuid) -> Self {
        Self { vm_id, service_id }
    }

    /// Guest to host: the parent partition's `service_id`.
    #[must_use]
    pub const fn parent(service_id: Uuid) -> Self {
        Self::new(HV_GUID_PARENT, service_id)
    }

    /// Listen address accepting `service_id` connections from every partition.
    #[must_use]
    pub const fn wildcard(service_id: Uuid) -> Self {
        Self::new(HV_GUID_WILDCARD, service_id)
    }

    #[must_use]
    pub const fn vm_id(&self) -> Uuid {
        self.vm_id
    }

    #[must_use]
    pub const fn service_id(&self) -> Uuid {
        self.service_id
    }

    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.vm_id == HV_GUID_WILDCARD
    }

    /// Vsock port when the service id follows the Linux guest template.
    #[must_use]
    pub fn vsock_port(&self) -> Option<u32> {
        let (port, d2, d3, d4) = self.service_id.as_fields();
        let (_, t2, t3, t4) = HV_GUID_VSOCK_TEMPLATE.as_fields();
        (d2 == t2 && d3 == t3 && d4 == t4).then_some(port)
    }

    /// Decode a raw `SOCKADDR_HV` buffer.
    ///
    /// # Errors
    /// `InvalidAddress` if the buffer is not 36 bytes long or its family is not `AF_HYPERV`.
    pub fn parse(raw: &[u8]) -> Result<Self, Error> {
        if raw.len() != HYPERV_SOCK_ADDR_SIZE {
            return Err(Error::InvalidAddress(format!(
                "expected {HYPERV_SOCK_ADDR_SIZE} bytes, got {}",
                raw.len()
            )));
        }
        let family = u16::from_ne_bytes([raw[0], raw[1]]);
        if family != AF_HYPERV {
            return Err(Error::InvalidAddress(format!(
                "address family {family} is not AF_HYPERV"
            )));
        }
        Ok(Self {
            vm_id: guid_from_slice(&raw[VM_ID_OFFSET..SERVICE_ID_OFFSET]),
            service_id: guid_from_slice(&raw[SERVICE_ID_OFFSET..HYPERV_SOCK_ADDR_SIZE]),
        })
    }

    #[must_use]
    pub fn serialize(&self) -> [u8; HYPERV_SOCK_ADDR_SIZE] {
        let mut raw = [0u8; HYPERV_SOCK_ADDR_SIZE];
        raw[..2].copy_from_slice(&AF_HYPERV.to_ne_bytes());
        raw[VM_ID_OFFSET..SERVICE_ID_OFFSET].copy_from_slice(&self.vm_id.to_bytes_le());
        raw[SERVICE_ID_OFFSET..].copy_from_slice(&self.service_id.to_bytes_le());
        raw
    }

    /// Decode an address reported by the OS (`accept`, `getsockname`, `getpeername`).
    ///
    /// # Errors
    /// `InvalidAddress` if `addr` is not a Hyper-V socket address.
    pub fn from_sock_addr(addr: &SockAddr) -> Result<Self, Error> {
        let len = usize::try_from(addr.len()).map_err(|_| {
            Error::InvalidAddress(format!("invalid address length {}", addr.len()))
        })?;
        // SAFETY: `as_ptr` points at the socket address storage, which holds at least
        // `len` initialised bytes.
        let raw = unsafe { std::slice::from_raw_parts(addr.as_ptr().cast::<u8>(), len) };
        Self::parse(raw)
    }

    /// Address to hand to `bind`/`connect`.
    #[must_use]
    pub fn to_sock_addr(&self) -> SockAddr {
        let raw = self.serialize();
        // SAFETY: the storage is large enough for any socket address and we write exactly
        // `HYPERV_SOCK_ADDR_SIZE` bytes into it, which is also the reported length.
        let ((), addr) = unsafe {
            SockAddr::try_init(|storage, len| {
                std::ptr::copy_nonoverlapping(
                    raw.as_ptr(),
                    storage.cast::<u8>(),
                    HYPERV_SOCK_ADDR_SIZE,
                );
                *len = HYPERV_SOCK_ADDR_SIZE as _;
                Ok(())
            })
        }
        .unwrap_or_else(|_| unreachable!("initialiser never fails"));
        addr
    }
}

fn guid_from_slice(raw: &[u8]) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(raw);
    Uuid::from_bytes_le(bytes)
}

/// `{vm_id}.{service_id}` as 32 lowercase hex digits each. Used as a placeholder
/// authority in URIs, never resolved.
impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.vm_id.simple(), self.service_id.simple())
    }
}

/// A vm id in any UUID text form, or one of the well-known names (`parent`, `wildcard`...).
///
/// # Errors
/// `InvalidAddress` for anything else.
pub fn parse_vm_id(vm: &str) -> Result<Uuid, Error> {
    let vm_id = match vm {
        "parent" | "host" => HV_GUID_PARENT,
        "wildcard" | "*" => HV_GUID_WILDCARD,
        "children" => HV_GUID_CHILDREN,
        "loopback" | "local" => HV_GUID_LOOPBACK,
        "silohost" => HV_GUID_SILOHOST,
        "broadcast" => HV_GUID_BROADCAST,
        id => Uuid::parse_str(id)
            .map_err(|e| Error::InvalidAddress(format!("bad vm id {id}: {e}")))?,
    };
    Ok(vm_id)
}

impl FromStr for EndpointAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((vm, service)) = s.split_once('.') else {
            return Err(Error::InvalidAddress(format!(
                "{s} should be in VMID.SERVICEID format"
            )));
        };
        let service_id = Uuid::parse_str(service)
            .map_err(|e| Error::InvalidAddress(format!("bad service id {service}: {e}")))?;
        Ok(Self::new(parse_vm_id(vm)?, service_id))
    }
}
