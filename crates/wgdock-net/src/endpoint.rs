//! Per-endpoint address and MAC assignment.

use std::str::FromStr;

use ipnetwork::Ipv4Network;
use rand::RngCore;
use wgdock_common::{WgdockError, WgdockResult};

use crate::driver::EndpointInterface;
use crate::ipam::IpAllocator;

/// One container endpoint on a network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// The endpoint's address within the network pool.
    pub addr: Ipv4Network,
    /// The endpoint's MAC address.
    pub mac: [u8; 6],
}

impl Endpoint {
    /// Build an endpoint from the runtime's interface record.
    ///
    /// A preassigned address is used as-is and marked used in the
    /// allocator; otherwise one is allocated. A preassigned MAC is parsed;
    /// otherwise six random bytes get the locally-administered/unicast
    /// bits forced.
    pub fn build(intf: &EndpointInterface, allocator: &mut IpAllocator) -> WgdockResult<Self> {
        let addr = if intf.address.is_empty() {
            allocator.find_address()?
        } else {
            let addr = Ipv4Network::from_str(&intf.address).map_err(|e| {
                WgdockError::BadOption {
                    name: "Address".into(),
                    reason: e.to_string(),
                }
            })?;
            allocator.mark_used(addr.ip());
            addr
        };

        let mac = if intf.mac_address.is_empty() {
            random_mac()
        } else {
            parse_mac(&intf.mac_address)?
        };

        Ok(Self { addr, mac })
    }

    /// The interface record echoed back to the runtime.
    ///
    /// The driver blanks any field that matches the runtime's own proposal
    /// before responding; this returns the full values.
    #[must_use]
    pub fn interface_response(&self) -> EndpointInterface {
        EndpointInterface {
            address: self.addr.to_string(),
            mac_address: format_mac(&self.mac),
            ..EndpointInterface::default()
        }
    }
}

fn random_mac() -> [u8; 6] {
    let mut mac = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut mac);
    mac[0] = (mac[0] & 0xfe) | 0x02;
    mac
}

/// Parse `aa:bb:cc:dd:ee:ff`.
fn parse_mac(text: &str) -> WgdockResult<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = text.split(':');
    for byte in &mut mac {
        let part = parts.next().ok_or_else(|| bad_mac(text))?;
        *byte = u8::from_str_radix(part, 16).map_err(|_| bad_mac(text))?;
    }
    if parts.next().is_some() {
        return Err(bad_mac(text));
    }
    Ok(mac)
}

fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn bad_mac(text: &str) -> WgdockError {
    WgdockError::BadOption {
        name: "MacAddress".into(),
        reason: format!("invalid MAC address: {text}"),
    }
}
