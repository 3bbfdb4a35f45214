//! # wgdock-net
//!
//! The network engine of the wgdock plugin.
//!
//! In response to driver-protocol calls this crate builds and tears down
//! the kernel topology that attaches containers to a WireGuard tunnel:
//! a dedicated network namespace per docker network, a bridge and
//! WireGuard interface inside it, a `/31` veth link to the host, and the
//! host-side NAT rules.

#![warn(missing_docs)]

pub mod driver;
pub mod endpoint;
pub mod ipam;
pub mod iptables;
pub mod netlink;
pub mod netns;
pub mod network;
pub mod rollback;
pub mod wgconf;

pub use driver::Driver;
pub use endpoint::Endpoint;
pub use ipam::IpAllocator;
pub use iptables::IptablesManager;
pub use netns::NetnsHandle;
pub use network::{Network, NetworkOptions, LINK_PREFIX};
pub use wgconf::WgConfig;
