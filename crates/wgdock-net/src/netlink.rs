//! Thin netlink wrappers, parameterized by a namespace-scoped channel.
//!
//! A channel's socket is opened on a worker thread pinned inside the target
//! namespace, then driven by the shared runtime. Every request made through
//! the channel is therefore scoped to that namespace, no matter which
//! thread polls it.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use futures_util::TryStreamExt;
use ipnetwork::Ipv4Network;
use netlink_packet_route::address::AddressAttribute;
use netlink_packet_route::link::LinkAttribute;
use rtnetlink::{new_connection, Handle, LinkBridge, LinkUnspec, LinkVeth, RouteMessageBuilder};
use tokio::task::JoinHandle;
use wgdock_common::{WgdockError, WgdockResult};

use crate::netns::NetnsHandle;

/// Outbound veth pairs draw their `/31` endpoints from this range.
pub const OUTBOUND_RANGE: (u8, u8) = (172, 31);

/// A netlink channel bound to one network namespace.
///
/// Cloning is cheap; all clones share the underlying socket. [`close`]
/// stops the connection task for every clone.
///
/// [`close`]: NlChannel::close
#[derive(Clone)]
pub struct NlChannel {
    handle: Handle,
    task: Arc<JoinHandle<()>>,
}

impl NlChannel {
    /// Open a channel whose socket lives inside `ns`.
    pub async fn open(ns: &NetnsHandle) -> WgdockResult<Self> {
        let rt = tokio::runtime::Handle::current();
        let (connection, handle) = ns.run_in(move || {
            // The socket must be created inside the namespace; the reactor
            // registration needs the runtime context carried over.
            let _guard = rt.enter();
            let (connection, handle, _) = new_connection()?;
            Ok((connection, handle))
        })?;
        let task = tokio::spawn(connection);
        Ok(Self {
            handle,
            task: Arc::new(task),
        })
    }

    /// Stop the connection task. Pending requests on clones will fail.
    pub fn close(&self) {
        self.task.abort();
    }

    /// Names of every link in the namespace.
    pub async fn link_names(&self) -> WgdockResult<Vec<String>> {
        let mut links = self.handle.link().get().execute();
        let mut names = Vec::new();
        while let Some(msg) = links.try_next().await.map_err(nl_err("list links"))? {
            for attr in &msg.attributes {
                if let LinkAttribute::IfName(name) = attr {
                    names.push(name.clone());
                }
            }
        }
        Ok(names)
    }

    /// Interface index of the link called `name`.
    pub async fn link_index(&self, name: &str) -> WgdockResult<u32> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        let msg = links
            .try_next()
            .await
            .map_err(nl_err(format!("get link {name}")))?
            .ok_or_else(|| WgdockError::NetlinkError {
                op: format!("get link {name}"),
                cause: "link not found".into(),
            })?;
        Ok(msg.header.index)
    }

    /// Every IPv4 network attached to any link in the namespace.
    pub async fn attached_networks(&self) -> WgdockResult<Vec<Ipv4Network>> {
        let mut addrs = self.handle.address().get().execute();
        let mut nets = Vec::new();
        while let Some(msg) = addrs.try_next().await.map_err(nl_err("list addresses"))? {
            let prefix = msg.header.prefix_len;
            for attr in &msg.attributes {
                if let AddressAttribute::Address(IpAddr::V4(ip)) = attr {
                    if let Ok(net) = Ipv4Network::new(*ip, prefix) {
                        nets.push(net);
                    }
                }
            }
        }
        Ok(nets)
    }

    /// Create a veth pair.
    ///
    /// `name` ends up in `move_to`; `peer` stays in this channel's
    /// namespace.
    pub async fn create_veth(
        &self,
        name: &str,
        peer: &str,
        move_to: &NetnsHandle,
    ) -> WgdockResult<()> {
        let msg = LinkVeth::new(name, peer)
            .setns_by_fd(move_to.raw_fd())
            .build();
        self.handle
            .link()
            .add(msg)
            .execute()
            .await
            .map_err(nl_err(format!("create veth {name}/{peer}")))
    }

    /// Create a bridge carrying `addr` and bring it up.
    pub async fn create_bridge(&self, name: &str, addr: Ipv4Network) -> WgdockResult<u32> {
        self.handle
            .link()
            .add(LinkBridge::new(name).build())
            .execute()
            .await
            .map_err(nl_err(format!("create bridge {name}")))?;
        let index = self.link_index(name).await?;
        self.add_address(index, addr).await?;
        self.set_up(index).await?;
        Ok(index)
    }

    /// Attach an IPv4 address to a link.
    pub async fn add_address(&self, index: u32, addr: Ipv4Network) -> WgdockResult<()> {
        self.handle
            .address()
            .add(index, IpAddr::V4(addr.ip()), addr.prefix())
            .execute()
            .await
            .map_err(nl_err(format!("add address {addr}")))
    }

    /// Install a default route via `gateway` out of link `index`.
    pub async fn add_default_route(
        &self,
        index: u32,
        gateway: Ipv4Addr,
        source: Ipv4Addr,
    ) -> WgdockResult<()> {
        let route = RouteMessageBuilder::<Ipv4Addr>::new()
            .output_interface(index)
            .gateway(gateway)
            .pref_source(source)
            .build();
        self.handle
            .route()
            .add(route)
            .execute()
            .await
            .map_err(nl_err(format!("add default route via {gateway}")))
    }

    /// Enslave link `index` to bridge `master`.
    pub async fn set_master(&self, index: u32, master: u32) -> WgdockResult<()> {
        self.handle
            .link()
            .set(LinkUnspec::new_with_index(index).controller(master).build())
            .execute()
            .await
            .map_err(nl_err(format!("set master of link {index}")))
    }

    /// Set link `index` administratively up.
    pub async fn set_up(&self, index: u32) -> WgdockResult<()> {
        self.handle
            .link()
            .set(LinkUnspec::new_with_index(index).up().build())
            .execute()
            .await
            .map_err(nl_err(format!("set link {index} up")))
    }

    /// Delete link `index`.
    pub async fn del_link(&self, index: u32) -> WgdockResult<()> {
        self.handle
            .link()
            .del(index)
            .execute()
            .await
            .map_err(nl_err(format!("delete link {index}")))
    }
}

/// Smallest `prefix+i` absent from `existing`.
///
/// Stable in the face of deletions. Not unique across concurrent callers;
/// the owning network holds its lock across pick-then-create.
#[must_use]
pub fn pick_unused_name(prefix: &str, existing: &[String]) -> String {
    let taken: HashSet<&str> = existing.iter().map(String::as_str).collect();
    let mut i = 0usize;
    loop {
        let name = format!("{prefix}{i}");
        if !taken.contains(name.as_str()) {
            return name;
        }
        i += 1;
    }
}

/// Smallest even-aligned `/31` pair in 172.31.0.0/16 with neither address
/// contained in any attached network.
pub fn pick_unused_pair(existing: &[Ipv4Network]) -> WgdockResult<(Ipv4Addr, Ipv4Addr)> {
    let (a, b) = OUTBOUND_RANGE;
    for i in (0..65536u32).step_by(2) {
        let first = Ipv4Addr::new(a, b, (i / 256) as u8, (i % 256) as u8);
        let second = Ipv4Addr::new(a, b, (i / 256) as u8, (i % 256) as u8 + 1);
        if is_unused(first, existing) && is_unused(second, existing) {
            return Ok((first, second));
        }
    }
    Err(WgdockError::NoFreeAddress)
}

fn is_unused(addr: Ipv4Addr, nets: &[Ipv4Network]) -> bool {
    nets.iter().all(|net| !net.contains(addr))
}

fn nl_err(op: impl Into<String>) -> impl FnOnce(rtnetlink::Error) -> WgdockError {
    let op = op.into();
    move |e| WgdockError::NetlinkError {
        op,
        cause: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_smallest_free_suffix() {
        assert_eq!(pick_unused_name("wgdocknet", &[]), "wgdocknet0");

        let existing = vec![
            "wgdocknet0".to_string(),
            "wgdocknet1".to_string(),
            "eth0".to_string(),
        ];
        assert_eq!(pick_unused_name("wgdocknet", &existing), "wgdocknet2");
    }

    #[test]
    fn name_picking_is_stable_after_deletions() {
        // A hole left by a deletion is reused first.
        let existing = vec!["veth0".to_string(), "veth2".to_string()];
        assert_eq!(pick_unused_name("veth", &existing), "veth1");
    }

    #[test]
    fn first_pair_on_empty_host() {
        let (a, b) = pick_unused_pair(&[]).unwrap();
        assert_eq!(a, Ipv4Addr::new(172, 31, 0, 0));
        assert_eq!(b, Ipv4Addr::new(172, 31, 0, 1));
    }

    #[test]
    fn pair_avoids_attached_networks() {
        let existing = vec!["172.31.0.0/24".parse().unwrap()];
        let (a, b) = pick_unused_pair(&existing).unwrap();
        assert_eq!(a, Ipv4Addr::new(172, 31, 1, 0));
        assert_eq!(b, Ipv4Addr::new(172, 31, 1, 1));
    }

    #[test]
    fn pair_exhaustion() {
        let existing = vec!["172.31.0.0/16".parse().unwrap()];
        assert!(matches!(
            pick_unused_pair(&existing),
            Err(WgdockError::NoFreeAddress)
        ));
    }

    #[test]
    fn pairs_stay_even_aligned() {
        // Blocking only the first address of a pair must skip the whole pair.
        let existing = vec!["172.31.0.0/32".parse().unwrap()];
        let (a, _) = pick_unused_pair(&existing).unwrap();
        assert_eq!(a, Ipv4Addr::new(172, 31, 0, 2));
    }
}
