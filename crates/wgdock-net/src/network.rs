//! Per-network lifecycle: namespace, outbound veth, WireGuard, bridge, NAT.
//!
//! A `Network` owns every kernel object created for one docker network and
//! tears it down post-order. Creation is a fixed sequence of reversible
//! steps; the completed prefix unwinds on failure when the `cleanup`
//! option is set.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use ipnetwork::Ipv4Network;
use wgdock_common::{WgdockError, WgdockResult};

use crate::driver::{EndpointInterface, InterfaceName, JoinResponse};
use crate::endpoint::Endpoint;
use crate::ipam::IpAllocator;
use crate::iptables::IptablesManager;
use crate::netlink::{self, NlChannel};
use crate::netns::{self, NetnsHandle};
use crate::rollback::RollbackStack;
use crate::wgconf::WgConfig;

/// Prefix of every root-namespace link this plugin creates; the runtime
/// also renames the container-side interface with it.
pub const LINK_PREFIX: &str = "wgdocknet";

/// Bridge inside each network's namespace.
const BRIDGE_NAME: &str = "br0";

/// In-namespace end of the outbound veth.
const OUTBOUND_PEER: &str = "veth0";

/// Container-side veths get the next free `veth*` name.
const VETH_PREFIX: &str = "veth";

/// Options recognized on `docker network create -o`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkOptions {
    /// Host address remote WireGuard peers reach.
    pub endpoint: Ipv4Addr,
    /// Path to the WireGuard config file.
    pub wgconf: PathBuf,
    /// Optional name to bind-mount the namespace under.
    pub namespace: Option<String>,
    /// Roll back partial state when creation fails. Default true.
    pub cleanup: bool,
}

impl NetworkOptions {
    /// Extract and validate options from the runtime's generic map.
    pub fn from_map(options: &HashMap<String, String>) -> WgdockResult<Self> {
        let endpoint = options
            .get("endpoint")
            .ok_or_else(|| missing_option("endpoint"))?;
        let endpoint: Ipv4Addr = endpoint.parse().map_err(|_| WgdockError::BadOption {
            name: "endpoint".into(),
            reason: format!("invalid IPv4 address: {endpoint}"),
        })?;

        let wgconf = options
            .get("wgconf")
            .ok_or_else(|| missing_option("wgconf"))?;

        let cleanup = match options.get("cleanup") {
            None => true,
            Some(value) => value.parse().map_err(|_| WgdockError::BadOption {
                name: "cleanup".into(),
                reason: format!("expected true or false, got {value}"),
            })?,
        };

        Ok(Self {
            endpoint,
            wgconf: PathBuf::from(wgconf),
            namespace: options.get("namespace").cloned(),
            cleanup,
        })
    }
}

fn missing_option(name: &str) -> WgdockError {
    WgdockError::BadOption {
        name: name.into(),
        reason: "missing".into(),
    }
}

/// One managed docker network.
pub struct Network {
    ns: Arc<NetnsHandle>,
    ns_name: Option<String>,
    root_ns: Arc<NetnsHandle>,
    nl: NlChannel,
    root_nl: NlChannel,
    wg_conf: WgConfig,
    bridge_index: u32,
    bridge_addr: Ipv4Network,
    allocator: IpAllocator,
    wg_peer_endpoint: Ipv4Addr,
    outbound_addr: Ipv4Addr,
    outbound_link: String,
    iptables: Arc<IptablesManager>,
    endpoints: HashMap<String, Endpoint>,
    joined_interfaces: HashMap<String, String>,
}

impl Network {
    /// Build the full topology for a new network.
    ///
    /// On failure every completed step is undone in reverse order, unless
    /// the `cleanup` option was set to false.
    pub async fn create(
        pool: Ipv4Network,
        options: NetworkOptions,
        root_ns: Arc<NetnsHandle>,
        iptables: Arc<IptablesManager>,
    ) -> WgdockResult<Self> {
        let root_nl = NlChannel::open(&root_ns).await?;

        let mut stack = RollbackStack::new();
        let built = Self::build(
            pool,
            &options,
            Arc::clone(&root_ns),
            iptables,
            root_nl.clone(),
            &mut stack,
        )
        .await;

        match built {
            Ok(network) => {
                stack.disarm();
                Ok(network)
            }
            Err(e) => {
                if options.cleanup {
                    stack.unwind().await;
                } else {
                    tracing::warn!("Leaving partial state in place (cleanup=false)");
                    stack.disarm();
                }
                root_nl.close();
                Err(e)
            }
        }
    }

    /// The ordered creation steps. Each pushes its inverse once complete.
    async fn build(
        pool: Ipv4Network,
        options: &NetworkOptions,
        root_ns: Arc<NetnsHandle>,
        iptables: Arc<IptablesManager>,
        root_nl: NlChannel,
        stack: &mut RollbackStack,
    ) -> WgdockResult<Self> {
        let wg_conf = WgConfig::parse(&options.wgconf)?;
        tracing::debug!(config = ?wg_conf, path = %options.wgconf.display(), "Loaded wireguard config");

        let ns = Arc::new(NetnsHandle::create(options.namespace.as_deref())?);
        {
            let name = options.namespace.clone();
            stack.push("delete namespace", move || async move {
                if let Some(name) = name {
                    netns::delete_named(&name)?;
                }
                // An anonymous namespace dies with its last handle.
                Ok(())
            });
        }

        let nl = NlChannel::open(&ns).await?;
        {
            let nl = nl.clone();
            stack.push("close namespace channel", move || async move {
                nl.close();
                Ok(())
            });
        }

        let (outbound_addr, outbound_link) =
            Self::create_outbound_link(&root_ns, &nl, &root_nl).await?;
        {
            let root_nl = root_nl.clone();
            let name = outbound_link.clone();
            stack.push("delete outbound link", move || async move {
                let index = root_nl.link_index(&name).await?;
                root_nl.del_link(index).await
            });
        }

        // The wireguard link lives inside the namespace and is destroyed
        // with it; no separate undo step.
        wg_conf.start_interface(&ns, &nl).await?;

        let mut allocator = IpAllocator::new(pool);
        allocator.mark_used(wg_conf.address.ip());
        tracing::debug!(address = %wg_conf.address.ip(), "Marked wireguard link address used");

        let bridge_addr = allocator.find_address()?;
        let bridge_index = nl.create_bridge(BRIDGE_NAME, bridge_addr).await?;
        tracing::debug!(%bridge_addr, "Created bridge");

        iptables.setup_forwarding(outbound_addr, options.endpoint, wg_conf.listen_port)?;
        {
            let iptables = Arc::clone(&iptables);
            let endpoint = options.endpoint;
            let port = wg_conf.listen_port;
            stack.push("remove forwarding rules", move || async move {
                iptables.remove_forwarding(outbound_addr, endpoint, port)
            });
        }

        Ok(Self {
            ns,
            ns_name: options.namespace.clone(),
            root_ns,
            nl,
            root_nl,
            wg_conf,
            bridge_index,
            bridge_addr,
            allocator,
            wg_peer_endpoint: options.endpoint,
            outbound_addr,
            outbound_link,
            iptables,
            endpoints: HashMap::new(),
            joined_interfaces: HashMap::new(),
        })
    }

    /// Connect the namespace to the root namespace with a `/31` veth pair
    /// and default-route everything over it.
    ///
    /// Returns the in-namespace address (the DNAT target) and the
    /// root-side link name.
    async fn create_outbound_link(
        root_ns: &NetnsHandle,
        nl: &NlChannel,
        root_nl: &NlChannel,
    ) -> WgdockResult<(Ipv4Addr, String)> {
        let names = root_nl.link_names().await?;
        let public_name = netlink::pick_unused_name(LINK_PREFIX, &names);

        let attached = root_nl.attached_networks().await?;
        let (outer_ip, inner_ip) = netlink::pick_unused_pair(&attached)?;

        nl.create_veth(&public_name, OUTBOUND_PEER, root_ns).await?;

        let outer_index = root_nl.link_index(&public_name).await?;
        root_nl.add_address(outer_index, p2p(outer_ip)).await?;
        root_nl.set_up(outer_index).await?;

        let inner_index = nl.link_index(OUTBOUND_PEER).await?;
        nl.add_address(inner_index, p2p(inner_ip)).await?;
        nl.set_up(inner_index).await?;
        nl.add_default_route(inner_index, outer_ip, inner_ip).await?;

        tracing::debug!(
            link = %public_name,
            outer = %outer_ip,
            inner = %inner_ip,
            "Created outbound link"
        );
        Ok((inner_ip, public_name))
    }

    /// Tear down every kernel object this network owns.
    ///
    /// Post-order on the ownership tree; all steps are attempted and
    /// errors aggregated.
    pub async fn delete(self) -> WgdockResult<()> {
        let mut errors = Vec::new();

        self.nl.close();

        if let Some(name) = &self.ns_name {
            if let Err(e) = netns::delete_named(name) {
                errors.push(e);
            }
        }

        match self.root_nl.link_index(&self.outbound_link).await {
            Ok(index) => {
                if let Err(e) = self.root_nl.del_link(index).await {
                    errors.push(e);
                }
            }
            Err(_) => {
                tracing::debug!(link = %self.outbound_link, "Outbound link already gone");
            }
        }

        self.root_nl.close();

        if let Err(e) = self.iptables.remove_forwarding(
            self.outbound_addr,
            self.wg_peer_endpoint,
            self.wg_conf.listen_port,
        ) {
            errors.push(e);
        }

        // The last handle on the namespace goes away here; the kernel
        // destroys it together with the wireguard link and bridge inside.
        drop(self.ns);

        WgdockError::aggregate(errors)
    }

    /// Register a new endpoint.
    pub fn create_endpoint(
        &mut self,
        id: &str,
        intf: &EndpointInterface,
    ) -> WgdockResult<EndpointInterface> {
        if self.endpoints.contains_key(id) {
            return Err(WgdockError::DuplicateEndpoint { id: id.to_string() });
        }

        let endpoint = Endpoint::build(intf, &mut self.allocator)?;
        let response = endpoint.interface_response();
        self.endpoints.insert(id.to_string(), endpoint);

        tracing::debug!(id, address = %response.address, mac = %response.mac_address, "Created endpoint");
        Ok(response)
    }

    /// Remove an endpoint and return its address to the allocator.
    pub fn delete_endpoint(&mut self, id: &str) -> WgdockResult<()> {
        let endpoint = self
            .endpoints
            .remove(id)
            .ok_or_else(|| unknown_endpoint(id))?;
        self.allocator.mark_unused(endpoint.addr.ip());
        Ok(())
    }

    /// Create the container-facing veth for a joining endpoint.
    ///
    /// The root-side end is handed to the runtime to move into the
    /// container; the in-namespace end is attached to the bridge.
    pub async fn join(&mut self, endpoint_id: &str) -> WgdockResult<JoinResponse> {
        if !self.endpoints.contains_key(endpoint_id) {
            return Err(unknown_endpoint(endpoint_id));
        }

        let root_names = self.root_nl.link_names().await?;
        let public_name = netlink::pick_unused_name(LINK_PREFIX, &root_names);
        let ns_names = self.nl.link_names().await?;
        let inner_name = netlink::pick_unused_name(VETH_PREFIX, &ns_names);

        self.nl
            .create_veth(&public_name, &inner_name, &self.root_ns)
            .await?;

        let public_index = self.root_nl.link_index(&public_name).await?;
        self.root_nl.set_up(public_index).await?;

        let inner_index = self.nl.link_index(&inner_name).await?;
        self.nl.set_master(inner_index, self.bridge_index).await?;
        self.nl.set_up(inner_index).await?;

        self.joined_interfaces
            .insert(endpoint_id.to_string(), inner_name);

        let response = JoinResponse {
            interface_name: InterfaceName {
                src_name: public_name,
                dst_prefix: LINK_PREFIX.to_string(),
            },
            static_routes: self.wg_conf.get_routes(self.bridge_addr.ip()),
            ..JoinResponse::default()
        };
        tracing::debug!(endpoint_id, response = ?response, "Responding to join request");
        Ok(response)
    }

    /// Delete the veth created on join.
    ///
    /// Removing the in-namespace end also destroys the container-side
    /// peer. The endpoint record stays until DeleteEndpoint.
    pub async fn leave(&mut self, endpoint_id: &str) -> WgdockResult<()> {
        let inner_name = self
            .joined_interfaces
            .get(endpoint_id)
            .cloned()
            .ok_or_else(|| unknown_endpoint(endpoint_id))?;

        let index = self.nl.link_index(&inner_name).await?;
        self.nl.del_link(index).await?;

        self.joined_interfaces.remove(endpoint_id);
        Ok(())
    }
}

fn p2p(ip: Ipv4Addr) -> Ipv4Network {
    Ipv4Network::new(ip, 31).expect("31 is a valid IPv4 prefix")
}

fn unknown_endpoint(id: &str) -> WgdockError {
    WgdockError::UnknownEndpoint { id: id.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_minimal_options() {
        let map = opts(&[("endpoint", "203.0.113.5"), ("wgconf", "/etc/wg/peer.conf")]);
        let options = NetworkOptions::from_map(&map).unwrap();
        assert_eq!(options.endpoint, Ipv4Addr::new(203, 0, 113, 5));
        assert_eq!(options.wgconf, PathBuf::from("/etc/wg/peer.conf"));
        assert_eq!(options.namespace, None);
        assert!(options.cleanup);
    }

    #[test]
    fn missing_endpoint_is_rejected() {
        let map = opts(&[("wgconf", "/etc/wg/peer.conf")]);
        match NetworkOptions::from_map(&map) {
            Err(WgdockError::BadOption { name, reason }) => {
                assert_eq!(name, "endpoint");
                assert_eq!(reason, "missing");
            }
            other => panic!("expected BadOption, got {other:?}"),
        }
    }

    #[test]
    fn missing_wgconf_is_rejected() {
        let map = opts(&[("endpoint", "203.0.113.5")]);
        assert!(matches!(
            NetworkOptions::from_map(&map),
            Err(WgdockError::BadOption { name, .. }) if name == "wgconf"
        ));
    }

    #[test]
    fn invalid_endpoint_address_is_rejected() {
        let map = opts(&[("endpoint", "not-an-ip"), ("wgconf", "/x")]);
        assert!(matches!(
            NetworkOptions::from_map(&map),
            Err(WgdockError::BadOption { name, .. }) if name == "endpoint"
        ));
    }

    #[test]
    fn cleanup_and_namespace_options() {
        let map = opts(&[
            ("endpoint", "203.0.113.5"),
            ("wgconf", "/x"),
            ("namespace", "vpn0"),
            ("cleanup", "false"),
        ]);
        let options = NetworkOptions::from_map(&map).unwrap();
        assert_eq!(options.namespace.as_deref(), Some("vpn0"));
        assert!(!options.cleanup);

        let map = opts(&[("endpoint", "203.0.113.5"), ("wgconf", "/x"), ("cleanup", "yes")]);
        assert!(matches!(
            NetworkOptions::from_map(&map),
            Err(WgdockError::BadOption { name, .. }) if name == "cleanup"
        ));
    }
}
