//! Driver-protocol entry point.
//!
//! The adapter decodes libnetwork's remote-driver JSON into the typed
//! records here and hands them to [`Driver`], which routes each call to
//! the right [`Network`]. The driver owns the root-namespace handle and
//! the host's iptables footprint.

use std::collections::HashMap;
use std::sync::Arc;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use wgdock_common::{WgdockError, WgdockResult};

use crate::iptables::IptablesManager;
use crate::netns::NetnsHandle;
use crate::network::{Network, NetworkOptions};

/// Key under which the runtime nests the user's `-o` options.
pub const GENERIC_OPTIONS_KEY: &str = "com.docker.network.generic";

/// An IPAM pool assigned to a network by the runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct IpamData {
    /// IPAM address space name.
    pub address_space: String,
    /// The pool CIDR.
    pub pool: String,
    /// Gateway chosen by IPAM, if any.
    pub gateway: String,
}

/// Interface record exchanged on endpoint creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct EndpointInterface {
    /// IPv4 address in CIDR form, empty when unset.
    pub address: String,
    /// IPv6 address, unused by this driver.
    #[serde(rename = "AddressIPv6")]
    pub address_ipv6: String,
    /// MAC address, empty when unset.
    pub mac_address: String,
}

/// CreateNetwork request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct CreateNetworkRequest {
    /// Opaque network id.
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    /// Nested options; user options live under [`GENERIC_OPTIONS_KEY`].
    pub options: HashMap<String, serde_json::Value>,
    /// IPv4 pools (at most one is supported).
    #[serde(rename = "IPv4Data")]
    pub ipv4_data: Vec<IpamData>,
    /// IPv6 pools (unsupported, must be empty).
    #[serde(rename = "IPv6Data")]
    pub ipv6_data: Vec<IpamData>,
}

/// DeleteNetwork request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct DeleteNetworkRequest {
    /// Opaque network id.
    #[serde(rename = "NetworkID")]
    pub network_id: String,
}

/// CreateEndpoint request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct CreateEndpointRequest {
    /// Opaque network id.
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    /// Opaque endpoint id.
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
    /// Values the runtime proposes for the endpoint.
    pub interface: EndpointInterface,
}

/// CreateEndpoint response.
///
/// Fields matching the runtime's proposal are returned empty, signaling
/// "accepted your choice".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct CreateEndpointResponse {
    /// Values this driver chose.
    pub interface: EndpointInterface,
}

/// DeleteEndpoint request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct DeleteEndpointRequest {
    /// Opaque network id.
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    /// Opaque endpoint id.
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
}

/// EndpointOperInfo request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct InfoRequest {
    /// Opaque network id.
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    /// Opaque endpoint id.
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
}

/// EndpointOperInfo response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct InfoResponse {
    /// Operational attributes; this driver exposes none.
    pub value: HashMap<String, String>,
}

/// Join request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct JoinRequest {
    /// Opaque network id.
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    /// Opaque endpoint id.
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
    /// Key of the container's sandbox.
    pub sandbox_key: String,
}

/// Name handed to the runtime for moving into the container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct InterfaceName {
    /// Current (root-namespace) name of the interface.
    pub src_name: String,
    /// Prefix the runtime renames it with inside the container.
    pub dst_prefix: String,
}

/// A route the runtime installs inside the container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct StaticRoute {
    /// Destination CIDR.
    pub destination: String,
    /// 0 = route via NextHop.
    pub route_type: u32,
    /// Gateway address.
    pub next_hop: String,
}

/// Join response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct JoinResponse {
    /// Interface the runtime moves into the container.
    pub interface_name: InterfaceName,
    /// IPv4 default gateway, unused by this driver.
    pub gateway: String,
    /// IPv6 default gateway, unused by this driver.
    #[serde(rename = "GatewayIPv6")]
    pub gateway_ipv6: String,
    /// Routes into the WireGuard namespace.
    pub static_routes: Vec<StaticRoute>,
}

/// Leave request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct LeaveRequest {
    /// Opaque network id.
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    /// Opaque endpoint id.
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
}

/// GetCapabilities response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CapabilitiesResponse {
    /// Network scope.
    pub scope: String,
    /// Connectivity scope.
    pub connectivity_scope: String,
}

/// The error for protocol operations this driver does not implement.
#[must_use]
pub fn not_supported(method: &str) -> WgdockError {
    WgdockError::Unsupported { op: method.into() }
}

/// Process-wide driver state: one entry object for every protocol call.
pub struct Driver {
    root_ns: Arc<NetnsHandle>,
    iptables: Arc<IptablesManager>,
    networks: HashMap<String, Network>,
}

impl Driver {
    /// Capture the host namespace and start the iptables manager.
    ///
    /// The root namespace is taken from pid 1 so the true host namespace
    /// is used even when the plugin itself runs in a container.
    pub fn new() -> WgdockResult<Self> {
        let root_ns = Arc::new(NetnsHandle::from_pid(1)?);
        tracing::info!(fd = root_ns.raw_fd(), "Got root namespace");

        let iptables = Arc::new(IptablesManager::new(Arc::clone(&root_ns))?);

        Ok(Self {
            root_ns,
            iptables,
            networks: HashMap::new(),
        })
    }

    /// Constant local/local capabilities.
    pub fn capabilities(&self) -> CapabilitiesResponse {
        tracing::debug!("[GetCapabilities] request");
        CapabilitiesResponse {
            scope: "local".into(),
            connectivity_scope: "local".into(),
        }
    }

    /// Create a network and its full kernel topology.
    pub async fn create_network(&mut self, req: CreateNetworkRequest) -> WgdockResult<()> {
        tracing::debug!(request = ?req, "[CreateNetwork] request");

        if req.ipv4_data.len() > 1 || !req.ipv6_data.is_empty() {
            return Err(WgdockError::BadOption {
                name: "pool".into(),
                reason: "multiple IPv4 pools or IPv6 pools are not supported".into(),
            });
        }
        let ipam = req.ipv4_data.first().ok_or_else(|| WgdockError::BadOption {
            name: "pool".into(),
            reason: "an IPv4 pool is required".into(),
        })?;
        let pool: Ipv4Network = ipam.pool.parse().map_err(|e| WgdockError::BadOption {
            name: "pool".into(),
            reason: format!("invalid pool {}: {e}", ipam.pool),
        })?;

        let options = NetworkOptions::from_map(&extract_generic_options(&req.options)?)?;

        let network = Network::create(
            pool,
            options,
            Arc::clone(&self.root_ns),
            Arc::clone(&self.iptables),
        )
        .await?;
        self.networks.insert(req.network_id, network);
        Ok(())
    }

    /// Tear a network down and forget it.
    pub async fn delete_network(&mut self, req: DeleteNetworkRequest) -> WgdockResult<()> {
        tracing::debug!(request = ?req, "[DeleteNetwork] request");

        let network = self
            .networks
            .remove(&req.network_id)
            .ok_or_else(|| unknown_network(&req.network_id))?;
        network.delete().await
    }

    /// Register an endpoint on a network.
    pub async fn create_endpoint(
        &mut self,
        req: CreateEndpointRequest,
    ) -> WgdockResult<CreateEndpointResponse> {
        tracing::debug!(request = ?req, "[CreateEndpoint] request");

        let network = self.network_mut(&req.network_id)?;
        let mut interface = network.create_endpoint(&req.endpoint_id, &req.interface)?;

        // Echo back empty any value the runtime proposed itself.
        if interface.address == req.interface.address {
            interface.address.clear();
        }
        if interface.mac_address == req.interface.mac_address {
            interface.mac_address.clear();
        }
        Ok(CreateEndpointResponse { interface })
    }

    /// Remove an endpoint from a network.
    pub async fn delete_endpoint(&mut self, req: DeleteEndpointRequest) -> WgdockResult<()> {
        tracing::debug!(request = ?req, "[DeleteEndpoint] request");
        self.network_mut(&req.network_id)?
            .delete_endpoint(&req.endpoint_id)
    }

    /// Operational info; this driver exposes no attributes.
    pub fn endpoint_info(&self, req: InfoRequest) -> InfoResponse {
        tracing::debug!(request = ?req, "[EndpointOperInfo] request");
        InfoResponse::default()
    }

    /// Connect an endpoint's container to the network.
    pub async fn join(&mut self, req: JoinRequest) -> WgdockResult<JoinResponse> {
        tracing::debug!(request = ?req, "[Join] request");
        self.network_mut(&req.network_id)?
            .join(&req.endpoint_id)
            .await
    }

    /// Disconnect an endpoint's container.
    pub async fn leave(&mut self, req: LeaveRequest) -> WgdockResult<()> {
        tracing::debug!(request = ?req, "[Leave] request");
        self.network_mut(&req.network_id)?
            .leave(&req.endpoint_id)
            .await
    }

    /// Tear down every remaining network, then the iptables footprint.
    ///
    /// All steps are attempted; errors are aggregated.
    pub async fn delete(&mut self) -> WgdockResult<()> {
        let mut errors = Vec::new();
        for (id, network) in self.networks.drain() {
            tracing::info!(id = %id, "Deleting network on shutdown");
            if let Err(e) = network.delete().await {
                errors.push(e);
            }
        }
        if let Err(e) = self.iptables.delete() {
            errors.push(e);
        }
        WgdockError::aggregate(errors)
    }

    fn network_mut(&mut self, id: &str) -> WgdockResult<&mut Network> {
        self.networks
            .get_mut(id)
            .ok_or_else(|| unknown_network(id))
    }
}

fn unknown_network(id: &str) -> WgdockError {
    WgdockError::UnknownNetwork { id: id.to_string() }
}

/// Pull the user's string options out of the nested generic map.
///
/// A missing generic key means no options were passed; validation of the
/// required ones happens in [`NetworkOptions::from_map`].
fn extract_generic_options(
    options: &HashMap<String, serde_json::Value>,
) -> WgdockResult<HashMap<String, String>> {
    let Some(generic) = options.get(GENERIC_OPTIONS_KEY) else {
        return Ok(HashMap::new());
    };
    let object = generic.as_object().ok_or_else(|| WgdockError::BadOption {
        name: GENERIC_OPTIONS_KEY.into(),
        reason: "expected an object".into(),
    })?;

    let mut map = HashMap::new();
    for (key, value) in object {
        let value = value.as_str().ok_or_else(|| WgdockError::BadOption {
            name: key.clone(),
            reason: "expected a string value".into(),
        })?;
        map.insert(key.clone(), value.to_string());
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn generic_options_extraction() {
        let options: HashMap<String, serde_json::Value> = [(
            GENERIC_OPTIONS_KEY.to_string(),
            json!({"endpoint": "203.0.113.5", "wgconf": "/etc/wg/peer.conf"}),
        )]
        .into();

        let map = extract_generic_options(&options).unwrap();
        assert_eq!(map["endpoint"], "203.0.113.5");
        assert_eq!(map["wgconf"], "/etc/wg/peer.conf");
    }

    #[test]
    fn missing_generic_key_yields_empty_map() {
        let map = extract_generic_options(&HashMap::new()).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn non_string_option_value_is_rejected() {
        let options: HashMap<String, serde_json::Value> = [(
            GENERIC_OPTIONS_KEY.to_string(),
            json!({"cleanup": true}),
        )]
        .into();

        assert!(matches!(
            extract_generic_options(&options),
            Err(WgdockError::BadOption { name, .. }) if name == "cleanup"
        ));
    }

    #[test]
    fn request_wire_shapes() {
        let req: CreateNetworkRequest = serde_json::from_value(json!({
            "NetworkID": "net1",
            "Options": {
                "com.docker.network.generic": {"endpoint": "203.0.113.5"}
            },
            "IPv4Data": [{"AddressSpace": "default", "Pool": "10.20.0.0/24", "Gateway": ""}],
            "IPv6Data": []
        }))
        .unwrap();
        assert_eq!(req.network_id, "net1");
        assert_eq!(req.ipv4_data[0].pool, "10.20.0.0/24");

        let req: CreateEndpointRequest = serde_json::from_value(json!({
            "NetworkID": "net1",
            "EndpointID": "e2",
            "Interface": {"Address": "10.20.0.50/24", "AddressIPv6": "", "MacAddress": ""}
        }))
        .unwrap();
        assert_eq!(req.interface.address, "10.20.0.50/24");
    }

    #[test]
    fn join_response_wire_shape() {
        let response = JoinResponse {
            interface_name: InterfaceName {
                src_name: "wgdocknet1".into(),
                dst_prefix: "wgdocknet".into(),
            },
            static_routes: vec![StaticRoute {
                destination: "10.99.0.0/24".into(),
                route_type: 0,
                next_hop: "10.20.0.2".into(),
            }],
            ..JoinResponse::default()
        };

        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["InterfaceName"]["SrcName"], "wgdocknet1");
        assert_eq!(value["InterfaceName"]["DstPrefix"], "wgdocknet");
        assert_eq!(value["StaticRoutes"][0]["Destination"], "10.99.0.0/24");
        assert_eq!(value["StaticRoutes"][0]["RouteType"], 0);
        assert_eq!(value["StaticRoutes"][0]["NextHop"], "10.20.0.2");
    }

    #[test]
    fn unsupported_operation_message() {
        assert_eq!(
            not_supported("AllocateNetwork").to_string(),
            "[AllocateNetwork] not supported"
        );
    }
}
