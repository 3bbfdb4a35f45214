//! WireGuard configuration: file parsing and in-namespace device setup.
//!
//! The file format is the standard WireGuard `.conf` syntax: one
//! `[Interface]` section and one or more `[Peer]` sections. Parsing is
//! strict; unknown keys inside known sections are rejected so typos fail
//! loudly instead of silently dropping a peer.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::str::FromStr;

use ipnetwork::Ipv4Network;
use wgdock_common::{WgdockError, WgdockResult};

use crate::driver::StaticRoute;
use crate::netlink::{self, NlChannel};
use crate::netns::NetnsHandle;

/// In-namespace WireGuard links are named `wg0`, `wg1`, ...
const WG_LINK_PREFIX: &str = "wg";

/// Parsed `[Peer]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WgPeerConfig {
    /// Base64 public key of the remote peer.
    pub public_key: String,
    /// Where the peer is reached.
    pub endpoint: SocketAddr,
    /// CIDRs routed to this peer.
    pub allowed_ips: Vec<Ipv4Network>,
    /// Keepalive interval in seconds, if requested.
    pub persistent_keepalive: Option<u16>,
}

/// Parsed WireGuard configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WgConfig {
    /// Address of the local WireGuard interface.
    pub address: Ipv4Network,
    /// Base64 private key of the local interface.
    pub private_key: String,
    /// UDP port the interface listens on.
    pub listen_port: u16,
    /// Remote peers.
    pub peers: Vec<WgPeerConfig>,
}

impl WgConfig {
    /// Parse the configuration file at `path`.
    pub fn parse(path: &Path) -> WgdockResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse_str(&text)
    }

    /// Parse configuration text.
    ///
    /// # Errors
    ///
    /// [`WgdockError::BadConfig`] with the 1-based line the parser stopped
    /// at and the reason.
    pub fn parse_str(text: &str) -> WgdockResult<Self> {
        Parser::default().run(text)
    }

    /// Static routes the runtime installs inside joining containers: one
    /// route per peer AllowedIPs CIDR, all via the bridge address.
    #[must_use]
    pub fn get_routes(&self, bridge_ip: Ipv4Addr) -> Vec<StaticRoute> {
        self.peers
            .iter()
            .flat_map(|peer| peer.allowed_ips.iter())
            .map(|cidr| StaticRoute {
                destination: cidr.to_string(),
                route_type: 0,
                next_hop: bridge_ip.to_string(),
            })
            .collect()
    }

    /// Create and program the WireGuard interface inside `ns`.
    ///
    /// Picks an unused `wg`-prefixed link name, creates the device, assigns
    /// the interface address, writes key, listen port and peers through the
    /// WireGuard UAPI, and brings the link up. Returns the link name.
    pub async fn start_interface(&self, ns: &NetnsHandle, nl: &NlChannel) -> WgdockResult<String> {
        let names = nl.link_names().await?;
        let name = netlink::pick_unused_name(WG_LINK_PREFIX, &names);

        ns.run_in(|| self.write_device(&name))?;

        let index = nl.link_index(&name).await?;
        nl.set_up(index).await?;

        tracing::info!(link = %name, address = %self.address, port = self.listen_port, "WireGuard interface up");
        Ok(name)
    }

    /// Create the device and write its configuration.
    ///
    /// Must run on a thread already inside the target namespace.
    fn write_device(&self, name: &str) -> WgdockResult<()> {
        use defguard_wireguard_rs::host::Peer;
        use defguard_wireguard_rs::key::Key;
        use defguard_wireguard_rs::net::IpAddrMask;
        use defguard_wireguard_rs::{InterfaceConfiguration, WGApi, WireguardInterfaceApi};

        let wgapi = WGApi::new(name.to_string()).map_err(wg_err("open wireguard api"))?;
        wgapi
            .create_interface()
            .map_err(wg_err("create wireguard link"))?;

        let mut peers = Vec::with_capacity(self.peers.len());
        for peer_conf in &self.peers {
            let public: Key = peer_conf
                .public_key
                .as_str()
                .try_into()
                .map_err(wg_err("load peer public key"))?;
            let mut peer = Peer::new(public);
            peer.endpoint = Some(peer_conf.endpoint);
            peer.persistent_keepalive_interval = peer_conf.persistent_keepalive;
            peer.set_allowed_ips(
                peer_conf
                    .allowed_ips
                    .iter()
                    .map(|net| IpAddrMask::new(IpAddr::V4(net.ip()), net.prefix()))
                    .collect(),
            );
            peers.push(peer);
        }

        let config = InterfaceConfiguration {
            name: name.to_string(),
            prvkey: self.private_key.clone(),
            addresses: vec![IpAddrMask::new(IpAddr::V4(self.address.ip()), self.address.prefix())],
            port: u32::from(self.listen_port),
            peers,
            mtu: None,
        };
        wgapi
            .configure_interface(&config)
            .map_err(wg_err("write wireguard config"))?;
        Ok(())
    }
}

fn wg_err<E: std::fmt::Display>(op: &'static str) -> impl FnOnce(E) -> WgdockError {
    move |e| WgdockError::NetlinkError {
        op: op.into(),
        cause: e.to_string(),
    }
}

fn bad(line: usize, reason: impl Into<String>) -> WgdockError {
    WgdockError::BadConfig {
        line,
        reason: reason.into(),
    }
}

#[derive(Default)]
enum Section {
    #[default]
    None,
    Interface,
    Peer(PeerBuilder),
}

#[derive(Default)]
struct PeerBuilder {
    start_line: usize,
    public_key: Option<String>,
    endpoint: Option<SocketAddr>,
    allowed_ips: Vec<Ipv4Network>,
    persistent_keepalive: Option<u16>,
}

impl PeerBuilder {
    fn finish(self) -> WgdockResult<WgPeerConfig> {
        let public_key = self
            .public_key
            .ok_or_else(|| bad(self.start_line, "[Peer] is missing PublicKey"))?;
        let endpoint = self
            .endpoint
            .ok_or_else(|| bad(self.start_line, "[Peer] is missing Endpoint"))?;
        if self.allowed_ips.is_empty() {
            return Err(bad(self.start_line, "[Peer] is missing AllowedIPs"));
        }
        Ok(WgPeerConfig {
            public_key,
            endpoint,
            allowed_ips: self.allowed_ips,
            persistent_keepalive: self.persistent_keepalive,
        })
    }
}

#[derive(Default)]
struct Parser {
    section: Section,
    interface_line: usize,
    address: Option<Ipv4Network>,
    private_key: Option<String>,
    listen_port: Option<u16>,
    peers: Vec<WgPeerConfig>,
}

impl Parser {
    fn run(mut self, text: &str) -> WgdockResult<WgConfig> {
        let mut last_line = 0;
        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            last_line = line;
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if trimmed.starts_with('[') {
                self.enter_section(line, trimmed)?;
            } else {
                self.key_value(line, trimmed)?;
            }
        }
        self.finish(last_line)
    }

    fn enter_section(&mut self, line: usize, header: &str) -> WgdockResult<()> {
        self.flush_peer()?;
        match header.to_ascii_lowercase().as_str() {
            "[interface]" => {
                if self.interface_line != 0 {
                    return Err(bad(line, "duplicate [Interface] section"));
                }
                self.interface_line = line;
                self.section = Section::Interface;
            }
            "[peer]" => {
                self.section = Section::Peer(PeerBuilder {
                    start_line: line,
                    ..PeerBuilder::default()
                });
            }
            other => return Err(bad(line, format!("unknown section {other}"))),
        }
        Ok(())
    }

    fn key_value(&mut self, line: usize, text: &str) -> WgdockResult<()> {
        let (key, value) = text
            .split_once('=')
            .ok_or_else(|| bad(line, "expected key = value"))?;
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();
        if value.is_empty() {
            return Err(bad(line, format!("empty value for {key}")));
        }

        match &mut self.section {
            Section::None => Err(bad(line, "key outside of any section")),
            Section::Interface => match key.as_str() {
                "address" => {
                    let net = Ipv4Network::from_str(value)
                        .map_err(|e| bad(line, format!("invalid Address: {e}")))?;
                    self.address = Some(net);
                    Ok(())
                }
                "privatekey" => {
                    self.private_key = Some(value.to_string());
                    Ok(())
                }
                "listenport" => {
                    let port: u16 = value
                        .parse()
                        .map_err(|_| bad(line, format!("invalid ListenPort: {value}")))?;
                    self.listen_port = Some(port);
                    Ok(())
                }
                other => Err(bad(line, format!("unknown key '{other}' in [Interface]"))),
            },
            Section::Peer(peer) => match key.as_str() {
                "publickey" => {
                    peer.public_key = Some(value.to_string());
                    Ok(())
                }
                "endpoint" => {
                    peer.endpoint = Some(parse_endpoint(line, value)?);
                    Ok(())
                }
                "allowedips" => {
                    for part in value.split(',') {
                        let net = Ipv4Network::from_str(part.trim())
                            .map_err(|e| bad(line, format!("invalid AllowedIPs entry: {e}")))?;
                        peer.allowed_ips.push(net);
                    }
                    Ok(())
                }
                "persistentkeepalive" => {
                    let secs: u16 = value
                        .parse()
                        .map_err(|_| bad(line, format!("invalid PersistentKeepalive: {value}")))?;
                    peer.persistent_keepalive = Some(secs);
                    Ok(())
                }
                other => Err(bad(line, format!("unknown key '{other}' in [Peer]"))),
            },
        }
    }

    fn flush_peer(&mut self) -> WgdockResult<()> {
        if let Section::Peer(peer) = std::mem::take(&mut self.section) {
            self.peers.push(peer.finish()?);
        }
        Ok(())
    }

    fn finish(mut self, last_line: usize) -> WgdockResult<WgConfig> {
        self.flush_peer()?;
        if self.interface_line == 0 {
            return Err(bad(last_line, "missing [Interface] section"));
        }
        let address = self
            .address
            .ok_or_else(|| bad(self.interface_line, "[Interface] is missing Address"))?;
        let private_key = self
            .private_key
            .ok_or_else(|| bad(self.interface_line, "[Interface] is missing PrivateKey"))?;
        let listen_port = self
            .listen_port
            .ok_or_else(|| bad(self.interface_line, "[Interface] is missing ListenPort"))?;
        if self.peers.is_empty() {
            return Err(bad(last_line, "at least one [Peer] section is required"));
        }
        Ok(WgConfig {
            address,
            private_key,
            listen_port,
            peers: self.peers,
        })
    }
}

/// `host:port`, either a literal socket address or a resolvable name.
fn parse_endpoint(line: usize, value: &str) -> WgdockResult<SocketAddr> {
    if let Ok(addr) = SocketAddr::from_str(value) {
        return Ok(addr);
    }
    value
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.find(SocketAddr::is_ipv4))
        .ok_or_else(|| bad(line, format!("invalid Endpoint: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
[Interface]
Address = 10.20.0.1/24
PrivateKey = cPYlh1l4Ylo3l1dYzmTyNbAKrUtcvvVaM7Z5ZVQx03c=
ListenPort = 51820

[Peer]
PublicKey = gQ06q2nVwCdLQnX3nZHTTFkVLUq3Q9lPhcHlqFXK2z0=
Endpoint = 198.51.100.7:51820
AllowedIPs = 10.99.0.0/24
PersistentKeepalive = 25
";

    #[test]
    fn parses_full_config() {
        let conf = WgConfig::parse_str(SAMPLE).unwrap();
        assert_eq!(conf.address, "10.20.0.1/24".parse().unwrap());
        assert_eq!(conf.listen_port, 51820);
        assert_eq!(conf.peers.len(), 1);

        let peer = &conf.peers[0];
        assert_eq!(peer.endpoint, "198.51.100.7:51820".parse().unwrap());
        assert_eq!(peer.allowed_ips, vec!["10.99.0.0/24".parse().unwrap()]);
        assert_eq!(peer.persistent_keepalive, Some(25));
    }

    #[test]
    fn keys_are_case_insensitive_and_values_trimmed() {
        let text = "\
[interface]
ADDRESS =   10.20.0.1/24
privatekey = k
LISTENPORT = 7777
[PEER]
publickey = p
endpoint = 192.0.2.1:1
allowedips = 10.0.0.0/8 , 10.99.0.0/24
";
        let conf = WgConfig::parse_str(text).unwrap();
        assert_eq!(conf.listen_port, 7777);
        assert_eq!(conf.peers[0].allowed_ips.len(), 2);
    }

    #[test]
    fn rejects_unknown_keys() {
        let text = "\
[Interface]
Address = 10.20.0.1/24
Table = off
";
        match WgConfig::parse_str(text) {
            Err(WgdockError::BadConfig { line, reason }) => {
                assert_eq!(line, 3);
                assert!(reason.contains("unknown key"), "{reason}");
            }
            other => panic!("expected BadConfig, got {other:?}"),
        }
    }

    #[test]
    fn rejects_missing_interface_fields() {
        let text = "\
[Interface]
Address = 10.20.0.1/24
[Peer]
PublicKey = p
Endpoint = 192.0.2.1:1
AllowedIPs = 10.0.0.0/8
";
        match WgConfig::parse_str(text) {
            Err(WgdockError::BadConfig { line, reason }) => {
                assert_eq!(line, 1);
                assert!(reason.contains("PrivateKey"), "{reason}");
            }
            other => panic!("expected BadConfig, got {other:?}"),
        }
    }

    #[test]
    fn rejects_peer_without_allowed_ips() {
        let text = "\
[Interface]
Address = 10.20.0.1/24
PrivateKey = k
ListenPort = 51820
[Peer]
PublicKey = p
Endpoint = 192.0.2.1:1
";
        assert!(matches!(
            WgConfig::parse_str(text),
            Err(WgdockError::BadConfig { .. })
        ));
    }

    #[test]
    fn rejects_config_without_peers() {
        let text = "\
[Interface]
Address = 10.20.0.1/24
PrivateKey = k
ListenPort = 51820
";
        assert!(matches!(
            WgConfig::parse_str(text),
            Err(WgdockError::BadConfig { .. })
        ));
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let text = format!("# generated\n\n{SAMPLE}");
        assert!(WgConfig::parse_str(&text).is_ok());
    }

    #[test]
    fn routes_cover_all_peer_allowed_ips() {
        let text = "\
[Interface]
Address = 10.20.0.1/24
PrivateKey = k
ListenPort = 51820
[Peer]
PublicKey = p1
Endpoint = 192.0.2.1:1
AllowedIPs = 10.99.0.0/24, 10.98.0.0/16
[Peer]
PublicKey = p2
Endpoint = 192.0.2.2:1
AllowedIPs = 172.20.0.0/16
";
        let conf = WgConfig::parse_str(text).unwrap();
        let routes = conf.get_routes(Ipv4Addr::new(10, 20, 0, 2));

        let destinations: Vec<&str> = routes.iter().map(|r| r.destination.as_str()).collect();
        assert_eq!(
            destinations,
            vec!["10.99.0.0/24", "10.98.0.0/16", "172.20.0.0/16"]
        );
        assert!(routes.iter().all(|r| r.next_hop == "10.20.0.2"));
        assert!(routes.iter().all(|r| r.route_type == 0));
    }
}
