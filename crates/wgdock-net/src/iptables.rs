//! Host-side DNAT/SNAT/FORWARD rules for WireGuard forwarding.
//!
//! All mutations run inside the root namespace: the `iptables` binary is
//! spawned from a thread pinned there, so the rules land on the host even
//! when the plugin process itself lives in a container.

use std::net::Ipv4Addr;
use std::process::Output;
use std::sync::{Arc, Mutex};

use wgdock_common::{WgdockError, WgdockResult};

use crate::netns::NetnsHandle;

/// Comment tag carried by every rule, so teardown can locate rules without
/// remembering insertion indices.
const RULE_COMMENT: &str = "wgdock";

/// One installed forwarding set: the four rules for a single network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Forwarding {
    outbound_addr: Ipv4Addr,
    wg_endpoint: Ipv4Addr,
    port: u16,
}

/// Manager of the plugin's netfilter footprint in the root namespace.
pub struct IptablesManager {
    root_ns: Arc<NetnsHandle>,
    active: Mutex<Vec<Forwarding>>,
}

impl IptablesManager {
    /// Create the manager and verify iptables is usable in the root
    /// namespace.
    pub fn new(root_ns: Arc<NetnsHandle>) -> WgdockResult<Self> {
        let manager = Self {
            root_ns,
            active: Mutex::new(Vec::new()),
        };
        let probe = manager.run(&["--version".to_string()])?;
        if !probe.status.success() {
            return Err(WgdockError::IptablesError {
                op: "iptables --version".into(),
                cause: String::from_utf8_lossy(&probe.stderr).trim().to_string(),
            });
        }
        Ok(manager)
    }

    /// Install DNAT/MASQUERADE/FORWARD rules for one network.
    ///
    /// Inbound UDP to `wg_endpoint:port` is rewritten to
    /// `outbound_addr:port`; return traffic from `outbound_addr` is
    /// masqueraded; both FORWARD directions are accepted. A failure midway
    /// removes the rules already inserted before returning.
    pub fn setup_forwarding(
        &self,
        outbound_addr: Ipv4Addr,
        wg_endpoint: Ipv4Addr,
        port: u16,
    ) -> WgdockResult<()> {
        let forwarding = Forwarding {
            outbound_addr,
            wg_endpoint,
            port,
        };

        let rules = rule_specs("-A", &forwarding);
        for (i, rule) in rules.iter().enumerate() {
            if let Err(e) = self.insert(rule) {
                for inserted in rule_specs("-D", &forwarding).iter().take(i) {
                    self.remove(inserted);
                }
                return Err(e);
            }
        }

        self.active.lock().unwrap().push(forwarding);
        tracing::info!(
            %wg_endpoint, %outbound_addr, port,
            "Installed forwarding rules"
        );
        Ok(())
    }

    /// Delete the exact rules previously inserted for one network.
    ///
    /// Absent rules are logged and skipped: recovery from a crashed
    /// previous run is expected.
    pub fn remove_forwarding(
        &self,
        outbound_addr: Ipv4Addr,
        wg_endpoint: Ipv4Addr,
        port: u16,
    ) -> WgdockResult<()> {
        let forwarding = Forwarding {
            outbound_addr,
            wg_endpoint,
            port,
        };

        for rule in &rule_specs("-D", &forwarding) {
            self.remove(rule);
        }

        self.active.lock().unwrap().retain(|f| *f != forwarding);
        tracing::info!(%wg_endpoint, %outbound_addr, port, "Removed forwarding rules");
        Ok(())
    }

    /// Remove any residual rule set this manager still tracks.
    pub fn delete(&self) -> WgdockResult<()> {
        let remaining: Vec<Forwarding> = self.active.lock().unwrap().drain(..).collect();
        for f in remaining {
            for rule in &rule_specs("-D", &f) {
                self.remove(rule);
            }
        }
        Ok(())
    }

    /// Insert a rule, failing on a non-zero exit.
    fn insert(&self, args: &[String]) -> WgdockResult<()> {
        let output = self.run(args)?;
        if !output.status.success() {
            return Err(WgdockError::IptablesError {
                op: format!("iptables {}", args.join(" ")),
                cause: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    /// Delete a rule; a non-zero exit only warns (the rule may be gone).
    fn remove(&self, args: &[String]) {
        match self.run(args) {
            Ok(output) if !output.status.success() => {
                tracing::warn!(
                    rule = %args.join(" "),
                    "Failed to delete iptables rule (may not exist)"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(rule = %args.join(" "), error = %e, "iptables did not run"),
        }
    }

    /// Run iptables with `args` inside the root namespace.
    fn run(&self, args: &[String]) -> WgdockResult<Output> {
        self.root_ns.run_in(|| {
            std::process::Command::new("iptables")
                .args(args)
                .output()
                .map_err(|e| WgdockError::IptablesError {
                    op: format!("iptables {}", args.join(" ")),
                    cause: e.to_string(),
                })
        })
    }
}

/// The four rule argument vectors for one forwarding set.
///
/// `action` is `-A` to install or `-D` to delete; both shapes are otherwise
/// identical so deletion matches exactly what was inserted.
fn rule_specs(action: &str, f: &Forwarding) -> Vec<Vec<String>> {
    let endpoint = f.wg_endpoint.to_string();
    let port = f.port.to_string();
    let dnat_target = format!("{}:{}", f.outbound_addr, f.port);
    let outbound = format!("{}/32", f.outbound_addr);

    let dnat = [
        "-t", "nat", action, "PREROUTING",
        "-p", "udp", "-d", &endpoint, "--dport", &port,
        "-j", "DNAT", "--to-destination", &dnat_target,
        "-m", "comment", "--comment", RULE_COMMENT,
    ];
    let masquerade = [
        "-t", "nat", action, "POSTROUTING",
        "-s", &outbound,
        "-j", "MASQUERADE",
        "-m", "comment", "--comment", RULE_COMMENT,
    ];
    let forward_in = [
        action, "FORWARD", "-d", &outbound,
        "-j", "ACCEPT",
        "-m", "comment", "--comment", RULE_COMMENT,
    ];
    let forward_out = [
        action, "FORWARD", "-s", &outbound,
        "-j", "ACCEPT",
        "-m", "comment", "--comment", RULE_COMMENT,
    ];

    [&dnat[..], &masquerade[..], &forward_in[..], &forward_out[..]]
        .iter()
        .map(|rule| rule.iter().map(ToString::to_string).collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Forwarding {
        Forwarding {
            outbound_addr: Ipv4Addr::new(172, 31, 0, 1),
            wg_endpoint: Ipv4Addr::new(203, 0, 113, 5),
            port: 51820,
        }
    }

    #[test]
    fn dnat_rule_shape() {
        let rules = rule_specs("-A", &sample());
        let dnat = rules[0].join(" ");
        assert_eq!(
            dnat,
            "-t nat -A PREROUTING -p udp -d 203.0.113.5 --dport 51820 \
             -j DNAT --to-destination 172.31.0.1:51820 \
             -m comment --comment wgdock"
        );
    }

    #[test]
    fn masquerade_and_forward_rules() {
        let rules = rule_specs("-A", &sample());
        assert_eq!(
            rules[1].join(" "),
            "-t nat -A POSTROUTING -s 172.31.0.1/32 -j MASQUERADE -m comment --comment wgdock"
        );
        assert_eq!(
            rules[2].join(" "),
            "-A FORWARD -d 172.31.0.1/32 -j ACCEPT -m comment --comment wgdock"
        );
        assert_eq!(
            rules[3].join(" "),
            "-A FORWARD -s 172.31.0.1/32 -j ACCEPT -m comment --comment wgdock"
        );
    }

    #[test]
    fn every_rule_is_tagged() {
        for rule in rule_specs("-A", &sample()) {
            assert_eq!(rule.last().unwrap(), RULE_COMMENT);
        }
    }

    #[test]
    fn delete_specs_mirror_insert_specs() {
        let add = rule_specs("-A", &sample());
        let del = rule_specs("-D", &sample());
        for (a, d) in add.iter().zip(del.iter()) {
            let fixed: Vec<_> = a.iter().map(|s| s.replace("-A", "-D")).collect();
            assert_eq!(&fixed, d);
        }
    }
}
