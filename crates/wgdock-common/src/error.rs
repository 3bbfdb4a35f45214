//! Common error types for the wgdock plugin.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`WgdockError`].
pub type WgdockResult<T> = Result<T, WgdockError>;

/// Errors shared across the wgdock crates.
#[derive(Error, Diagnostic, Debug)]
pub enum WgdockError {
    /// WireGuard config file rejected.
    #[error("Bad config at line {line}: {reason}")]
    #[diagnostic(
        code(wgdock::config::bad),
        help("The file must use the standard WireGuard syntax: one [Interface] section and one or more [Peer] sections")
    )]
    BadConfig {
        /// 1-based line number the parser stopped at.
        line: usize,
        /// What was wrong with it.
        reason: String,
    },

    /// Network option missing or malformed.
    #[error("Bad option '{name}': {reason}")]
    #[diagnostic(
        code(wgdock::option::bad),
        help("Pass driver options with `docker network create -o <name>=<value>`")
    )]
    BadOption {
        /// The option key.
        name: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The kernel refused a netlink operation.
    #[error("Netlink operation '{op}' failed: {cause}")]
    #[diagnostic(code(wgdock::netlink))]
    NetlinkError {
        /// The operation that failed.
        op: String,
        /// The kernel's reason.
        cause: String,
    },

    /// Netfilter refused an operation.
    #[error("iptables operation '{op}' failed: {cause}")]
    #[diagnostic(
        code(wgdock::iptables),
        help("The plugin needs CAP_NET_ADMIN in the host network namespace")
    )]
    IptablesError {
        /// The operation that failed.
        op: String,
        /// stderr of the iptables invocation.
        cause: String,
    },

    /// No free host address left in the IPAM pool.
    #[error("Address pool exhausted")]
    #[diagnostic(
        code(wgdock::ipam::exhausted),
        help("Create the network with a larger subnet")
    )]
    PoolExhausted,

    /// No free /31 pair left in the outbound range.
    #[error("No unused address pair in 172.31.0.0/16")]
    #[diagnostic(code(wgdock::ipam::no_free_address))]
    NoFreeAddress,

    /// Endpoint id already known to the network.
    #[error("Endpoint with this id already exists: {id}")]
    #[diagnostic(code(wgdock::endpoint::duplicate))]
    DuplicateEndpoint {
        /// The duplicated endpoint id.
        id: String,
    },

    /// Endpoint id not known to the network.
    #[error("Endpoint not found: {id}")]
    #[diagnostic(code(wgdock::endpoint::unknown))]
    UnknownEndpoint {
        /// The endpoint id that was not found.
        id: String,
    },

    /// Network id not known to the driver.
    #[error("Network not found: {id}")]
    #[diagnostic(code(wgdock::network::unknown))]
    UnknownNetwork {
        /// The network id that was not found.
        id: String,
    },

    /// The protocol called an operation the driver does not implement.
    #[error("[{op}] not supported")]
    #[diagnostic(code(wgdock::unsupported))]
    Unsupported {
        /// The protocol method name.
        op: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(wgdock::io))]
    Io(#[from] std::io::Error),

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(code(wgdock::internal))]
    Internal {
        /// The error message.
        message: String,
    },

    /// Several teardown steps failed; all causes are carried.
    #[error("Cleanup failed: {}", .errors.join("; "))]
    #[diagnostic(code(wgdock::aggregate))]
    Aggregate {
        /// Display strings of the collected failures.
        errors: Vec<String>,
    },
}

impl WgdockError {
    /// Fold a list of collected errors into a single result.
    ///
    /// Empty list means every step succeeded; a single error is returned
    /// as-is; more than one becomes [`WgdockError::Aggregate`].
    pub fn aggregate(mut errors: Vec<WgdockError>) -> WgdockResult<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(WgdockError::Aggregate {
                errors: errors.iter().map(ToString::to_string).collect(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = WgdockError::UnknownEndpoint {
            id: "ep1".to_string(),
        };
        assert_eq!(err.to_string(), "Endpoint not found: ep1");

        let err = WgdockError::BadConfig {
            line: 7,
            reason: "unknown key 'Foo'".to_string(),
        };
        assert_eq!(err.to_string(), "Bad config at line 7: unknown key 'Foo'");
    }

    #[test]
    fn aggregate_folding() {
        assert!(WgdockError::aggregate(vec![]).is_ok());

        let single = WgdockError::aggregate(vec![WgdockError::PoolExhausted]);
        assert!(matches!(single, Err(WgdockError::PoolExhausted)));

        let many = WgdockError::aggregate(vec![
            WgdockError::PoolExhausted,
            WgdockError::NoFreeAddress,
        ]);
        match many {
            Err(WgdockError::Aggregate { errors }) => assert_eq!(errors.len(), 2),
            other => panic!("expected aggregate, got {other:?}"),
        }
    }
}
