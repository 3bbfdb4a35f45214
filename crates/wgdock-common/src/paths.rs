//! Standard filesystem paths for wgdock.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Socket the Docker daemon discovers the plugin through.
pub static PLUGIN_SOCKET: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("WGDOCK_PLUGIN_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/run/docker/plugins/wgdock.sock"))
});

/// Mount directory for named network namespaces.
pub static NETNS_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("WGDOCK_NETNS_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/run/netns"))
});

/// Path of the bind mount for a named namespace.
#[must_use]
pub fn netns_path(name: &str) -> PathBuf {
    NETNS_DIR.join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn netns_paths() {
        assert_eq!(netns_path("vpn0"), NETNS_DIR.join("vpn0"));
    }
}
