//! `/proc/sys` writes for the calling thread's network namespace.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::debug;

const SYSCTL_ROOT: &str = "/proc/sys";

/// Resolves a slash-form key such as `net/ipv6/conf/eth0/accept_dad`.
///
/// Slash form keeps interface names containing dots (VLAN devices) intact.
pub fn path_for(key: &str) -> PathBuf {
    PathBuf::from(SYSCTL_ROOT).join(key.trim_start_matches('/'))
}

/// Writes `value` to the sysctl `key`.
///
/// `/proc/sys/net` resolves against the namespace of the thread that opens
/// it, so this must run inside [`Netns::run`](crate::netns::Netns::run) to
/// target a container.
pub fn write(key: &str, value: &str) -> io::Result<()> {
    let path = path_for(key);
    let mut file = OpenOptions::new().write(true).open(&path)?;
    file.write_all(value.as_bytes())?;
    debug!(key, value, "Wrote sysctl");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_for_keeps_dotted_names() {
        assert_eq!(
            path_for("net/ipv6/conf/eth0.100/accept_dad"),
            PathBuf::from("/proc/sys/net/ipv6/conf/eth0.100/accept_dad")
        );
        assert_eq!(
            path_for("/net/ipv6/conf/eth0/enhanced_dad"),
            PathBuf::from("/proc/sys/net/ipv6/conf/eth0/enhanced_dad")
        );
    }
}
