//! Recover the guest's DHCP address from its console log.
//!
//! Best effort: the pattern may be absent (quiet console, different network
//! stack), in which case callers fall back to [`DEFAULT_GUEST_ADDR`].

use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

/// Address gvproxy's DHCP server hands to the first guest MAC.
pub const DEFAULT_GUEST_ADDR: Ipv4Addr = Ipv4Addr::new(192, 168, 127, 2);

/// Lease lines from systemd-networkd, NetworkManager and dhclient.
static LEASE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:DHCPv4 address|dhcp4 \([^)]*\):\s+address|bound to|lease of)\s+(\d{1,3}(?:\.\d{1,3}){3})",
    )
    .expect("lease pattern is valid")
});

/// Most recent lease address in `log`, if any line matches.
pub fn extract_guest_address(log: &str) -> Option<Ipv4Addr> {
    LEASE_LINE
        .captures_iter(log)
        .filter_map(|c| c.get(1)?.as_str().parse::<Ipv4Addr>().ok())
        .last()
}

/// Read `path` and extract, falling back to the default address.
pub fn guest_address_from_file(path: &Path) -> (Ipv4Addr, bool) {
    let text = std::fs::read(path)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default();
    match extract_guest_address(&text) {
        Some(addr) => (addr, true),
        None => (DEFAULT_GUEST_ADDR, false),
    }
}
