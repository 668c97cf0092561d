//! Host port allocation for forwarded services.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};

use crate::error::{VmError, VmResult};

const MAX_ATTEMPTS: u32 = 32;

/// Ask the kernel for a free loopback port, skipping any in `reserved`
/// (ports held by other live VMs whose proxy may be momentarily down).
pub fn allocate_port(reserved: &HashSet<u16>) -> VmResult<u16> {
    for _ in 0..MAX_ATTEMPTS {
        let listener = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
            .map_err(|e| VmError::io("bind ephemeral port", e))?;
        let port = listener
            .local_addr()
            .map_err(|e| VmError::io("read ephemeral port", e))?
            .port();
        if !reserved.contains(&port) {
            return Ok(port);
        }
    }
    Err(VmError::PortExhausted {
        attempts: MAX_ATTEMPTS,
    })
}

/// True when nothing is listening on `127.0.0.1:port`.
pub fn is_port_free(port: u16) -> bool {
    TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_port_is_bindable() {
        let port = allocate_port(&HashSet::new()).unwrap();
        assert!(port > 0);
        assert!(is_port_free(port));
    }

    #[test]
    fn bound_port_is_not_free() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!is_port_free(port));
    }

    #[test]
    fn reserved_ports_are_skipped() {
        let first = allocate_port(&HashSet::new()).unwrap();
        let reserved: HashSet<u16> = [first].into_iter().collect();
        for _ in 0..8 {
            assert_ne!(allocate_port(&reserved).unwrap(), first);
        }
    }
}
