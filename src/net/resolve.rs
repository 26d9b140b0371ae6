use std::io::{Error, ErrorKind, Result};
#[cfg(feature = "ipv6")]
use std::net::Ipv6Addr;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};

use tracing::debug;

/// Address family of a multicast group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MulticastFamily {
    V4,
    V6,
}

/// Classifies a destination: IPv4 multicast is 224.0.0.0/4 (first octet
/// `0xE0` after masking with `0xF0`), IPv6 multicast is `ff00::/8`.
pub(crate) fn multicast_family(addr: &SocketAddr) -> Option<MulticastFamily> {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_multicast() => Some(MulticastFamily::V4),
        IpAddr::V6(ip) if ip.is_multicast() => Some(MulticastFamily::V6),
        _ => None,
    }
}

/// Resolves a hostname and port into an ordered list of socket addresses.
///
/// With no host, the wildcard addresses are returned (IPv4 first), which is
/// the listen-on-all-interfaces case. A hostname may resolve to several
/// records; callers try them in order.
pub(crate) fn resolve(host: Option<&str>, port: u16) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = match host {
        None => {
            debug!("Listening on all interfaces");
            let mut records = vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)];
            #[cfg(feature = "ipv6")]
            records.push(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port));
            records
        }
        Some(host) => {
            let resolved = (host, port).to_socket_addrs()?;
            #[cfg(feature = "ipv6")]
            let filtered: Vec<SocketAddr> = resolved.collect();
            #[cfg(not(feature = "ipv6"))]
            let filtered: Vec<SocketAddr> = resolved.filter(SocketAddr::is_ipv4).collect();
            filtered
        }
    };

    if addrs.is_empty() {
        return Err(Error::new(
            ErrorKind::AddrNotAvailable,
            format!("Lookup of {} returned no usable address", host.unwrap_or("*")),
        ));
    }
    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().expect("literal address")
    }

    #[test]
    fn classifies_ipv4_multicast_range() {
        assert_eq!(
            multicast_family(&addr("224.0.0.1:0")),
            Some(MulticastFamily::V4)
        );
        assert_eq!(
            multicast_family(&addr("239.255.255.255:0")),
            Some(MulticastFamily::V4)
        );
        // The octet below and above the 224..=239 range is unicast/reserved.
        assert_eq!(multicast_family(&addr("223.255.255.255:0")), None);
        assert_eq!(multicast_family(&addr("240.0.0.1:0")), None);
    }

    #[test]
    fn classifies_ipv6_multicast_range() {
        assert_eq!(
            multicast_family(&addr("[ff02::1]:0")),
            Some(MulticastFamily::V6)
        );
        assert_eq!(multicast_family(&addr("[fe80::1]:0")), None);
        assert_eq!(multicast_family(&addr("[::1]:0")), None);
    }

    #[test]
    fn unicast_is_not_multicast() {
        assert_eq!(multicast_family(&addr("127.0.0.1:4840")), None);
        assert_eq!(multicast_family(&addr("192.168.1.10:4840")), None);
    }

    #[test]
    fn wildcard_expansion_starts_with_ipv4() {
        let addrs = resolve(None, 4840).expect("wildcard");
        assert_eq!(addrs[0], addr("0.0.0.0:4840"));
        #[cfg(feature = "ipv6")]
        assert_eq!(addrs[1], addr("[::]:4840"));
    }

    #[test]
    fn numeric_host_resolves_to_itself() {
        let addrs = resolve(Some("127.0.0.1"), 9000).expect("loopback");
        assert_eq!(addrs, vec![addr("127.0.0.1:9000")]);
    }

    #[test]
    fn garbage_host_fails() {
        assert!(resolve(Some("definitely-not-a-host.invalid"), 1).is_err());
    }
}
