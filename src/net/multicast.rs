use socket2::Socket;
use std::{
    io::{Error, ErrorKind, Result},
    net::{IpAddr, Ipv4Addr, SocketAddr},
};
use tracing::warn;

use crate::net::interface::find_netif;
use crate::net::resolve::MulticastFamily;

/// An OS-level membership/egress request: the group address plus the
/// interface selector in the form the respective socket option wants it
/// (an interface address for IPv4, an interface index for IPv6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MulticastRequest {
    V4 {
        group: Ipv4Addr,
        interface: Ipv4Addr,
    },
    V6 {
        group: std::net::Ipv6Addr,
        interface: u32,
    },
}

/// Builds the request for a multicast group, resolving the configured
/// interface selector if there is one.
///
/// Without a selector the interface stays wildcard and the OS picks one.
pub(crate) fn build_request(
    group: &SocketAddr,
    family: MulticastFamily,
    selector: Option<&str>,
) -> Result<MulticastRequest> {
    #[cfg(not(feature = "ipv6"))]
    if family == MulticastFamily::V6 {
        return Err(Error::new(
            ErrorKind::Unsupported,
            "IPv6 multicast support is not enabled",
        ));
    }

    let mut request = match (family, group.ip()) {
        (MulticastFamily::V4, IpAddr::V4(group)) => MulticastRequest::V4 {
            group,
            interface: Ipv4Addr::UNSPECIFIED,
        },
        (MulticastFamily::V6, IpAddr::V6(group)) => MulticastRequest::V6 {
            group,
            interface: 0,
        },
        _ => {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "Multicast group and address family do not match",
            ));
        }
    };

    let Some(selector) = selector else {
        warn!(
            "No network interface defined for multicast group {}; \
             the OS selects a suitable interface",
            group
        );
        return Ok(request);
    };

    let netif = find_netif(selector, family)?;
    match &mut request {
        MulticastRequest::V4 { interface, .. } => {
            *interface = netif.inet.first().copied().unwrap_or(Ipv4Addr::UNSPECIFIED);
        }
        MulticastRequest::V6 { interface, .. } => *interface = netif.index,
    }
    Ok(request)
}

/// Joins a multicast group on a listen socket (`IP_ADD_MEMBERSHIP` /
/// `IPV6_JOIN_GROUP`).
pub(crate) fn join_group(
    socket: &Socket,
    group: &SocketAddr,
    family: MulticastFamily,
    selector: Option<&str>,
) -> Result<()> {
    match build_request(group, family, selector)? {
        MulticastRequest::V4 { group, interface } => {
            socket.join_multicast_v4(&group, &interface)
        }
        MulticastRequest::V6 { group, interface } => {
            socket.join_multicast_v6(&group, interface)
        }
    }
}

/// Selects the egress interface of a send socket (`IP_MULTICAST_IF` /
/// `IPV6_MULTICAST_IF`).
pub(crate) fn set_egress(
    socket: &Socket,
    group: &SocketAddr,
    family: MulticastFamily,
    selector: Option<&str>,
) -> Result<()> {
    match build_request(group, family, selector)? {
        MulticastRequest::V4 { interface, .. } => socket.set_multicast_if_v4(&interface),
        MulticastRequest::V6 { interface, .. } => socket.set_multicast_if_v6(interface),
    }
}
