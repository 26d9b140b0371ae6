use getifaddrs::{Address, getifaddrs, if_nametoindex};
use std::{
    io::{Error, ErrorKind, Result},
    net::{Ipv4Addr, Ipv6Addr},
};

use crate::net::resolve::MulticastFamily;

/// A local network interface with its assigned addresses.
#[derive(Debug, Clone)]
pub(crate) struct Netif {
    /// System interface name (e.g., `"eth0"` or `"lo"`).
    pub(crate) name: String,
    /// Operating system interface index.
    pub(crate) index: u32,
    /// List of assigned IPv4 addresses.
    pub(crate) inet: Vec<Ipv4Addr>,
    /// List of assigned IPv6 addresses.
    pub(crate) inet6: Vec<Ipv6Addr>,
}

/// Enumerates the system's network interfaces, grouping the per-address
/// records by interface name in first-seen order. Interfaces whose index
/// cannot be determined are skipped.
fn enumerate() -> Result<Vec<Netif>> {
    let mut netifs: Vec<Netif> = Vec::new();

    for iface in getifaddrs()? {
        let position = netifs.iter().position(|n| n.name == iface.name);
        let entry = match position {
            Some(position) => &mut netifs[position],
            None => {
                let Ok(index) = if_nametoindex(&iface.name) else {
                    continue;
                };
                netifs.push(Netif {
                    name: iface.name.clone(),
                    index,
                    inet: Vec::new(),
                    inet6: Vec::new(),
                });
                netifs.last_mut().expect("just pushed")
            }
        };
        match iface.address {
            Address::V4(v4) => entry.inet.push(v4.address),
            Address::V6(v6) => entry.inet6.push(v6.address),
            Address::Mac(_) => {}
        }
    }

    Ok(netifs)
}

/// Resolves an interface selector to a [`Netif`].
///
/// The selector is matched against the interface name first, then against
/// the textual form of the interface's primary address in the requested
/// family (only the first address of a multi-address interface is
/// considered). With the `single-netif` feature only the default (first
/// enumerated) interface is a candidate.
pub(crate) fn find_netif(selector: &str, family: MulticastFamily) -> Result<Netif> {
    let mut netifs = enumerate()?;

    #[cfg(feature = "single-netif")]
    netifs.truncate(1);

    for netif in netifs.drain(..) {
        if netif.name == selector {
            return Ok(netif);
        }
        let primary_text = match family {
            MulticastFamily::V4 => netif.inet.first().map(Ipv4Addr::to_string),
            MulticastFamily::V6 => netif.inet6.first().map(Ipv6Addr::to_string),
        };
        if primary_text.as_deref() == Some(selector) {
            return Ok(netif);
        }
    }

    Err(Error::new(
        ErrorKind::NotFound,
        format!("No network interface matches '{selector}'"),
    ))
}
