use socket2::Socket;
use std::io::Result;
use tracing::warn;

use crate::params::SocketOptions;

/// Applies the common socket configuration to a freshly created UDP socket.
///
/// Non-blocking mode, SIGPIPE suppression, and IPv6-only mode (for IPv6
/// sockets) must succeed; a failure there aborts the open. The remaining
/// options (`ttl`, `loopback`, `reuse`, `sockpriority`) are best-effort: a
/// failure is logged and the open continues.
pub(crate) fn configure(socket: &Socket, options: &SocketOptions, is_ipv6: bool) -> Result<()> {
    socket.set_nonblocking(true)?;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    socket.set_nosigpipe(true)?;

    // Some Linux distributions have net.ipv6.bindv6only not activated, so
    // IPv6 sockets can double-bind to IPv4 and IPv6. Keep AF_INET6 sockets
    // strictly IPv6.
    #[cfg(feature = "ipv6")]
    if is_ipv6 {
        socket.set_only_v6(true)?;
    }

    // A TTL of 1 keeps multicast traffic on the local network.
    let ttl = options.ttl.unwrap_or(1);
    let applied = if is_ipv6 {
        socket.set_multicast_hops_v6(ttl)
    } else {
        socket.set_multicast_ttl_v4(ttl)
    };
    if let Err(e) = applied {
        warn!("Could not set multicast TTL to {}: {:?}", ttl, e);
    }

    if let Some(loopback) = options.loopback {
        let applied = if is_ipv6 {
            socket.set_multicast_loop_v6(loopback)
        } else {
            socket.set_multicast_loop_v4(loopback)
        };
        if let Err(e) = applied {
            warn!("Could not set multicast loopback: {:?}", e);
        }
    }

    if let Some(reuse) = options.reuse {
        if let Err(e) = socket.set_reuse_address(reuse) {
            warn!("Could not set SO_REUSEADDR: {:?}", e);
        }
        #[cfg(target_os = "linux")]
        if let Err(e) = socket.set_reuse_port(reuse) {
            warn!("Could not set SO_REUSEPORT: {:?}", e);
        }
    }

    if let Some(priority) = options.priority {
        #[cfg(target_os = "linux")]
        if let Err(e) = set_socket_priority(socket, priority) {
            warn!("Could not set SO_PRIORITY to {}: {:?}", priority, e);
        }
        #[cfg(not(target_os = "linux"))]
        warn!(
            "Socket priority {} ignored: SO_PRIORITY is Linux-only",
            priority
        );
    }

    Ok(())
}

/// Sets `SO_PRIORITY`, which socket2 does not expose.
#[cfg(target_os = "linux")]
fn set_socket_priority(socket: &Socket, priority: u32) -> Result<()> {
    use std::os::fd::AsRawFd;

    let prio = priority as libc::c_int;
    // SAFETY: setsockopt FFI with a valid fd, a standard socket option, and
    // a correctly sized optval pointer.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PRIORITY,
            std::ptr::from_ref(&prio).cast::<libc::c_void>(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use socket2::{Domain, Protocol, Type};

    fn udp_socket(domain: Domain) -> Socket {
        Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).expect("socket creation")
    }

    #[test]
    fn defaults_keep_ttl_at_one() {
        let socket = udp_socket(Domain::IPV4);
        configure(&socket, &SocketOptions::default(), false).expect("default config");
        assert_eq!(socket.multicast_ttl_v4().expect("ttl readback"), 1);
    }

    #[test]
    fn explicit_options_are_applied() {
        let socket = udp_socket(Domain::IPV4);
        let options = SocketOptions {
            ttl: Some(4),
            loopback: Some(true),
            reuse: Some(true),
            priority: None,
        };
        configure(&socket, &options, false).expect("explicit config");
        assert_eq!(socket.multicast_ttl_v4().expect("ttl readback"), 4);
        assert!(socket.multicast_loop_v4().expect("loopback readback"));
        assert!(socket.reuse_address().expect("reuse readback"));
    }

    #[cfg(feature = "ipv6")]
    #[test]
    fn ipv6_sockets_become_v6_only() {
        let socket = udp_socket(Domain::IPV6);
        configure(&socket, &SocketOptions::default(), true).expect("ipv6 config");
        assert!(socket.only_v6().expect("v6only readback"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn socket_priority_is_best_effort() {
        let socket = udp_socket(Domain::IPV4);
        let options = SocketOptions {
            priority: Some(3),
            ..SocketOptions::default()
        };
        // Priorities above 6 need CAP_NET_ADMIN; 3 is always allowed.
        configure(&socket, &options, false).expect("priority config");
    }
}
