use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::{
    cell::RefCell,
    io::ErrorKind,
    net::{Shutdown, SocketAddr, UdpSocket},
    os::fd::AsRawFd,
    rc::{Rc, Weak},
    time::Duration,
};
use tracing::{debug, error, info, warn};

use crate::{
    endpoint::{ConnectionId, Endpoint, Registry, Role, SharedCallback},
    error::{Error, Result},
    eventloop::{self, EventLoop, FdEvent, FdEventHandler},
    net::{config, multicast, resolve},
    params::{ManagerConfig, OpenConfig, ParamMap},
};

/// How long one writability poll on a blocked send may take before the
/// send loop re-evaluates. Bounds the latency a stalled socket can impose
/// on the rest of the loop.
const SEND_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Lifecycle state of a [`UdpConnectionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// No endpoints, no buffers. The only state that allows `start`.
    Stopped,
    /// Accepting `open_connection` calls.
    Started,
    /// Draining: every endpoint has been asked to shut down; the manager
    /// becomes `Stopped` when the last one is gone.
    Stopping,
}

/// State of a single connection as reported to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// The endpoint is open. Also the state of every datagram delivery.
    Established,
    /// The endpoint is going away; this is the last notification it emits.
    Closing,
}

/// Where a received datagram came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatagramSource {
    /// Numeric form of the sender's address (dotted decimal or colon hex).
    pub address: String,
    /// Sender's port in host byte order.
    pub port: u16,
}

/// A single notification to the application callback.
#[derive(Debug)]
pub struct ConnectionEvent<'a> {
    pub state: ConnectionState,
    /// Present exactly when a datagram is being delivered.
    pub remote: Option<&'a DatagramSource>,
    /// On the `Established` notification of a listen endpoint: the port the
    /// socket is actually bound to (read back when the configured port
    /// was 0).
    pub local_port: Option<u16>,
    /// Received bytes; empty on lifecycle notifications. The slice borrows
    /// the manager's receive buffer and must be copied to outlive the
    /// callback.
    pub payload: &'a [u8],
}

impl ConnectionEvent<'_> {
    fn lifecycle(state: ConnectionState, local_port: Option<u16>) -> ConnectionEvent<'static> {
        ConnectionEvent {
            state,
            remote: None,
            local_port,
            payload: &[],
        }
    }
}

struct Inner {
    state: ManagerState,
    registry: Registry,
    /// Shared receive buffer, allocated at `start` and moved out of the
    /// manager for the duration of each datagram dispatch.
    rx_buffer: Vec<u8>,
}

impl Inner {
    /// Stopping ends when the last endpoint has been removed.
    fn check_stopped(&mut self) {
        if self.registry.is_empty() && self.state == ManagerState::Stopping {
            debug!("All sockets closed, the connection manager has stopped");
            self.state = ManagerState::Stopped;
        }
    }
}

/// Manages a set of UDP endpoints on a single cooperative [`EventLoop`].
///
/// A manager owns listen endpoints (bound sockets whose datagrams are
/// dispatched to application callbacks) and send endpoints (sockets with a
/// cached destination). All state lives behind one interior-mutability
/// cell; callbacks are invoked with that cell released, so an application
/// may call back into the manager from inside a callback.
///
/// # Example
/// ```rust,no_run
/// use std::time::Duration;
/// use udpmux::{EventLoop, ParamMap, UdpConnectionManager};
///
/// let event_loop = EventLoop::new()?;
/// let manager = UdpConnectionManager::new("discovery", event_loop.clone());
/// manager.start(&ParamMap::new())?;
///
/// let params = ParamMap::new()
///     .with("listen", true)
///     .with("address", "239.0.0.1")
///     .with("port", 5000u16)
///     .with("interface", "eth0");
/// manager.open_connection(&params, |_manager, id, event| {
///     println!("connection {id}: {:?} {:?}", event.state, event.payload);
/// })?;
///
/// for _ in 0..10 {
///     event_loop.run_iterate(Duration::from_millis(100))?;
/// }
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct UdpConnectionManager {
    name: String,
    event_loop: Rc<EventLoop>,
    me: Weak<UdpConnectionManager>,
    inner: RefCell<Inner>,
}

impl UdpConnectionManager {
    /// Creates a manager in the `Stopped` state, bound to the given loop.
    pub fn new(name: impl Into<String>, event_loop: Rc<EventLoop>) -> Rc<Self> {
        Rc::new_cyclic(|me| Self {
            name: name.into(),
            event_loop,
            me: me.clone(),
            inner: RefCell::new(Inner {
                state: ManagerState::Stopped,
                registry: Registry::default(),
                rx_buffer: Vec::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Protocol tag of this manager.
    pub fn protocol(&self) -> &'static str {
        "udp"
    }

    pub fn state(&self) -> ManagerState {
        self.inner.borrow().state
    }

    /// Number of currently registered endpoints.
    pub fn connection_count(&self) -> usize {
        self.inner.borrow().registry.len()
    }

    /// Starts the manager: validates the `recv-bufsize` parameter,
    /// allocates the receive buffer, and transitions to `Started`.
    ///
    /// Fails without changing state if the manager is not `Stopped` or the
    /// parameters do not validate.
    pub fn start(&self, params: &ParamMap) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.state != ManagerState::Stopped {
            error!(
                "To start the connection manager '{}' it must not already be started",
                self.name
            );
            return Err(Error::Internal(
                "The connection manager is already started".into(),
            ));
        }
        let cfg = ManagerConfig::from_params(params)?;
        inner.rx_buffer = vec![0; cfg.recv_bufsize];
        inner.state = ManagerState::Started;
        debug!(
            "Connection manager '{}' started (receive buffer {} bytes)",
            self.name, cfg.recv_bufsize
        );
        Ok(())
    }

    /// Opens one or more endpoints described by `params` and binds them to
    /// `callback`.
    ///
    /// With `listen = true` a bound socket is created per resolved address
    /// (per entry of the `address` array, or for the wildcard addresses
    /// when no address is configured). Otherwise a single send endpoint
    /// with a cached destination is created. Each new endpoint announces
    /// itself with a synchronous `Established` notification; with
    /// `validate = true` all checks run but nothing is registered and no
    /// notification is emitted.
    pub fn open_connection(
        &self,
        params: &ParamMap,
        callback: impl FnMut(&UdpConnectionManager, ConnectionId, &ConnectionEvent<'_>) + 'static,
    ) -> Result<()> {
        if self.inner.borrow().state != ManagerState::Started {
            error!("Cannot open a connection for a connection manager that is not started");
            return Err(Error::Internal(
                "The connection manager is not started".into(),
            ));
        }

        let cfg = OpenConfig::from_params(params)?;
        let callback: SharedCallback = Rc::new(RefCell::new(Box::new(callback)));
        if cfg.listen {
            self.open_listen(&cfg, &callback)
        } else {
            self.open_send(&cfg, &callback)
        }
    }

    /// Sends a datagram on a send endpoint, consuming the buffer.
    ///
    /// Transient failures (`EAGAIN`/`EWOULDBLOCK`/`EINTR`) are waited out
    /// with bounded writability polls and retried until the datagram is
    /// fully handed to the OS. Any other failure shuts the endpoint down
    /// and returns [`Error::Closed`]; the endpoint then reports `Closing`
    /// on the next loop iteration.
    pub fn send(&self, id: ConnectionId, buf: Vec<u8>) -> Result<()> {
        let inner = self.inner.borrow();
        let Some(endpoint) = inner.registry.get(id) else {
            return Err(Error::Internal(format!(
                "Connection {id} is not registered"
            )));
        };
        let Some(dest) = endpoint.dest else {
            return Err(Error::Internal(format!(
                "Connection {id} is not an outgoing endpoint"
            )));
        };
        let fd = endpoint.socket.as_raw_fd();

        // The full datagram may need several calls to hand over. An empty
        // buffer still produces one (empty) datagram.
        let mut written = 0;
        loop {
            debug!("Attempting to send on connection {}", id);
            match endpoint.socket.send_to(&buf[written..], dest) {
                Ok(n) => {
                    written += n;
                    if written >= buf.len() {
                        break;
                    }
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                    // Wait for socket resources to become available, then
                    // retry. The manager stays claimed: nothing else makes
                    // progress until this send resolves.
                    loop {
                        match eventloop::wait_writable(fd, SEND_POLL_TIMEOUT) {
                            Ok(true) => break,
                            Ok(false) => {}
                            Err(pe) if pe.kind() == ErrorKind::Interrupted => {}
                            Err(pe) => {
                                error!("Send on connection {} failed: {:?}", id, pe);
                                drop(inner);
                                let _ = self.shutdown_connection(id);
                                return Err(Error::Closed);
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("Send on connection {} failed: {:?}", id, e);
                    drop(inner);
                    let _ = self.shutdown_connection(id);
                    return Err(Error::Closed);
                }
            }
        }
        Ok(())
    }

    /// Initiates teardown of one endpoint. Idempotent: repeated calls while
    /// the close is pending are no-ops.
    ///
    /// The socket is shut down immediately (unblocking any poll wait on
    /// it), but deregistration, the `Closing` notification, and the actual
    /// close run from a deferred callback on the next loop iteration, when
    /// the descriptor can no longer be referenced further up the call
    /// stack.
    pub fn shutdown_connection(&self, id: ConnectionId) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let Some(endpoint) = inner.registry.get_mut(id) else {
            warn!("Cannot close connection {} - not found", id);
            return Err(Error::NotFound(id));
        };
        if endpoint.close_pending {
            info!("Connection {} is already closing", id);
            return Ok(());
        }

        let _ = SockRef::from(&endpoint.socket).shutdown(Shutdown::Both);
        endpoint.close_pending = true;
        debug!("Shutdown called on connection {}", id);
        drop(inner);

        if let Some(manager) = self.me.upgrade() {
            self.event_loop.defer(Box::new(move || {
                debug!("Delayed closing of connection {}", id);
                manager.close(id);
            }));
        }
        Ok(())
    }

    /// Stops the manager: no new endpoints are accepted and every
    /// registered endpoint is shut down. The state reaches `Stopped` once
    /// the deferred closes have drained through the loop.
    pub fn stop(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            info!("Shutting down the connection manager '{}'", self.name);
            inner.state = ManagerState::Stopping;
        }

        let ids = self.inner.borrow().registry.ids();
        for id in ids {
            let _ = self.shutdown_connection(id);
        }

        // Also covers the case of stopping with no endpoints at all.
        self.inner.borrow_mut().check_stopped();
    }

    fn open_send(&self, cfg: &OpenConfig, callback: &SharedCallback) -> Result<()> {
        let Some(host) = cfg.send_host() else {
            error!("Opening a connection failed: no destination address configured");
            return Err(Error::Rejected(
                "An outgoing endpoint needs a single destination address".into(),
            ));
        };

        let records = resolve::resolve(Some(host), cfg.port).map_err(|e| {
            warn!("Lookup of {} on port {} failed: {:?}", host, cfg.port, e);
            Error::Rejected(format!("Lookup of {host} failed"))
        })?;
        // The first record resolved for the destination is used.
        let dest = records.first().copied().ok_or_else(|| {
            Error::Rejected(format!("Lookup of {host} returned no address"))
        })?;
        debug!("Open a connection to \"{}\" on port {}", host, cfg.port);

        let socket = Socket::new(domain_of(&dest), Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| {
                warn!("Could not create socket to connect to {} ({:?})", host, e);
                Error::Disconnect(e)
            })?;
        config::configure(&socket, &cfg.options, dest.is_ipv6()).map_err(|e| {
            warn!("Could not set socket options: {:?}", e);
            Error::Rejected("Socket configuration failed".into())
        })?;

        if let Some(family) = resolve::multicast_family(&dest) {
            multicast::set_egress(&socket, &dest, family, cfg.interface.as_deref()).map_err(
                |e| {
                    error!("Cannot set socket for multicast sending: {:?}", e);
                    Error::Rejected("Multicast egress configuration failed".into())
                },
            )?;
        }

        if cfg.validate {
            info!(
                "Connection validated to \"{}\" on port {}",
                host, cfg.port
            );
            return Ok(());
        }

        let socket: UdpSocket = socket.into();
        let id = socket.as_raw_fd() as ConnectionId;
        self.inner.borrow_mut().registry.insert(
            id,
            Endpoint {
                socket,
                role: Role::Send,
                dest: Some(dest),
                callback: Rc::clone(callback),
                close_pending: false,
            },
        );
        info!(
            "New connection {} to \"{}\" on port {}",
            id, host, cfg.port
        );

        // Announce the connection. The manager is not borrowed here, so the
        // application may immediately send on it.
        self.dispatch_lifecycle(id, callback, ConnectionState::Established, None);
        Ok(())
    }

    fn open_listen(&self, cfg: &OpenConfig, callback: &SharedCallback) -> Result<()> {
        if cfg.addresses.is_empty() {
            return self.open_listen_host(None, cfg, callback);
        }
        // Entries are processed in order; the first failure aborts and
        // already-opened sockets stay registered.
        for host in &cfg.addresses {
            self.open_listen_host(Some(host), cfg, callback)?;
        }
        Ok(())
    }

    fn open_listen_host(
        &self,
        host: Option<&str>,
        cfg: &OpenConfig,
        callback: &SharedCallback,
    ) -> Result<()> {
        let records = resolve::resolve(host, cfg.port).map_err(|e| {
            warn!(
                "Lookup for \"{}\" on port {} failed: {:?}",
                host.unwrap_or("*"),
                cfg.port,
                e
            );
            Error::Rejected(format!("Lookup of {} failed", host.unwrap_or("*")))
        })?;
        for record in records {
            self.open_listen_socket(record, cfg, callback)?;
        }
        Ok(())
    }

    fn open_listen_socket(
        &self,
        addr: SocketAddr,
        cfg: &OpenConfig,
        callback: &SharedCallback,
    ) -> Result<()> {
        let host_text = addr.ip().to_string();

        let socket = Socket::new(domain_of(&addr), Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| {
                warn!(
                    "Error opening the listen socket for \"{}\" on port {} ({:?})",
                    host_text, cfg.port, e
                );
                Error::Rejected("Could not create the listen socket".into())
            })?;
        config::configure(&socket, &cfg.options, addr.is_ipv6()).map_err(|e| {
            warn!("Could not set socket options: {:?}", e);
            Error::Rejected("Socket configuration failed".into())
        })?;

        let mc = resolve::multicast_family(&addr);

        socket.bind(&addr.into()).map_err(|e| {
            warn!(
                "Error binding the socket to {} ({:?}), closing",
                addr, e
            );
            Error::Rejected(format!("Could not bind to {addr}"))
        })?;

        // With dynamic porting, read back the port the OS assigned.
        let mut port = cfg.port;
        if port == 0 {
            port = socket
                .local_addr()
                .ok()
                .and_then(|a| a.as_socket())
                .map_or(0, |a| a.port());
        }
        info!(
            "New listen socket for \"{}\" on port {}",
            host_text, port
        );

        if let Some(family) = mc {
            multicast::join_group(&socket, &addr, family, cfg.interface.as_deref()).map_err(
                |e| {
                    error!("Cannot set socket for multicast receiving: {:?}", e);
                    Error::Rejected("Multicast membership configuration failed".into())
                },
            )?;
        }

        // Validation is complete; the socket closes on drop.
        if cfg.validate {
            return Ok(());
        }

        let socket: UdpSocket = socket.into();
        let fd = socket.as_raw_fd();
        let id = fd as ConnectionId;

        let handler: Weak<dyn FdEventHandler> = self.me.clone();
        self.event_loop.register_readable(fd, handler).map_err(|e| {
            warn!("Error registering socket {}, closing: {:?}", id, e);
            Error::Rejected("Could not register the socket with the event loop".into())
        })?;

        self.inner.borrow_mut().registry.insert(
            id,
            Endpoint {
                socket,
                role: Role::Listen,
                dest: None,
                callback: Rc::clone(callback),
                close_pending: false,
            },
        );

        self.dispatch_lifecycle(id, callback, ConnectionState::Established, Some(port));
        Ok(())
    }

    /// Runs an application callback for a lifecycle transition. Must be
    /// called with the manager's cell released.
    fn dispatch_lifecycle(
        &self,
        id: ConnectionId,
        callback: &SharedCallback,
        state: ConnectionState,
        local_port: Option<u16>,
    ) {
        let event = ConnectionEvent::lifecycle(state, local_port);
        (callback.borrow_mut())(self, id, &event);
    }

    /// Handles poll activity on a listen socket: an error indication closes
    /// the endpoint, otherwise pending datagrams are received and
    /// dispatched one at a time until the socket is drained.
    fn connection_activity(&self, id: ConnectionId, event: FdEvent) {
        debug!("Activity on connection {}", id);

        if event == FdEvent::Error {
            debug!("Socket {} signaled an error condition", id);
            self.close(id);
            return;
        }

        loop {
            let mut borrow = self.inner.borrow_mut();
            let inner = &mut *borrow;
            let Some(endpoint) = inner.registry.get(id) else {
                return;
            };

            match endpoint.socket.recv_from(&mut inner.rx_buffer) {
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) => {
                    debug!("recv signaled the socket was shut down ({:?})", e);
                    drop(borrow);
                    self.close(id);
                    return;
                }
                Ok((0, _)) => {
                    // A zero-length read on a datagram socket is the
                    // orderly-shutdown signal, not an empty datagram.
                    debug!("recv signaled the socket was shut down");
                    drop(borrow);
                    self.close(id);
                    return;
                }
                Ok((n, source_addr)) => {
                    // Move the receive buffer out for the duration of the
                    // dispatch so the callback can re-enter the manager.
                    let payload_buffer = std::mem::take(&mut inner.rx_buffer);
                    let callback = Rc::clone(&endpoint.callback);
                    drop(borrow);

                    let source = DatagramSource {
                        address: source_addr.ip().to_string(),
                        port: source_addr.port(),
                    };
                    debug!(
                        "Received message of size {} on connection {} from {} on port {}",
                        n, id, source.address, source.port
                    );
                    let event = ConnectionEvent {
                        state: ConnectionState::Established,
                        remote: Some(&source),
                        local_port: None,
                        payload: &payload_buffer[..n],
                    };
                    (callback.borrow_mut())(self, id, &event);

                    self.inner.borrow_mut().rx_buffer = payload_buffer;
                }
            }
        }
    }

    /// Finalises teardown of one endpoint: deregisters it, removes it from
    /// the registry, announces `Closing`, and closes the socket. Runs from
    /// the deferred close or directly from the receive path.
    fn close(&self, id: ConnectionId) {
        let mut inner = self.inner.borrow_mut();
        let Some(endpoint) = inner.registry.remove(id) else {
            return;
        };
        debug!("Closing connection {}", id);

        if endpoint.listens() {
            if let Err(e) = self.event_loop.deregister(endpoint.socket.as_raw_fd()) {
                warn!("Could not deregister socket {}: {:?}", id, e);
            }
        }
        drop(inner);

        let callback = Rc::clone(&endpoint.callback);
        let event = ConnectionEvent::lifecycle(ConnectionState::Closing, None);
        (callback.borrow_mut())(self, id, &event);

        drop(endpoint);
        info!("Socket {} closed", id);

        self.inner.borrow_mut().check_stopped();
    }
}

impl FdEventHandler for UdpConnectionManager {
    fn fd_event(&self, id: ConnectionId, event: FdEvent) {
        self.connection_activity(id, event);
    }
}

fn domain_of(addr: &SocketAddr) -> Domain {
    match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    }
}
