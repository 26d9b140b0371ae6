use std::{
    cell::RefCell,
    collections::BTreeMap,
    net::{SocketAddr, UdpSocket},
    rc::Rc,
};

use crate::manager::{ConnectionEvent, UdpConnectionManager};

/// Identifies a registered endpoint within its manager.
///
/// The id is the raw file descriptor value of the endpoint's socket, which
/// is unique for as long as the endpoint is registered.
pub type ConnectionId = usize;

/// The callback an application registers per `open_connection` call.
///
/// All endpoints created by one open call share one callback; the manager
/// borrow is released while it runs, so the callback may re-enter the
/// manager (send, shutdown, open).
pub type ConnectionCallback =
    Box<dyn FnMut(&UdpConnectionManager, ConnectionId, &ConnectionEvent<'_>)>;

pub(crate) type SharedCallback = Rc<RefCell<ConnectionCallback>>;

/// Whether an endpoint receives datagrams or transmits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// Bound to a local address, registered readable with the poll loop.
    Listen,
    /// Holds a cached destination, requests no events.
    Send,
}

/// A registered UDP socket plus its application binding.
pub(crate) struct Endpoint {
    pub(crate) socket: UdpSocket,
    pub(crate) role: Role,
    /// Cached destination, present for the send role only.
    pub(crate) dest: Option<SocketAddr>,
    pub(crate) callback: SharedCallback,
    /// Set once a close has been deferred; further shutdowns are no-ops.
    pub(crate) close_pending: bool,
}

impl Endpoint {
    pub(crate) fn listens(&self) -> bool {
        self.role == Role::Listen
    }
}

/// Ordered map from connection id (fd) to endpoint.
#[derive(Default)]
pub(crate) struct Registry {
    map: BTreeMap<ConnectionId, Endpoint>,
}

impl Registry {
    pub(crate) fn insert(&mut self, id: ConnectionId, endpoint: Endpoint) {
        let previous = self.map.insert(id, endpoint);
        debug_assert!(previous.is_none(), "connection id {id} registered twice");
    }

    pub(crate) fn remove(&mut self, id: ConnectionId) -> Option<Endpoint> {
        self.map.remove(&id)
    }

    pub(crate) fn get(&self, id: ConnectionId) -> Option<&Endpoint> {
        self.map.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Endpoint> {
        self.map.get_mut(&id)
    }

    /// Snapshot of the registered ids in ascending order.
    pub(crate) fn ids(&self) -> Vec<ConnectionId> {
        self.map.keys().copied().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint {
            socket: UdpSocket::bind("127.0.0.1:0").expect("loopback socket"),
            role: Role::Listen,
            dest: None,
            callback: Rc::new(RefCell::new(Box::new(|_, _, _| {}))),
            close_pending: false,
        }
    }

    #[test]
    fn ids_are_ordered() {
        let mut registry = Registry::default();
        registry.insert(9, endpoint());
        registry.insert(3, endpoint());
        registry.insert(7, endpoint());
        assert_eq!(registry.ids(), vec![3, 7, 9]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn remove_returns_the_endpoint() {
        let mut registry = Registry::default();
        registry.insert(5, endpoint());
        assert!(registry.get(5).is_some());
        let removed = registry.remove(5);
        assert!(removed.is_some());
        assert!(registry.is_empty());
        assert!(registry.remove(5).is_none());
    }
}
