//! An event-driven connection manager for UDP.
//!
//! This library's purpose is to run many UDP endpoints — unicast listeners,
//! multicast group members, and plain senders — on one single-threaded
//! cooperative poll loop. A [`UdpConnectionManager`] owns the sockets and
//! their lifecycle; the application supplies a callback per open call and
//! receives datagrams, source metadata, and lifecycle transitions through
//! it. Teardown is deferred onto the loop so a socket is never closed while
//! it may still be referenced further up the call stack.
//!
//! # Example
//! Log every incoming datagram and where it came from:
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use udpmux::{EventLoop, ParamMap, UdpConnectionManager};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let event_loop = EventLoop::new()?;
//!     let manager = UdpConnectionManager::new("echo", event_loop.clone());
//!     manager.start(&ParamMap::new())?;
//!
//!     let params = ParamMap::new()
//!         .with("listen", true)
//!         .with("port", 7777u16);
//!     manager.open_connection(&params, |_manager, id, event| {
//!         if let Some(source) = event.remote {
//!             println!(
//!                 "connection {id}: {} bytes from {}:{}",
//!                 event.payload.len(),
//!                 source.address,
//!                 source.port
//!             );
//!         }
//!     })?;
//!
//!     loop {
//!         event_loop.run_iterate(Duration::from_millis(100))?;
//!     }
//! }
//! ```
mod endpoint;
mod error;
mod eventloop;
mod manager;
mod net;
mod params;

pub use endpoint::{ConnectionCallback, ConnectionId};
pub use error::{Error, Result};
pub use eventloop::EventLoop;
pub use manager::{
    ConnectionEvent, ConnectionState, DatagramSource, ManagerState, UdpConnectionManager,
};
pub use params::{ParamMap, ParamValue};
