use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::{
    cell::RefCell,
    collections::HashMap,
    io::{ErrorKind, Result},
    os::fd::RawFd,
    rc::{Rc, Weak},
    time::Duration,
};
use tracing::debug;

use crate::endpoint::ConnectionId;

/// What a polled file descriptor reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FdEvent {
    Readable,
    Error,
}

/// Receives the events of file descriptors registered with an [`EventLoop`].
///
/// Handlers are held weakly; a handler that has been dropped is silently
/// skipped during dispatch.
pub(crate) trait FdEventHandler {
    fn fd_event(&self, id: ConnectionId, event: FdEvent);
}

/// A single-threaded cooperative poll loop.
///
/// The loop owns the OS readiness queue and a deferred-callback queue.
/// Each [`run_iterate`](EventLoop::run_iterate) call polls once, dispatches
/// the ready file descriptors to their handlers, and then runs the deferred
/// callbacks that were queued before the drain started. Deferred callbacks
/// are how resource teardown is pushed past the current call stack: a
/// socket scheduled for close stays valid until the iteration that
/// scheduled it has finished.
///
/// `run_iterate` must not be called from inside a dispatched callback.
pub struct EventLoop {
    poll: RefCell<Poll>,
    handlers: RefCell<HashMap<Token, Weak<dyn FdEventHandler>>>,
    deferred: RefCell<Vec<Box<dyn FnOnce()>>>,
}

impl EventLoop {
    pub fn new() -> Result<Rc<Self>> {
        Ok(Rc::new(Self {
            poll: RefCell::new(Poll::new()?),
            handlers: RefCell::new(HashMap::new()),
            deferred: RefCell::new(Vec::new()),
        }))
    }

    /// Registers a file descriptor for readable events. The token under
    /// which events are delivered is the fd value itself.
    pub(crate) fn register_readable(
        &self,
        fd: RawFd,
        handler: Weak<dyn FdEventHandler>,
    ) -> Result<()> {
        let token = Token(fd as usize);
        self.poll
            .borrow()
            .registry()
            .register(&mut SourceFd(&fd), token, Interest::READABLE)?;
        self.handlers.borrow_mut().insert(token, handler);
        Ok(())
    }

    /// Removes a file descriptor from the readiness queue.
    pub(crate) fn deregister(&self, fd: RawFd) -> Result<()> {
        self.handlers.borrow_mut().remove(&Token(fd as usize));
        self.poll.borrow().registry().deregister(&mut SourceFd(&fd))
    }

    /// Queues a callback for the end of the next loop iteration.
    ///
    /// Callbacks queued while the queue is being drained run one iteration
    /// later.
    pub(crate) fn defer(&self, callback: Box<dyn FnOnce()>) {
        self.deferred.borrow_mut().push(callback);
    }

    /// Runs one loop iteration: poll with the given timeout, dispatch, then
    /// drain the deferred-callback queue.
    pub fn run_iterate(&self, timeout: Duration) -> Result<()> {
        let mut events = Events::with_capacity(64);
        match self.poll.borrow_mut().poll(&mut events, Some(timeout)) {
            Ok(()) => {}
            // An interrupted poll is an empty iteration.
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }

        let ready: Vec<(Token, FdEvent)> = events
            .iter()
            .map(|event| {
                let kind = if event.is_error() {
                    FdEvent::Error
                } else {
                    FdEvent::Readable
                };
                (event.token(), kind)
            })
            .collect();

        for (token, event) in ready {
            let handler = self.handlers.borrow().get(&token).cloned();
            match handler.and_then(|weak| weak.upgrade()) {
                Some(handler) => handler.fd_event(token.0, event),
                None => debug!("Dropping event for unregistered token {}", token.0),
            }
        }

        let queued = std::mem::take(&mut *self.deferred.borrow_mut());
        for callback in queued {
            callback();
        }

        Ok(())
    }
}

/// One-shot poll for writability, used by the send path to wait out
/// transient socket-buffer pressure without giving up the manager.
pub(crate) fn wait_writable(fd: RawFd, timeout: Duration) -> Result<bool> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(1);
    poll.registry()
        .register(&mut SourceFd(&fd), Token(0), Interest::WRITABLE)?;
    poll.poll(&mut events, Some(timeout))?;
    Ok(!events.is_empty())
}
