//! A connection to the daemon, bound to an [`EventLoop`].

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::{debug, error, info, warn};

use crate::daemon::{Connection, Daemon, DaemonEvent, StreamId, CORE_ID};
use crate::error::{LoopbackError, Result};
use crate::event_loop::{EventLoop, LoopHandle};
use crate::properties::{keys, Properties};
use crate::stream::{StreamEvent, StreamShared};

/// An asynchronous error reported by the daemon against an object id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionError {
    pub id: u32,
    pub seq: i32,
    /// Negative errno.
    pub code: i32,
    pub message: String,
}

impl SessionError {
    /// The daemon closed the connection.
    pub fn is_pipe_broken(&self) -> bool {
        self.id == CORE_ID && self.code == -libc::EPIPE
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "error id:{} seq:{} res:{} ({}): {}",
            self.id,
            self.seq,
            self.code,
            std::io::Error::from_raw_os_error(-self.code),
            self.message
        )
    }
}

type ErrorListener = Box<dyn FnMut(&SessionError)>;

struct SessionInner<C: Connection> {
    conn: RefCell<Option<C>>,
    handle: LoopHandle,
    remote: Option<String>,
    error_listeners: RefCell<Vec<ErrorListener>>,
    streams: RefCell<HashMap<StreamId, Weak<StreamShared>>>,
    pipe_broken: Cell<bool>,
}

/// Shared handle on a daemon connection. Clones refer to the same session.
pub struct Session<C: Connection> {
    inner: Rc<SessionInner<C>>,
}

impl<C: Connection> Clone for Session<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<C: Connection> Session<C> {
    /// Handshake with `remote` (or the default instance). Blocks until the
    /// daemon accepts or refuses.
    pub fn connect<D>(event_loop: &EventLoop, daemon: &D, remote: Option<&str>) -> Result<Self>
    where
        D: Daemon<Connection = C>,
    {
        let mut props = Properties::new();
        props.set(keys::REMOTE_NAME, remote);

        let conn = daemon
            .connect(&props.freeze(), event_loop.handle())
            .map_err(|e| match e {
                LoopbackError::ConnectFailed(_) => e,
                other => LoopbackError::ConnectFailed(other.to_string()),
            })?;

        let inner = Rc::new(SessionInner {
            conn: RefCell::new(Some(conn)),
            handle: event_loop.handle(),
            remote: remote.map(str::to_string),
            error_listeners: RefCell::new(Vec::new()),
            streams: RefCell::new(HashMap::new()),
            pipe_broken: Cell::new(false),
        });

        let weak = Rc::downgrade(&inner);
        event_loop.add_event_listener(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.route(event);
            }
        });

        info!(remote = remote.unwrap_or("default"), "connected to daemon");
        Ok(Self { inner })
    }

    /// Receive `(id, seq, code, message)` for every asynchronous error.
    pub fn add_error_listener<F>(&self, listener: F)
    where
        F: FnMut(&SessionError) + 'static,
    {
        self.inner.error_listeners.borrow_mut().push(Box::new(listener));
    }

    /// Register the standard policy: quit the loop when the daemon closes
    /// the connection.
    pub fn quit_on_broken_pipe(&self) {
        let handle = self.inner.handle.clone();
        self.add_error_listener(move |err| {
            if err.is_pipe_broken() {
                handle.quit();
            }
        });
    }

    /// Leave the daemon. Idempotent; every stream of this session becomes
    /// unconnected and unusable.
    pub fn disconnect(&self) -> Result<()> {
        let Some(mut conn) = self.inner.conn.borrow_mut().take() else {
            return Ok(());
        };

        let streams: Vec<Rc<StreamShared>> = self
            .inner
            .streams
            .borrow_mut()
            .drain()
            .filter_map(|(_, s)| s.upgrade())
            .collect();
        for stream in streams {
            stream.invalidate();
        }

        let result = conn.disconnect();
        info!(remote = self.remote().unwrap_or("default"), "disconnected from daemon");
        result
    }

    pub fn is_connected(&self) -> bool {
        self.inner.conn.borrow().is_some()
    }

    /// Whether the daemon has reported the connection closed.
    pub fn is_pipe_broken(&self) -> bool {
        self.inner.pipe_broken.get()
    }

    pub fn remote(&self) -> Option<&str> {
        self.inner.remote.as_deref()
    }

    pub fn loop_handle(&self) -> LoopHandle {
        self.inner.handle.clone()
    }

    pub(crate) fn with_connection<R>(&self, f: impl FnOnce(&mut C) -> Result<R>) -> Result<R> {
        let mut slot = self.inner.conn.borrow_mut();
        let conn = slot.as_mut().ok_or(LoopbackError::Disconnected)?;
        f(conn)
    }

    pub(crate) fn register_stream(&self, id: StreamId, stream: Weak<StreamShared>) {
        self.inner.streams.borrow_mut().insert(id, stream);
    }

    pub(crate) fn unregister_stream(&self, id: StreamId) {
        self.inner.streams.borrow_mut().remove(&id);
    }
}

impl<C: Connection> SessionInner<C> {
    fn route(&self, event: &DaemonEvent) {
        match event {
            DaemonEvent::Error {
                id,
                seq,
                code,
                message,
            } => self.dispatch_error(&SessionError {
                id: *id,
                seq: *seq,
                code: *code,
                message: message.clone(),
            }),
            DaemonEvent::StreamState { id, old, new } => self.deliver(
                *id,
                StreamEvent::StateChanged {
                    old: old.clone(),
                    new: new.clone(),
                },
            ),
            DaemonEvent::FormatChanged { id, format } => {
                self.deliver(*id, StreamEvent::FormatChanged(*format))
            }
        }
    }

    fn deliver(&self, id: StreamId, event: StreamEvent) {
        let stream = self.streams.borrow().get(&id).and_then(Weak::upgrade);
        match stream {
            Some(stream) => stream.handle(event),
            None => debug!(stream = %id, ?event, "event for unknown stream dropped"),
        }
    }

    fn dispatch_error(&self, err: &SessionError) {
        if err.is_pipe_broken() {
            self.pipe_broken.set(true);
            error!("{err}");
        } else {
            warn!("{err}");
        }

        // Listeners may register further listeners; those see the next error.
        let mut listeners = self.error_listeners.take();
        for listener in listeners.iter_mut() {
            listener(err);
        }
        let mut slot = self.error_listeners.borrow_mut();
        listeners.append(&mut slot);
        *slot = listeners;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryDaemon;
    use crate::error::ErrorKind;

    #[test]
    fn test_pipe_broken_classification() {
        let err = SessionError {
            id: CORE_ID,
            seq: 0,
            code: -libc::EPIPE,
            message: "connection closed".into(),
        };
        assert!(err.is_pipe_broken());
        assert!(!SessionError { id: 7, ..err.clone() }.is_pipe_broken());
        assert!(!SessionError {
            code: -libc::EIO,
            ..err
        }
        .is_pipe_broken());
    }

    #[test]
    fn test_connect_to_unknown_remote_fails() {
        let lp = EventLoop::new().unwrap();
        let daemon = MemoryDaemon::new();
        let err = Session::connect(&lp, &daemon, Some("nowhere")).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::ConnectFailed);
    }

    #[test]
    fn test_connect_to_unreachable_daemon_fails() {
        let lp = EventLoop::new().unwrap();
        let daemon = MemoryDaemon::new();
        daemon.set_reachable(false);
        let err = Session::connect(&lp, &daemon, None).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::ConnectFailed);
    }

    #[test]
    fn test_broken_pipe_quits_loop() {
        let lp = EventLoop::new().unwrap();
        let daemon = MemoryDaemon::new();
        let session = Session::connect(&lp, &daemon, None).unwrap();
        session.quit_on_broken_pipe();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        session.add_error_listener(move |err| sink.borrow_mut().push(err.clone()));

        daemon.kill();
        lp.run().unwrap();

        assert!(session.is_pipe_broken());
        assert_eq!(seen.borrow().len(), 1);
        assert!(seen.borrow()[0].is_pipe_broken());
    }

    #[test]
    fn test_other_errors_are_not_fatal() {
        let lp = EventLoop::new().unwrap();
        let daemon = MemoryDaemon::new();
        let session = Session::connect(&lp, &daemon, None).unwrap();
        session.quit_on_broken_pipe();

        lp.handle().post(DaemonEvent::Error {
            id: 3,
            seq: 1,
            code: -libc::ENOENT,
            message: "no such node".into(),
        });
        lp.dispatch_pending().unwrap();
        assert!(!lp.handle().is_quit());
        assert!(!session.is_pipe_broken());
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let lp = EventLoop::new().unwrap();
        let daemon = MemoryDaemon::new();
        let session = Session::connect(&lp, &daemon, Some("pipewire-0")).unwrap();
        assert_eq!(session.remote(), Some("pipewire-0"));
        assert!(session.is_connected());

        session.disconnect().unwrap();
        session.disconnect().unwrap();
        assert!(!session.is_connected());
        assert_eq!(daemon.connection_count(), 0);
    }
}
