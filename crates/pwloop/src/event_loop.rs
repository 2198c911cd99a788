//! Single-threaded cooperative event loop.
//!
//! Sources (signals, timers, file descriptors, daemon event listeners) are
//! tasks on a tokio `LocalSet` driven by a current-thread runtime, so every
//! handler runs on the thread that calls [`EventLoop::run`]. The only state
//! shared with other threads is the [`LoopHandle`]: an atomic quit flag and
//! the sender side of the daemon event queue.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::unix::AsyncFd;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, LocalSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::daemon::DaemonEvent;
use crate::error::{LoopbackError, Result};

/// How often `run` re-checks the quit flag when nothing else wakes it.
const QUIT_POLL: Duration = Duration::from_millis(10);

/// Identifies a registered source for [`EventLoop::remove_source`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u64);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source#{}", self.0)
    }
}

/// Thread-safe handle for stopping the loop and posting daemon events.
#[derive(Clone)]
pub struct LoopHandle {
    quit: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<DaemonEvent>,
}

impl LoopHandle {
    /// Ask `run` to return. A single atomic store; safe from signal
    /// handlers and the realtime thread.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
    }

    pub fn is_quit(&self) -> bool {
        self.quit.load(Ordering::Acquire)
    }

    /// Queue a daemon event for dispatch on the loop thread. Returns false
    /// once the loop is gone.
    pub fn post(&self, event: DaemonEvent) -> bool {
        self.events.send(event).is_ok()
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("quit", &self.is_quit())
            .finish()
    }
}

type Listener = Rc<RefCell<Box<dyn FnMut(&DaemonEvent)>>>;

enum Source {
    Task(JoinHandle<()>),
    Listener,
}

pub struct EventLoop {
    // Dropped before the runtime so source tasks release their registrations first.
    local: LocalSet,
    runtime: tokio::runtime::Runtime,
    handle: LoopHandle,
    events: RefCell<Option<mpsc::UnboundedReceiver<DaemonEvent>>>,
    listeners: RefCell<Vec<(SourceId, Listener)>>,
    sources: RefCell<HashMap<SourceId, Source>>,
    next_id: Cell<u64>,
    running: Cell<bool>,
}

impl EventLoop {
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (tx, rx) = mpsc::unbounded_channel();

        Ok(Self {
            local: LocalSet::new(),
            runtime,
            handle: LoopHandle {
                quit: Arc::new(AtomicBool::new(false)),
                events: tx,
            },
            events: RefCell::new(Some(rx)),
            listeners: RefCell::new(Vec::new()),
            sources: RefCell::new(HashMap::new()),
            next_id: Cell::new(1),
            running: Cell::new(false),
        })
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    /// Call `handler` on the loop thread each time `signum` is raised.
    ///
    /// Deliveries that arrive before `run` are held until it starts.
    pub fn add_signal<F>(&self, signum: i32, mut handler: F) -> Result<SourceId>
    where
        F: FnMut(i32) + 'static,
    {
        let mut stream = {
            let _guard = self.runtime.enter();
            signal(SignalKind::from_raw(signum))?
        };
        let id = self.spawn(async move {
            while stream.recv().await.is_some() {
                handler(signum);
            }
        });
        debug!(signal = signum, %id, "signal source added");
        Ok(id)
    }

    /// Call `handler` every `period`, first after one period has elapsed.
    pub fn add_timer<F>(&self, period: Duration, mut handler: F) -> SourceId
    where
        F: FnMut() + 'static,
    {
        let id = self.spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                handler();
            }
        });
        trace!(?period, %id, "timer source added");
        id
    }

    /// Call `handler` whenever `fd` becomes readable. The handler is expected
    /// to drain the descriptor. The loop owns `fd` and closes it when the
    /// source is removed.
    pub fn add_io<F>(&self, fd: OwnedFd, mut handler: F) -> Result<SourceId>
    where
        F: FnMut(RawFd) + 'static,
    {
        let raw = fd.as_raw_fd();
        let watched = {
            let _guard = self.runtime.enter();
            // SAFETY: `fd` is owned by the AsyncFd and stays open until it drops.
            unsafe { AsyncFd::register(fd) }.map_err(|e| e.into_parts().1)?
        };
        let id = self.spawn(async move {
            loop {
                let Ok(mut guard) = watched.readable().await else {
                    break;
                };
                handler(raw);
                guard.clear_ready();
            }
        });
        debug!(fd = raw, %id, "io source added");
        Ok(id)
    }

    /// Receive every [`DaemonEvent`] dispatched by `run`, in arrival order.
    pub fn add_event_listener<F>(&self, listener: F) -> SourceId
    where
        F: FnMut(&DaemonEvent) + 'static,
    {
        let id = self.next_source_id();
        self.listeners
            .borrow_mut()
            .push((id, Rc::new(RefCell::new(Box::new(listener)))));
        self.sources.borrow_mut().insert(id, Source::Listener);
        id
    }

    /// Unregister a source. Returns false if it was already gone.
    pub fn remove_source(&self, id: SourceId) -> bool {
        match self.sources.borrow_mut().remove(&id) {
            Some(Source::Task(task)) => {
                task.abort();
                true
            }
            Some(Source::Listener) => {
                self.listeners.borrow_mut().retain(|(lid, _)| *lid != id);
                true
            }
            None => false,
        }
    }

    /// Dispatch sources until [`LoopHandle::quit`] is called.
    ///
    /// A quit requested before `run` makes it return immediately. The flag is
    /// cleared on return so the loop can be run again.
    pub fn run(&self) -> Result<()> {
        if self.running.replace(true) {
            return Err(LoopbackError::Busy);
        }
        let Some(mut rx) = self.events.borrow_mut().take() else {
            self.running.set(false);
            return Err(LoopbackError::Busy);
        };

        debug!("event loop running");
        self.local.block_on(&self.runtime, async {
            let mut poll = tokio::time::interval(QUIT_POLL);
            poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
            while !self.handle.is_quit() {
                tokio::select! {
                    Some(event) = rx.recv() => self.dispatch(&event),
                    _ = poll.tick() => {}
                }
            }
        });
        debug!("event loop stopped");

        *self.events.borrow_mut() = Some(rx);
        self.handle.quit.store(false, Ordering::Release);
        self.running.set(false);
        Ok(())
    }

    /// Dispatch already-queued daemon events without running other sources.
    pub fn dispatch_pending(&self) -> Result<usize> {
        if self.running.get() {
            return Err(LoopbackError::Busy);
        }
        let Some(mut rx) = self.events.borrow_mut().take() else {
            return Err(LoopbackError::Busy);
        };
        let mut dispatched = 0;
        while let Ok(event) = rx.try_recv() {
            self.dispatch(&event);
            dispatched += 1;
        }
        *self.events.borrow_mut() = Some(rx);
        Ok(dispatched)
    }

    fn dispatch(&self, event: &DaemonEvent) {
        trace!(?event, "dispatch");
        // Snapshot so listeners may add or remove sources while running.
        let listeners: Vec<Listener> = self
            .listeners
            .borrow()
            .iter()
            .map(|(_, l)| Rc::clone(l))
            .collect();
        for listener in listeners {
            if let Ok(mut callback) = listener.try_borrow_mut() {
                callback(event);
            }
        }
    }

    fn spawn<F>(&self, task: F) -> SourceId
    where
        F: std::future::Future<Output = ()> + 'static,
    {
        let id = self.next_source_id();
        let handle = self.local.spawn_local(task);
        self.sources.borrow_mut().insert(id, Source::Task(handle));
        id
    }

    fn next_source_id(&self) -> SourceId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        SourceId(id)
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        for (_, source) in self.sources.get_mut().drain() {
            if let Source::Task(task) = source {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::StreamId;
    use std::os::fd::FromRawFd;

    #[test]
    fn test_quit_from_timer() {
        let lp = EventLoop::new().unwrap();
        let handle = lp.handle();
        let fired = Rc::new(Cell::new(0));
        let counter = Rc::clone(&fired);
        lp.add_timer(Duration::from_millis(1), move || {
            counter.set(counter.get() + 1);
            if counter.get() == 3 {
                handle.quit();
            }
        });

        lp.run().unwrap();
        assert_eq!(fired.get(), 3);
        assert!(!lp.handle().is_quit());
    }

    #[test]
    fn test_quit_before_run_returns_immediately() {
        let lp = EventLoop::new().unwrap();
        lp.handle().quit();
        lp.run().unwrap();
    }

    #[test]
    fn test_reentrant_run_is_busy() {
        let lp = Rc::new(EventLoop::new().unwrap());
        let inner = Rc::clone(&lp);
        let outcome = Rc::new(RefCell::new(None));
        let seen = Rc::clone(&outcome);
        lp.add_timer(Duration::from_millis(1), move || {
            if seen.borrow().is_none() {
                *seen.borrow_mut() = Some(inner.run().map_err(|e| e.kind()));
            }
            inner.handle().quit();
        });

        lp.run().unwrap();
        assert_eq!(
            *outcome.borrow(),
            Some(Err(crate::error::ErrorKind::Busy))
        );
    }

    #[test]
    fn test_events_reach_listeners_in_order() {
        let lp = EventLoop::new().unwrap();
        let handle = lp.handle();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let quitter = lp.handle();
        lp.add_event_listener(move |event| {
            if let DaemonEvent::Error { seq, .. } = event {
                sink.borrow_mut().push(*seq);
                if *seq == 2 {
                    quitter.quit();
                }
            }
        });

        for seq in 0..3 {
            assert!(handle.post(DaemonEvent::Error {
                id: 0,
                seq,
                code: -libc::EIO,
                message: "test".into(),
            }));
        }

        lp.run().unwrap();
        assert_eq!(&seen.borrow()[..3], &[0, 1, 2]);
    }

    #[test]
    fn test_dispatch_pending_and_remove_listener() {
        let lp = EventLoop::new().unwrap();
        let count = Rc::new(Cell::new(0));
        let c = Rc::clone(&count);
        let id = lp.add_event_listener(move |_| c.set(c.get() + 1));

        let event = DaemonEvent::FormatChanged {
            id: StreamId(1),
            format: crate::daemon::AudioFormat::planar_f32(2),
        };
        lp.handle().post(event.clone());
        assert_eq!(lp.dispatch_pending().unwrap(), 1);
        assert_eq!(count.get(), 1);

        assert!(lp.remove_source(id));
        assert!(!lp.remove_source(id));
        lp.handle().post(event);
        lp.dispatch_pending().unwrap();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_removed_timer_stops_firing() {
        let lp = EventLoop::new().unwrap();
        let fired = Rc::new(Cell::new(0));
        let counter = Rc::clone(&fired);
        let noisy = lp.add_timer(Duration::from_millis(1), move || {
            counter.set(counter.get() + 1);
        });
        assert!(lp.remove_source(noisy));

        let handle = lp.handle();
        lp.add_timer(Duration::from_millis(20), move || handle.quit());
        lp.run().unwrap();
        assert_eq!(fired.get(), 0);
    }

    #[test]
    fn test_io_source_fires_on_readable() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);
        let reader = unsafe { OwnedFd::from_raw_fd(read_fd) };

        let lp = EventLoop::new().unwrap();
        let handle = lp.handle();
        let got = Rc::new(Cell::new(0u8));
        let sink = Rc::clone(&got);
        lp.add_io(reader, move |fd| {
            let mut byte = 0u8;
            let n = unsafe { libc::read(fd, (&mut byte as *mut u8).cast(), 1) };
            if n == 1 {
                sink.set(byte);
                handle.quit();
            }
        })
        .unwrap();

        let byte = 42u8;
        assert_eq!(
            unsafe { libc::write(write_fd, (&byte as *const u8).cast(), 1) },
            1
        );
        lp.run().unwrap();
        assert_eq!(got.get(), 42);

        // The loop owns and closes the read end.
        drop(lp);
        unsafe {
            libc::close(write_fd);
        }
    }
}
