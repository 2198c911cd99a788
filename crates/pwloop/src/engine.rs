//! The loopback engine: a grouped capture/playback stream pair bridged by a
//! realtime forwarding callback.
//!
//! ```text
//!  source node ──▶ capture (INPUT) ──┐
//!                                    │  Forwarder::tick (realtime thread)
//!                                    │  descriptor copy, no sample copy
//!  sink node   ◀── playback (OUTPUT) ◀┘
//! ```
//!
//! Both streams carry the same `node.group`, so the daemon schedules them in
//! the same quantum and the capture callback always finds the matching
//! playback slot dequeuable, barring transient underruns.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::daemon::{
    AudioFormat, BufferQueue, Connection, Direction, ProcessHandler, StreamFlags, StreamId,
    StreamState,
};
use crate::error::Result;
use crate::options::StreamPlan;
use crate::session::Session;
use crate::stream::{Stream, StreamEvent};

pub const CAPTURE_STREAM_NAME: &str = "loopback capture";
pub const PLAYBACK_STREAM_NAME: &str = "loopback playback";

/// Flags both streams connect with.
pub const STREAM_FLAGS: StreamFlags = StreamFlags::AUTOCONNECT
    .union(StreamFlags::MAP_BUFFERS)
    .union(StreamFlags::RT_PROCESS);

/// Runtime statistics, updated lock-free by the realtime callback.
#[derive(Debug, Default)]
pub struct LoopStats {
    pub ticks: AtomicU64,
    pub forwarded: AtomicU64,
    /// Ticks with no capture buffer.
    pub underruns: AtomicU64,
    /// Ticks with no playback buffer.
    pub overruns: AtomicU64,
    /// Playback buffers requeued empty.
    pub silent: AtomicU64,
}

impl LoopStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            silent: self.silent.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub ticks: u64,
    pub forwarded: u64,
    pub underruns: u64,
    pub overruns: u64,
    pub silent: u64,
}

/// What one realtime tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Both buffers available; playback aimed at the capture frames.
    Forwarded,
    /// Only capture available; returned unplayed.
    Dropped,
    /// Only playback available; requeued empty.
    Silent,
    /// Neither available.
    Idle,
}

/// The capture stream's `process` callback.
///
/// Never allocates, locks, or blocks. Anomalies bump [`LoopStats`] and emit
/// one warning each.
pub struct Forwarder<Q: BufferQueue> {
    capture: Q,
    playback: Q,
    stats: Arc<LoopStats>,
}

impl<Q: BufferQueue> Forwarder<Q> {
    pub fn new(capture: Q, playback: Q, stats: Arc<LoopStats>) -> Self {
        Self {
            capture,
            playback,
            stats,
        }
    }

    pub fn tick(&mut self) -> TickOutcome {
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);

        let input = self.capture.dequeue();
        if input.is_none() {
            self.stats.underruns.fetch_add(1, Ordering::Relaxed);
            warn!("out of capture buffers");
        }

        let mut output = self.playback.dequeue();
        if output.is_none() {
            self.stats.overruns.fetch_add(1, Ordering::Relaxed);
            warn!("out of playback buffers");
        }

        let outcome = match (&input, &mut output) {
            (Some(input), Some(output)) => {
                Q::forward(input, output);
                self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
                TickOutcome::Forwarded
            }
            (Some(_), None) => TickOutcome::Dropped,
            (None, Some(output)) => {
                Q::silence(output);
                self.stats.silent.fetch_add(1, Ordering::Relaxed);
                TickOutcome::Silent
            }
            (None, None) => TickOutcome::Idle,
        };

        if let Some(input) = input {
            self.capture.queue(input);
        }
        if let Some(output) = output {
            self.playback.queue(output);
        }
        outcome
    }
}

impl<Q: BufferQueue> ProcessHandler for Forwarder<Q> {
    fn process(&mut self) {
        self.tick();
    }
}

struct EngineInner<C: Connection> {
    session: Session<C>,
    plan: StreamPlan,
    capture: Option<Stream<C>>,
    playback: Option<Stream<C>>,
    /// Formats the daemon reported for the current generation.
    negotiated: [Option<AudioFormat>; 2],
    stats: Arc<LoopStats>,
    generation: u64,
    this: Weak<RefCell<EngineInner<C>>>,
}

/// Owns the stream pair; lives on the loop thread.
pub struct LoopbackEngine<C: Connection> {
    inner: Rc<RefCell<EngineInner<C>>>,
}

impl<C: Connection> LoopbackEngine<C> {
    /// Create both streams from `plan` and connect them, capture first.
    pub fn start(session: &Session<C>, plan: StreamPlan) -> Result<Self> {
        let inner = Rc::new_cyclic(|this| {
            RefCell::new(EngineInner {
                session: session.clone(),
                plan,
                capture: None,
                playback: None,
                negotiated: [None, None],
                stats: Arc::new(LoopStats::default()),
                generation: 0,
                this: this.clone(),
            })
        });
        inner.borrow_mut().build()?;
        Ok(Self { inner })
    }

    /// Tear both streams down and rebuild them with `rate` pinned (or left
    /// to the daemon when `None`).
    pub fn reconfigure(&self, rate: Option<u32>) -> Result<()> {
        self.inner.borrow_mut().reconfigure(rate)
    }

    /// Disconnect and destroy both streams. Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let result = inner.teardown();
        info!(stats = ?inner.stats.snapshot(), "loopback stopped");
        result
    }

    pub fn stats(&self) -> Arc<LoopStats> {
        Arc::clone(&self.inner.borrow().stats)
    }

    /// Number of times the stream pair has been built.
    pub fn generation(&self) -> u64 {
        self.inner.borrow().generation
    }

    pub fn is_running(&self) -> bool {
        let inner = self.inner.borrow();
        inner.capture.is_some() && inner.playback.is_some()
    }

    pub fn plan(&self) -> StreamPlan {
        self.inner.borrow().plan.clone()
    }

    pub fn stream_id(&self, direction: Direction) -> Option<StreamId> {
        self.inner
            .borrow()
            .stream(direction)
            .map(|stream| stream.id())
    }

    pub fn stream_state(&self, direction: Direction) -> Option<StreamState> {
        self.inner
            .borrow()
            .stream(direction)
            .map(|stream| stream.state())
    }

    pub fn negotiated_format(&self, direction: Direction) -> Option<AudioFormat> {
        self.inner.borrow().negotiated[slot(direction)]
    }
}

impl<C: Connection> EngineInner<C> {
    fn stream(&self, direction: Direction) -> Option<&Stream<C>> {
        match direction {
            Direction::Input => self.capture.as_ref(),
            Direction::Output => self.playback.as_ref(),
        }
    }

    fn build(&mut self) -> Result<()> {
        let capture = Stream::new(&self.session, CAPTURE_STREAM_NAME, self.plan.capture.clone())?;
        let playback =
            Stream::new(&self.session, PLAYBACK_STREAM_NAME, self.plan.playback.clone())?;
        self.watch(&capture);
        self.watch(&playback);

        let forwarder = Forwarder::new(
            capture.buffer_queue()?,
            playback.buffer_queue()?,
            Arc::clone(&self.stats),
        );
        capture.connect(STREAM_FLAGS, Some(Box::new(forwarder)))?;
        if let Err(e) = playback.connect(STREAM_FLAGS, None) {
            // The capture callback holds the playback queue; release it first.
            drop(capture);
            return Err(e);
        }

        self.generation += 1;
        self.negotiated = [None, None];
        info!(
            generation = self.generation,
            group = self.plan.capture.group.as_deref().unwrap_or("none"),
            channels = self.plan.capture.format.channels,
            positions = %self.plan.capture.channel_map,
            "loopback streams connected"
        );
        self.capture = Some(capture);
        self.playback = Some(playback);
        Ok(())
    }

    fn watch(&self, stream: &Stream<C>) {
        let engine = self.this.clone();
        let direction = stream.direction();
        let id = stream.id();
        stream.add_listener(move |event| match event {
            StreamEvent::FormatChanged(format) => {
                let Some(engine) = engine.upgrade() else {
                    return;
                };
                let Ok(mut inner) = engine.try_borrow_mut() else {
                    warn!(stream = %id, "format change while engine busy, ignored");
                    return;
                };
                if let Err(e) = inner.on_format_changed(id, direction, *format) {
                    error!("reconfiguration failed: {e}");
                    inner.session.loop_handle().quit();
                }
            }
            StreamEvent::StateChanged {
                new: StreamState::Error(message),
                ..
            } => error!(stream = %id, %direction, "stream error: {message}"),
            StreamEvent::StateChanged { .. } => {}
        });
    }

    fn on_format_changed(
        &mut self,
        id: StreamId,
        direction: Direction,
        format: AudioFormat,
    ) -> Result<()> {
        // Late events from a torn-down generation.
        if self.stream(direction).map(|s| s.id()) != Some(id) {
            return Ok(());
        }

        let previous = self.negotiated[slot(direction)].replace(format);
        let peer = self.negotiated[slot(direction.opposite())];
        if let Some(peer) = peer {
            if peer.rate != format.rate {
                warn!(
                    capture = ?self.negotiated[0].and_then(|f| f.rate),
                    playback = ?self.negotiated[1].and_then(|f| f.rate),
                    "capture and playback run at different rates; relying on the daemon's adapter"
                );
            }
        }

        let Some(previous) = previous else {
            return Ok(());
        };
        if previous == format {
            return Ok(());
        }
        if self.plan.capture.format.rate == format.rate && format.rate.is_some() {
            // Already built for this rate; rebuilding again would loop.
            return Ok(());
        }

        info!(
            %direction,
            from = %previous,
            to = %format,
            "daemon changed the stream format, rebuilding"
        );
        self.reconfigure(format.rate)
    }

    fn reconfigure(&mut self, rate: Option<u32>) -> Result<()> {
        self.teardown()?;
        self.plan.capture.format = self.plan.capture.format.with_rate(rate);
        self.plan.playback.format = self.plan.playback.format.with_rate(rate);
        self.build()
    }

    fn teardown(&mut self) -> Result<()> {
        // Capture first: its callback holds the playback queue.
        let mut result = Ok(());
        if let Some(capture) = self.capture.take() {
            result = capture.disconnect();
        }
        if let Some(playback) = self.playback.take() {
            let disconnected = playback.disconnect();
            if result.is_ok() {
                result = disconnected;
            }
        }
        self.negotiated = [None, None];
        result
    }
}

fn slot(direction: Direction) -> usize {
    match direction {
        Direction::Input => 0,
        Direction::Output => 1,
    }
}
