//! In-process simulated audio graph.
//!
//! Models what the loopback engine needs from a daemon: named remotes,
//! named nodes for stream targets, per-stream buffer pools exchanged over
//! lock-free SPSC rings, quantum cycles that run `process` callbacks, and
//! the failure modes worth testing (unreachable daemon, refused target,
//! starvation, forced format changes, daemon death).
//!
//! Each cycle:
//! 1. every streaming capture stream is offered one freshly filled buffer,
//!    every streaming playback stream one empty buffer;
//! 2. `process` callbacks run (under the graph lock, so a disconnect waits
//!    for an in-flight cycle);
//! 3. returned buffers go back to their pools and playback buffers are
//!    recorded as [`Delivery`]s (the most recent [`DELIVERY_HISTORY`]).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rtrb::{Consumer, Producer, RingBuffer};
use tracing::{debug, info, warn};

use crate::channel_map::MAX_CHANNELS;
use crate::daemon::{
    AudioFormat, BufferQueue, ConnectParams, Connection, Daemon, DaemonEvent, Direction,
    ProcessHandler, StreamId, StreamState, CORE_ID,
};
use crate::error::{LoopbackError, Result};
use crate::event_loop::LoopHandle;
use crate::properties::{keys, FrozenProperties};

pub const DEFAULT_REMOTE: &str = "pipewire-0";
pub const DEFAULT_QUANTUM: u32 = 1024;
/// Deliveries kept for inspection; older ones are discarded.
pub const DELIVERY_HISTORY: usize = 4096;
const DEFAULT_SLOTS: usize = 4;
const SAMPLE_BYTES: u32 = 4;

/// Where a buffer's frames live. Copying a descriptor aliases the frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferDescriptor {
    /// Shared-memory region id; 0 means no frames.
    pub region: u64,
    pub offset: u32,
    pub frames: u32,
    /// Bytes between consecutive frames of one planar channel.
    pub stride: u32,
    pub channels: u32,
}

/// One pool slot as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBuffer {
    pub slot: u32,
    pub desc: BufferDescriptor,
}

#[derive(Debug, Default)]
struct QueueAudit {
    held: AtomicU32,
    violations: AtomicU64,
}

/// Client end of a stream's buffer ring.
pub struct MemoryQueue {
    stream: StreamId,
    ready: Consumer<MemoryBuffer>,
    done: Producer<MemoryBuffer>,
    audit: Arc<QueueAudit>,
}

/// Daemon end of a stream's buffer ring.
pub struct QueuePeer {
    ready: Producer<MemoryBuffer>,
    done: Consumer<MemoryBuffer>,
    audit: Arc<QueueAudit>,
}

impl MemoryQueue {
    /// A connected client/daemon pair holding at most `capacity` buffers.
    pub fn pair(stream: StreamId, capacity: usize) -> (MemoryQueue, QueuePeer) {
        let (ready_tx, ready_rx) = RingBuffer::new(capacity);
        let (done_tx, done_rx) = RingBuffer::new(capacity);
        let audit = Arc::new(QueueAudit::default());
        (
            MemoryQueue {
                stream,
                ready: ready_rx,
                done: done_tx,
                audit: Arc::clone(&audit),
            },
            QueuePeer {
                ready: ready_tx,
                done: done_rx,
                audit,
            },
        )
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }
}

impl BufferQueue for MemoryQueue {
    type Buffer = MemoryBuffer;

    fn dequeue(&mut self) -> Option<MemoryBuffer> {
        let buffer = self.ready.pop().ok()?;
        if self.audit.held.fetch_add(1, Ordering::Relaxed) > 0 {
            self.audit.violations.fetch_add(1, Ordering::Relaxed);
        }
        Some(buffer)
    }

    fn queue(&mut self, buffer: MemoryBuffer) {
        if self.audit.held.load(Ordering::Relaxed) == 0 {
            self.audit.violations.fetch_add(1, Ordering::Relaxed);
        } else {
            self.audit.held.fetch_sub(1, Ordering::Relaxed);
        }
        if self.done.push(buffer).is_err() {
            self.audit.violations.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn forward(from: &MemoryBuffer, to: &mut MemoryBuffer) {
        to.desc = from.desc;
    }

    fn silence(buffer: &mut MemoryBuffer) {
        buffer.desc = BufferDescriptor::default();
    }
}

impl QueuePeer {
    /// Make `buffer` dequeuable. Returns false when the ring is full.
    pub fn offer(&mut self, buffer: MemoryBuffer) -> bool {
        self.ready.push(buffer).is_ok()
    }

    fn take_done(&mut self) -> Option<MemoryBuffer> {
        self.done.pop().ok()
    }

    /// Everything the client has queued back so far.
    pub fn collect(&mut self) -> Vec<MemoryBuffer> {
        std::iter::from_fn(|| self.take_done()).collect()
    }

    /// Buffers currently dequeued and not yet queued back.
    pub fn held(&self) -> u32 {
        self.audit.held.load(Ordering::Relaxed)
    }

    /// Double dequeues and unmatched queues seen on this ring.
    pub fn violations(&self) -> u64 {
        self.audit.violations.load(Ordering::Relaxed)
    }

    fn client_alive(&self) -> bool {
        Arc::strong_count(&self.audit) > 1
    }
}

/// A playback buffer the graph received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub cycle: u64,
    pub stream: StreamId,
    pub region: u64,
    pub frames: u32,
}

impl Delivery {
    pub fn is_silent(&self) -> bool {
        self.frames == 0
    }
}

/// Snapshot of one simulated stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub id: StreamId,
    pub name: String,
    pub props: FrozenProperties,
    pub direction: Option<Direction>,
    pub state: StreamState,
    pub format: Option<AudioFormat>,
}

struct SimStream {
    id: StreamId,
    name: String,
    props: FrozenProperties,
    connection: u64,
    direction: Option<Direction>,
    state: StreamState,
    format: Option<AudioFormat>,
    process: Option<Box<dyn ProcessHandler>>,
    peer: QueuePeer,
    client: Option<MemoryQueue>,
    free: Vec<MemoryBuffer>,
}

impl SimStream {
    fn info(&self) -> StreamInfo {
        StreamInfo {
            id: self.id,
            name: self.name.clone(),
            props: self.props.clone(),
            direction: self.direction,
            state: self.state.clone(),
            format: self.format,
        }
    }
}

struct Graph {
    remotes: Vec<String>,
    nodes: Vec<String>,
    reachable: bool,
    alive: bool,
    default_rate: u32,
    quantum: u32,
    slots: usize,
    forced_rates: [Option<u32>; 2],
    starve: [u32; 2],
    connections: HashMap<u64, LoopHandle>,
    next_connection: u64,
    streams: BTreeMap<StreamId, SimStream>,
    next_stream: u32,
    cycles: u64,
    next_region: u64,
    deliveries: VecDeque<Delivery>,
    violations: u64,
}

impl Graph {
    fn post(&self, connection: u64, event: DaemonEvent) {
        if !self.alive {
            return;
        }
        if let Some(handle) = self.connections.get(&connection) {
            handle.post(event);
        }
    }

    fn retire(&mut self, stream: SimStream) {
        self.violations += stream.peer.violations();
        // The client end of the ring must be released before the stream goes.
        if stream.client.is_none() && stream.peer.client_alive() {
            self.violations += 1;
            warn!(stream = %stream.id, "stream destroyed while its buffer queue is still held");
        }
    }
}

fn slot(direction: Direction) -> usize {
    match direction {
        Direction::Input => 0,
        Direction::Output => 1,
    }
}

fn lock(graph: &Mutex<Graph>) -> MutexGuard<'_, Graph> {
    graph.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle on a simulated daemon. Clones share the same graph.
#[derive(Clone)]
pub struct MemoryDaemon {
    graph: Arc<Mutex<Graph>>,
}

impl Default for MemoryDaemon {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDaemon {
    pub fn new() -> Self {
        Self {
            graph: Arc::new(Mutex::new(Graph {
                remotes: vec![DEFAULT_REMOTE.to_string()],
                nodes: Vec::new(),
                reachable: true,
                alive: true,
                default_rate: loopconf::DEFAULT_RATE,
                quantum: DEFAULT_QUANTUM,
                slots: DEFAULT_SLOTS,
                forced_rates: [None, None],
                starve: [0, 0],
                connections: HashMap::new(),
                next_connection: 1,
                streams: BTreeMap::new(),
                next_stream: 1,
                cycles: 0,
                next_region: 0,
                deliveries: VecDeque::with_capacity(DELIVERY_HISTORY),
                violations: 0,
            })),
        }
    }

    /// Accept connections that name `remote`.
    pub fn add_remote(&self, remote: &str) {
        lock(&self.graph).remotes.push(remote.to_string());
    }

    /// Register a node streams may target by name.
    pub fn add_node(&self, name: &str) {
        lock(&self.graph).nodes.push(name.to_string());
    }

    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.graph).reachable = reachable;
    }

    pub fn set_quantum(&self, frames: u32) {
        lock(&self.graph).quantum = frames;
    }

    /// Run one quantum.
    pub fn cycle(&self) {
        let mut guard = lock(&self.graph);
        let graph = &mut *guard;
        if !graph.alive {
            return;
        }
        graph.cycles += 1;
        let cycle = graph.cycles;
        let starved = graph.starve.map(|n| n > 0);
        for n in graph.starve.iter_mut() {
            *n = n.saturating_sub(1);
        }

        for stream in graph.streams.values_mut() {
            if stream.state != StreamState::Streaming {
                continue;
            }
            let (Some(direction), Some(format)) = (stream.direction, stream.format) else {
                continue;
            };
            if starved[slot(direction)] {
                continue;
            }
            let Some(mut buffer) = stream.free.pop() else {
                continue;
            };
            buffer.desc = match direction {
                Direction::Input => {
                    graph.next_region += 1;
                    BufferDescriptor {
                        region: graph.next_region,
                        offset: 0,
                        frames: graph.quantum,
                        stride: SAMPLE_BYTES,
                        channels: format.channels,
                    }
                }
                Direction::Output => BufferDescriptor::default(),
            };
            if !stream.peer.offer(buffer) {
                stream.free.push(buffer);
            }
        }

        for stream in graph.streams.values_mut() {
            if stream.state != StreamState::Streaming {
                continue;
            }
            if let Some(handler) = stream.process.as_mut() {
                handler.process();
            }
        }

        for stream in graph.streams.values_mut() {
            while let Some(buffer) = stream.peer.take_done() {
                if stream.direction == Some(Direction::Output) {
                    if graph.deliveries.len() == DELIVERY_HISTORY {
                        graph.deliveries.pop_front();
                    }
                    graph.deliveries.push_back(Delivery {
                        cycle,
                        stream: stream.id,
                        region: buffer.desc.region,
                        frames: buffer.desc.frames,
                    });
                }
                stream.free.push(buffer);
            }
            if stream.peer.held() > 0 {
                graph.violations += 1;
            }
        }
    }

    /// Run `n` quanta.
    pub fn cycles(&self, n: usize) {
        for _ in 0..n {
            self.cycle();
        }
    }

    /// Withhold buffers from every stream of `direction` for the next
    /// `cycles` quanta.
    pub fn starve(&self, direction: Direction, cycles: u32) {
        lock(&self.graph).starve[slot(direction)] += cycles;
    }

    /// Renegotiate every stream of `direction` at `rate`, as a device
    /// switching its native rate would. Later connects negotiate the same.
    pub fn change_format(&self, direction: Direction, rate: u32) {
        let mut guard = lock(&self.graph);
        let graph = &mut *guard;
        graph.forced_rates[slot(direction)] = Some(rate);

        let mut events = Vec::new();
        for stream in graph.streams.values_mut() {
            if stream.direction != Some(direction) {
                continue;
            }
            if let Some(format) = stream.format.as_mut() {
                format.rate = Some(rate);
                events.push((
                    stream.connection,
                    DaemonEvent::FormatChanged {
                        id: stream.id,
                        format: *format,
                    },
                ));
            }
        }
        for (connection, event) in events {
            graph.post(connection, event);
        }
        info!(%direction, rate, "simulated format change");
    }

    /// Simulate the daemon exiting: every connection sees `EPIPE` on the core.
    pub fn kill(&self) {
        let mut graph = lock(&self.graph);
        for handle in graph.connections.values() {
            handle.post(DaemonEvent::Error {
                id: CORE_ID,
                seq: 0,
                code: -libc::EPIPE,
                message: "connection closed".to_string(),
            });
        }
        graph.alive = false;
        info!("simulated daemon exit");
    }

    pub fn streams(&self) -> Vec<StreamInfo> {
        lock(&self.graph).streams.values().map(SimStream::info).collect()
    }

    pub fn stream(&self, id: StreamId) -> Option<StreamInfo> {
        lock(&self.graph).streams.get(&id).map(SimStream::info)
    }

    /// The most recent playback deliveries, oldest first.
    pub fn deliveries(&self) -> Vec<Delivery> {
        lock(&self.graph).deliveries.iter().copied().collect()
    }

    pub fn cycle_count(&self) -> u64 {
        lock(&self.graph).cycles
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.graph).connections.len()
    }

    /// Buffer-contract violations across live and destroyed streams.
    pub fn violations(&self) -> u64 {
        let graph = lock(&self.graph);
        graph.violations
            + graph
                .streams
                .values()
                .map(|s| s.peer.violations())
                .sum::<u64>()
    }

    /// Drive cycles from a background thread every `period`, standing in
    /// for the daemon's realtime thread.
    pub fn spawn_clock(&self, period: Duration) -> std::io::Result<Clock> {
        let running = Arc::new(AtomicBool::new(true));
        let daemon = self.clone();
        let flag = Arc::clone(&running);
        let thread = thread::Builder::new()
            .name("memory-graph-clock".to_string())
            .spawn(move || {
                while flag.load(Ordering::Acquire) {
                    daemon.cycle();
                    thread::sleep(period);
                }
            })?;
        Ok(Clock {
            running,
            thread: Some(thread),
        })
    }
}

impl Daemon for MemoryDaemon {
    type Connection = MemoryConnection;

    fn connect(&self, props: &FrozenProperties, events: LoopHandle) -> Result<MemoryConnection> {
        let mut graph = lock(&self.graph);
        if !graph.reachable || !graph.alive {
            return Err(LoopbackError::ConnectFailed("daemon unreachable".to_string()));
        }
        if let Some(remote) = props.get(keys::REMOTE_NAME) {
            if !graph.remotes.iter().any(|r| r == remote) {
                return Err(LoopbackError::ConnectFailed(format!(
                    "no daemon named {remote:?}"
                )));
            }
        }

        let id = graph.next_connection;
        graph.next_connection += 1;
        graph.connections.insert(id, events);
        debug!(connection = id, "memory daemon accepted connection");

        Ok(MemoryConnection {
            id,
            graph: Arc::clone(&self.graph),
            closed: false,
        })
    }
}

/// A client connection to a [`MemoryDaemon`].
pub struct MemoryConnection {
    id: u64,
    graph: Arc<Mutex<Graph>>,
    closed: bool,
}

impl MemoryConnection {
    fn graph(&self) -> Result<MutexGuard<'_, Graph>> {
        if self.closed {
            return Err(LoopbackError::Disconnected);
        }
        Ok(lock(&self.graph))
    }
}

impl Connection for MemoryConnection {
    type Queue = MemoryQueue;

    fn create_stream(&mut self, name: &str, props: &FrozenProperties) -> Result<StreamId> {
        let mut graph = self.graph()?;
        if !graph.alive {
            return Err(LoopbackError::PipeBroken);
        }
        let id = StreamId(graph.next_stream);
        graph.next_stream += 1;

        let slots = graph.slots;
        let (client, peer) = MemoryQueue::pair(id, slots);
        let free = (0..slots as u32)
            .map(|slot| MemoryBuffer {
                slot,
                desc: BufferDescriptor::default(),
            })
            .collect();
        graph.streams.insert(
            id,
            SimStream {
                id,
                name: name.to_string(),
                props: props.clone(),
                connection: self.id,
                direction: None,
                state: StreamState::Unconnected,
                format: None,
                process: None,
                peer,
                client: Some(client),
                free,
            },
        );
        debug!(stream = %id, name, "memory stream created");
        Ok(id)
    }

    fn connect_stream(
        &mut self,
        id: StreamId,
        params: &ConnectParams,
        process: Option<Box<dyn ProcessHandler>>,
    ) -> Result<()> {
        let connection = self.id;
        let mut guard = self.graph()?;
        let graph = &mut *guard;
        if !graph.alive {
            return Err(LoopbackError::PipeBroken);
        }
        let stream = graph
            .streams
            .get_mut(&id)
            .ok_or(LoopbackError::UnknownStream(id))?;
        if stream.state != StreamState::Unconnected {
            return Err(LoopbackError::InvalidState {
                id,
                action: "connect",
                state: stream.state.to_string(),
            });
        }

        let target = params
            .target
            .clone()
            .or_else(|| stream.props.get(keys::NODE_TARGET).map(str::to_string));
        if let Some(target) = target {
            if !graph.nodes.iter().any(|n| *n == target) {
                return Err(LoopbackError::StreamRefused {
                    id,
                    reason: format!("no node named {target:?}"),
                });
            }
        }
        let channels = params.format.channels;
        if channels == 0 || channels as usize > MAX_CHANNELS {
            return Err(LoopbackError::StreamRefused {
                id,
                reason: format!("unsupported channel count {channels}"),
            });
        }

        let rate = graph.forced_rates[slot(params.direction)]
            .or(params.format.rate)
            .unwrap_or(graph.default_rate);
        let format = params.format.with_rate(Some(rate));
        stream.direction = Some(params.direction);
        stream.format = Some(format);
        stream.process = process;
        stream.state = StreamState::Streaming;

        for event in [
            DaemonEvent::StreamState {
                id,
                old: StreamState::Unconnected,
                new: StreamState::Connecting,
            },
            DaemonEvent::StreamState {
                id,
                old: StreamState::Connecting,
                new: StreamState::Paused,
            },
            DaemonEvent::FormatChanged { id, format },
            DaemonEvent::StreamState {
                id,
                old: StreamState::Paused,
                new: StreamState::Streaming,
            },
        ] {
            graph.post(connection, event);
        }
        debug!(stream = %id, direction = %params.direction, %format, "memory stream connected");
        Ok(())
    }

    fn buffer_queue(&mut self, id: StreamId) -> Result<MemoryQueue> {
        let mut graph = self.graph()?;
        let stream = graph
            .streams
            .get_mut(&id)
            .ok_or(LoopbackError::UnknownStream(id))?;
        stream.client.take().ok_or_else(|| {
            LoopbackError::Backend(format!("buffer queue of stream {id} already taken"))
        })
    }

    fn disconnect_stream(&mut self, id: StreamId) -> Result<()> {
        let connection = self.id;
        let mut guard = self.graph()?;
        let graph = &mut *guard;
        let Some(stream) = graph.streams.get_mut(&id) else {
            return Ok(());
        };
        let old = std::mem::replace(&mut stream.state, StreamState::Unconnected);
        stream.process = None;
        if old != StreamState::Unconnected {
            graph.post(
                connection,
                DaemonEvent::StreamState {
                    id,
                    old,
                    new: StreamState::Unconnected,
                },
            );
        }
        Ok(())
    }

    fn destroy_stream(&mut self, id: StreamId) -> Result<()> {
        let mut graph = self.graph()?;
        if let Some(stream) = graph.streams.remove(&id) {
            graph.retire(stream);
            debug!(stream = %id, "memory stream destroyed");
        }
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let connection = self.id;
        let mut graph = lock(&self.graph);
        let owned: Vec<StreamId> = graph
            .streams
            .values()
            .filter(|s| s.connection == connection)
            .map(|s| s.id)
            .collect();
        for id in owned {
            if let Some(stream) = graph.streams.remove(&id) {
                graph.retire(stream);
            }
        }
        graph.connections.remove(&connection);
        drop(graph);
        self.closed = true;
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}

/// Background cycle driver. Stops on drop.
pub struct Clock {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Clock {
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Clock {
    fn drop(&mut self) {
        self.stop();
    }
}
