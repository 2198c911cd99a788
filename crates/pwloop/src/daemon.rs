//! Client-facing contract with the audio-graph daemon.
//!
//! The session and stream layers talk to the daemon only through the traits
//! here. [`crate::backend::pipewire`] drives a real PipeWire instance;
//! [`crate::backend::memory`] simulates a graph in-process.
//!
//! ```text
//!  loop thread                           realtime thread
//!  ───────────                           ───────────────
//!  Session ──▶ Connection ──▶ daemon ──▶ ProcessHandler::process()
//!     ▲                         │              │
//!     └──── DaemonEvent ◀───────┘        BufferQueue::{dequeue,queue}
//! ```

use std::fmt;
use std::ops::BitOr;

use crate::error::Result;
use crate::event_loop::LoopHandle;
use crate::properties::FrozenProperties;

/// Object id the daemon uses for the connection itself.
pub const CORE_ID: u32 = 0;

/// Daemon-side identity of a stream, assigned at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u32);

impl StreamId {
    pub fn as_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Consumes from the graph (capture).
    Input,
    /// Produces into the graph (playback).
    Output,
}

impl Direction {
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Input => Direction::Output,
            Direction::Output => Direction::Input,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Input => "input",
            Direction::Output => "output",
        })
    }
}

/// Stream connect flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamFlags(u32);

impl StreamFlags {
    pub const NONE: StreamFlags = StreamFlags(0);
    /// The daemon picks a peer when no target is named.
    pub const AUTOCONNECT: StreamFlags = StreamFlags(1 << 0);
    /// Shared-memory buffers are mapped into the client.
    pub const MAP_BUFFERS: StreamFlags = StreamFlags(1 << 1);
    /// `process` runs on the daemon's realtime thread.
    pub const RT_PROCESS: StreamFlags = StreamFlags(1 << 2);

    pub const fn union(self, other: StreamFlags) -> StreamFlags {
        StreamFlags(self.0 | other.0)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: StreamFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for StreamFlags {
    type Output = StreamFlags;

    fn bitor(self, rhs: StreamFlags) -> StreamFlags {
        StreamFlags(self.0 | rhs.0)
    }
}

/// Stream lifecycle.
///
/// `Unconnected → Connecting → Paused ⇄ Streaming`, with `Error` reachable
/// from anywhere and `Unconnected` reachable on disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamState {
    Unconnected,
    Connecting,
    Paused,
    Streaming,
    Error(String),
}

impl StreamState {
    pub fn can_transition_to(&self, next: &StreamState) -> bool {
        use StreamState::*;
        matches!(
            (self, next),
            (_, Error(_))
                | (_, Unconnected)
                | (Unconnected, Connecting)
                | (Connecting, Paused)
                | (Paused, Streaming)
                | (Streaming, Paused)
        )
    }

    pub fn is_error(&self) -> bool {
        matches!(self, StreamState::Error(_))
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamState::Unconnected => f.write_str("unconnected"),
            StreamState::Connecting => f.write_str("connecting"),
            StreamState::Paused => f.write_str("paused"),
            StreamState::Streaming => f.write_str("streaming"),
            StreamState::Error(msg) => write!(f, "error ({msg})"),
        }
    }
}

/// Sample layouts the engine negotiates. Only planar float-32 is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SampleFormat {
    #[default]
    F32P,
}

/// Format offered at connect and reported back on negotiation.
///
/// Channels are always unpositioned at the format level; positions travel
/// in the `audio.position` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioFormat {
    pub sample: SampleFormat,
    /// `None` leaves the rate to the daemon.
    pub rate: Option<u32>,
    pub channels: u32,
}

impl AudioFormat {
    pub fn planar_f32(channels: u32) -> Self {
        Self {
            sample: SampleFormat::F32P,
            rate: None,
            channels,
        }
    }

    pub fn with_rate(mut self, rate: Option<u32>) -> Self {
        self.rate = rate;
        self
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rate {
            Some(rate) => write!(f, "{:?} {}ch @ {}Hz", self.sample, self.channels, rate),
            None => write!(f, "{:?} {}ch", self.sample, self.channels),
        }
    }
}

/// Asynchronous notifications from the daemon, delivered on the loop thread.
#[derive(Debug, Clone, PartialEq)]
pub enum DaemonEvent {
    /// An error addressed to an object id; `code` is a negative errno.
    Error {
        id: u32,
        seq: i32,
        code: i32,
        message: String,
    },
    StreamState {
        id: StreamId,
        old: StreamState,
        new: StreamState,
    },
    FormatChanged {
        id: StreamId,
        format: AudioFormat,
    },
}

/// Per-quantum callback run by the daemon on its realtime thread.
///
/// Implementations must not allocate, block, or take locks shared with the
/// loop thread.
pub trait ProcessHandler: Send + 'static {
    fn process(&mut self);
}

/// Non-blocking access to one stream's daemon-managed buffer ring.
///
/// A buffer is borrowed between `dequeue` and `queue`; it must be queued
/// exactly once before the next `dequeue` on the same queue.
pub trait BufferQueue: Send + 'static {
    type Buffer: Send;

    /// Next available buffer, `None` when the ring is empty.
    fn dequeue(&mut self) -> Option<Self::Buffer>;

    fn queue(&mut self, buffer: Self::Buffer);

    /// Aim `to` at the frames `from` references: pointers, frame count and
    /// stride are copied, sample memory is not.
    fn forward(from: &Self::Buffer, to: &mut Self::Buffer);

    /// Mark `buffer` as carrying no frames.
    fn silence(buffer: &mut Self::Buffer);
}

/// Everything `Connection::connect_stream` needs to place a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectParams {
    pub direction: Direction,
    /// Explicit peer; `None` defers to `node.target` or autoconnect.
    pub target: Option<String>,
    pub flags: StreamFlags,
    pub format: AudioFormat,
}

/// A live session with the daemon. Owned by the loop thread.
pub trait Connection: 'static {
    type Queue: BufferQueue;

    fn create_stream(&mut self, name: &str, props: &FrozenProperties) -> Result<StreamId>;

    /// Place the stream in the graph. Refusals surface here; later failures
    /// arrive as [`DaemonEvent`]s.
    fn connect_stream(
        &mut self,
        id: StreamId,
        params: &ConnectParams,
        process: Option<Box<dyn ProcessHandler>>,
    ) -> Result<()>;

    /// Realtime handle on the stream's buffer ring. Valid from creation
    /// until the stream is destroyed.
    fn buffer_queue(&mut self, id: StreamId) -> Result<Self::Queue>;

    /// Leave the graph. Returns once no `process` call is in flight.
    fn disconnect_stream(&mut self, id: StreamId) -> Result<()>;

    fn destroy_stream(&mut self, id: StreamId) -> Result<()>;

    fn disconnect(&mut self) -> Result<()>;
}

/// Entry point to a daemon implementation.
pub trait Daemon {
    type Connection: Connection;

    /// Handshake with the instance selected by `props` (`remote.name`).
    /// Asynchronous events are posted through `events`.
    fn connect(&self, props: &FrozenProperties, events: LoopHandle) -> Result<Self::Connection>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_combine() {
        let flags = StreamFlags::AUTOCONNECT | StreamFlags::MAP_BUFFERS | StreamFlags::RT_PROCESS;
        assert!(flags.contains(StreamFlags::RT_PROCESS));
        assert!(flags.contains(StreamFlags::AUTOCONNECT | StreamFlags::MAP_BUFFERS));
        assert!(!StreamFlags::AUTOCONNECT.contains(StreamFlags::RT_PROCESS));
        assert_eq!(flags.bits(), 0b111);
        assert_eq!(StreamFlags::AUTOCONNECT.union(StreamFlags::RT_PROCESS).bits(), 0b101);
    }

    #[test]
    fn test_opposite_direction() {
        assert_eq!(Direction::Input.opposite(), Direction::Output);
        assert_eq!(Direction::Output.opposite(), Direction::Input);
    }

    #[test]
    fn test_state_machine() {
        use StreamState::*;
        assert!(Unconnected.can_transition_to(&Connecting));
        assert!(Connecting.can_transition_to(&Paused));
        assert!(Paused.can_transition_to(&Streaming));
        assert!(Streaming.can_transition_to(&Paused));
        assert!(Streaming.can_transition_to(&Unconnected));
        assert!(Connecting.can_transition_to(&Error("refused".into())));

        assert!(!Unconnected.can_transition_to(&Streaming));
        assert!(!Connecting.can_transition_to(&Streaming));
        assert!(!Error("x".into()).can_transition_to(&Streaming));
    }

    #[test]
    fn test_format_display() {
        let format = AudioFormat::planar_f32(2);
        assert_eq!(format.to_string(), "F32P 2ch");
        assert_eq!(format.with_rate(Some(44100)).to_string(), "F32P 2ch @ 44100Hz");
    }
}
