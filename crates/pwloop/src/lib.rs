//! pwloop: a realtime loopback between two audio-graph endpoints.
//!
//! A capture stream and a playback stream share one `node.group`, so the
//! daemon schedules them in the same quantum. The capture stream's realtime
//! callback hands each captured buffer's descriptors to the playback buffer
//! dequeued in the same cycle; samples are never copied.
//!
//! Layering, bottom up:
//!
//! - [`properties`] and [`channel_map`]: the string dictionaries and channel
//!   layouts handed to the daemon.
//! - [`daemon`]: the trait seam to the audio-graph daemon, with a PipeWire
//!   implementation and an in-process simulation under [`backend`].
//! - [`event_loop`], [`session`], [`stream`]: the loop thread's view of a
//!   connection and its streams.
//! - [`options`] and [`engine`]: option resolution and the stream pair with
//!   its forwarding callback.

pub mod backend;
pub mod channel_map;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod event_loop;
pub mod options;
pub mod properties;
pub mod session;
pub mod stream;

pub use channel_map::{ChannelMap, ChannelPosition, MAX_CHANNELS};
pub use daemon::{AudioFormat, Daemon, DaemonEvent, Direction, StreamFlags, StreamId, StreamState};
pub use engine::{Forwarder, LoopStats, LoopbackEngine, StatsSnapshot, TickOutcome};
pub use error::{ErrorKind, LoopbackError, Result};
pub use event_loop::{EventLoop, LoopHandle, SourceId};
pub use options::{LoopbackOptions, StreamPlan};
pub use properties::{FrozenProperties, Properties};
pub use session::{Session, SessionError};
pub use stream::{Stream, StreamConfig, StreamEvent};
