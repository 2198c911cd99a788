//! Half-duplex streams within a [`Session`].

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::{debug, info, warn};

use crate::channel_map::ChannelMap;
use crate::daemon::{
    AudioFormat, ConnectParams, Connection, Direction, ProcessHandler, StreamFlags, StreamId,
    StreamState,
};
use crate::error::{LoopbackError, Result};
use crate::properties::{keys, Properties};
use crate::session::Session;

/// Everything needed to build one stream. Moved into the [`Stream`].
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub direction: Direction,
    /// `capture` or `playback`.
    pub role: String,
    pub target: Option<String>,
    pub group: Option<String>,
    pub latency_frames: Option<u32>,
    pub format: AudioFormat,
    pub channel_map: ChannelMap,
    /// Final properties handed to the daemon, overlays included.
    pub props: Properties,
}

impl StreamConfig {
    /// The channel map and any `audio.channels` / `audio.position` in the
    /// final properties must all describe `format.channels` channels.
    pub fn validate(&self) -> Result<()> {
        let channels = self.format.channels;
        self.channel_map.validate(channels)?;
        if let Some(value) = self.props.get(keys::AUDIO_CHANNELS) {
            let declared = value.trim().parse::<u32>().map_err(|_| {
                LoopbackError::invalid(format!("{}: bad audio.channels {value:?}", self.role))
            })?;
            if declared != channels {
                return Err(LoopbackError::invalid(format!(
                    "{}: audio.channels is {declared} but the loopback carries {channels}",
                    self.role
                )));
            }
        }
        if let Some(value) = self.props.get(keys::AUDIO_POSITION) {
            ChannelMap::parse(value)?.validate(channels)?;
        }
        Ok(())
    }
}

/// Notifications delivered to [`Stream::add_listener`] callbacks.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    StateChanged { old: StreamState, new: StreamState },
    FormatChanged(AudioFormat),
}

type StreamListener = Box<dyn FnMut(&StreamEvent)>;

/// Loop-thread state shared between a [`Stream`] and its session's router.
pub(crate) struct StreamShared {
    id: StreamId,
    name: String,
    state: RefCell<StreamState>,
    format: Cell<Option<AudioFormat>>,
    connected: Cell<bool>,
    valid: Cell<bool>,
    listeners: RefCell<Vec<StreamListener>>,
}

impl StreamShared {
    pub(crate) fn handle(&self, event: StreamEvent) {
        match &event {
            StreamEvent::StateChanged { new, .. } => {
                let current = self.state.borrow().clone();
                if current == *new {
                    return;
                }
                if !current.can_transition_to(new) {
                    warn!(stream = %self.id, from = %current, to = %new, "unexpected state transition");
                }
                info!(stream = %self.id, name = %self.name, "state {} -> {}", current, new);
                *self.state.borrow_mut() = new.clone();
            }
            StreamEvent::FormatChanged(format) => {
                debug!(stream = %self.id, %format, "format negotiated");
                self.format.set(Some(*format));
            }
        }
        self.notify(&event);
    }

    /// Session teardown: the stream can no longer reach the daemon.
    pub(crate) fn invalidate(&self) {
        self.valid.set(false);
        self.connected.set(false);
        let old = self.state.replace(StreamState::Unconnected);
        if old != StreamState::Unconnected {
            self.notify(&StreamEvent::StateChanged {
                old,
                new: StreamState::Unconnected,
            });
        }
    }

    fn notify(&self, event: &StreamEvent) {
        let mut listeners = self.listeners.take();
        for listener in listeners.iter_mut() {
            listener(event);
        }
        let mut slot = self.listeners.borrow_mut();
        listeners.append(&mut slot);
        *slot = listeners;
    }
}

/// A capture or playback stream. Dropping it destroys the daemon object.
pub struct Stream<C: Connection> {
    session: Session<C>,
    shared: Rc<StreamShared>,
    config: StreamConfig,
}

impl<C: Connection> Stream<C> {
    /// Create the daemon object. The channel map must match the channel count.
    pub fn new(session: &Session<C>, name: &str, config: StreamConfig) -> Result<Self> {
        config.validate()?;

        let props = config.props.freeze();
        debug!(name, direction = %config.direction, props = %props, "creating stream");
        let id = session.with_connection(|conn| conn.create_stream(name, &props))?;

        let shared = Rc::new(StreamShared {
            id,
            name: name.to_string(),
            state: RefCell::new(StreamState::Unconnected),
            format: Cell::new(None),
            connected: Cell::new(false),
            valid: Cell::new(true),
            listeners: RefCell::new(Vec::new()),
        });
        session.register_stream(id, Rc::downgrade(&shared));

        Ok(Self {
            session: session.clone(),
            shared,
            config,
        })
    }

    pub fn id(&self) -> StreamId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn direction(&self) -> Direction {
        self.config.direction
    }

    pub fn properties(&self) -> &Properties {
        &self.config.props
    }

    pub fn state(&self) -> StreamState {
        self.shared.state.borrow().clone()
    }

    /// Format reported by the daemon, once negotiated.
    pub fn format(&self) -> Option<AudioFormat> {
        self.shared.format.get()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.get()
    }

    /// Receive state transitions and format changes on the loop thread.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnMut(&StreamEvent) + 'static,
    {
        self.shared.listeners.borrow_mut().push(Box::new(listener));
    }

    /// Ask the daemon to place the stream in the graph, using the direction,
    /// target and format fixed by the config. `process` runs once per quantum
    /// on the daemon's realtime thread.
    pub fn connect(
        &self,
        flags: StreamFlags,
        process: Option<Box<dyn ProcessHandler>>,
    ) -> Result<()> {
        self.ensure_valid()?;
        if self.shared.connected.get() {
            return Err(LoopbackError::InvalidState {
                id: self.id(),
                action: "connect",
                state: self.state().to_string(),
            });
        }
        self.config.validate()?;

        let params = ConnectParams {
            direction: self.config.direction,
            target: self.config.target.clone(),
            flags,
            format: self.config.format,
        };
        self.session
            .with_connection(|conn| conn.connect_stream(self.id(), &params, process))?;
        self.shared.connected.set(true);
        info!(
            stream = %self.id(),
            name = %self.name(),
            direction = %params.direction,
            target = params.target.as_deref().unwrap_or("auto"),
            "stream connect requested"
        );
        Ok(())
    }

    /// Realtime handle on this stream's buffer ring.
    pub fn buffer_queue(&self) -> Result<C::Queue> {
        self.ensure_valid()?;
        self.session.with_connection(|conn| conn.buffer_queue(self.id()))
    }

    /// Leave the graph. Idempotent; returns once no `process` call is running.
    pub fn disconnect(&self) -> Result<()> {
        if !self.shared.connected.replace(false) || !self.shared.valid.get() {
            return Ok(());
        }
        self.session
            .with_connection(|conn| conn.disconnect_stream(self.id()))?;
        self.shared.handle(StreamEvent::StateChanged {
            old: self.state(),
            new: StreamState::Unconnected,
        });
        Ok(())
    }

    fn ensure_valid(&self) -> Result<()> {
        if self.shared.valid.get() {
            Ok(())
        } else {
            Err(LoopbackError::Disconnected)
        }
    }
}

impl<C: Connection> Drop for Stream<C> {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            debug!(stream = %self.id(), "disconnect on drop failed: {e}");
        }
        self.session.unregister_stream(self.id());
        if self.shared.valid.get() {
            if let Err(e) = self
                .session
                .with_connection(|conn| conn.destroy_stream(self.shared.id))
            {
                debug!(stream = %self.shared.id, "destroy failed: {e}");
            }
        }
    }
}
