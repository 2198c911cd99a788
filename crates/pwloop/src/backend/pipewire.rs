//! PipeWire daemon backend.
//!
//! PipeWire objects are tied to the thread that owns their loop, so each
//! connection runs a dedicated `pipewire-main` thread:
//!
//! ```text
//!  loop thread (EventLoop)            pipewire-main thread          PW data thread
//!  ───────────────────────            ────────────────────          ──────────────
//!  PipeWireConnection ──Command──▶ pw::channel ──▶ LoopState
//!         ▲                                          │ listeners
//!         └──────── LoopHandle::post(DaemonEvent) ◀──┘
//!                                                    process ──▶ ProcessHandler
//! ```
//!
//! Requests are answered over a std channel, so each `Connection` call blocks
//! until the main-loop thread has executed it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::CStr;
use std::ptr::{self, NonNull};
use std::rc::Rc;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use pipewire as pw;
use pw::spa;
use pw::spa::pod::Pod;
use tracing::{debug, error, info, warn};

use crate::daemon::{
    self, AudioFormat, BufferQueue, ConnectParams, Connection, Daemon, DaemonEvent, Direction,
    ProcessHandler, StreamFlags, StreamId,
};
use crate::error::{LoopbackError, Result};
use crate::event_loop::LoopHandle;
use crate::properties::{keys, FrozenProperties};

/// Version of the libpipewire this process is linked against.
pub fn library_version() -> String {
    // SAFETY: returns a pointer to a static NUL-terminated string.
    unsafe {
        let raw = pw::sys::pw_get_library_version();
        if raw.is_null() {
            return "unknown".to_string();
        }
        CStr::from_ptr(raw).to_string_lossy().into_owned()
    }
}

/// Connects to a running PipeWire instance.
#[derive(Debug, Default, Clone, Copy)]
pub struct PipeWireDaemon;

impl PipeWireDaemon {
    pub fn new() -> Self {
        Self
    }
}

impl Daemon for PipeWireDaemon {
    type Connection = PipeWireConnection;

    fn connect(&self, props: &FrozenProperties, events: LoopHandle) -> Result<PipeWireConnection> {
        pw::init();

        let remote = props.get(keys::REMOTE_NAME).map(str::to_string);
        let (commands, receiver) = pw::channel::channel::<Command>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();

        let thread = thread::Builder::new()
            .name("pipewire-main".to_string())
            .spawn(move || run_main_loop(remote, events, receiver, ready_tx))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(PipeWireConnection {
                commands,
                thread: Some(thread),
                streams: HashMap::new(),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(LoopbackError::ConnectFailed(
                    "PipeWire thread exited during setup".to_string(),
                ))
            }
        }
    }
}

type Reply<T> = mpsc::Sender<Result<T>>;

enum Command {
    CreateStream {
        name: String,
        props: FrozenProperties,
        reply: Reply<(StreamId, StreamPtr)>,
    },
    Connect {
        id: StreamId,
        params: ConnectParams,
        process: Option<Box<dyn ProcessHandler>>,
        reply: Reply<()>,
    },
    Disconnect {
        id: StreamId,
        reply: Reply<()>,
    },
    Destroy {
        id: StreamId,
        reply: Reply<()>,
    },
    Quit,
}

/// Raw stream pointer handed across threads. Valid until the stream is
/// destroyed on the main-loop thread.
#[derive(Clone, Copy)]
struct StreamPtr(NonNull<pw::sys::pw_stream>);

// SAFETY: only dereferenced by libpipewire calls that are safe from the
// data thread (dequeue/queue), and only while the stream exists.
unsafe impl Send for StreamPtr {}

/// A client connection served by its own `pipewire-main` thread.
pub struct PipeWireConnection {
    commands: pw::channel::Sender<Command>,
    thread: Option<JoinHandle<()>>,
    streams: HashMap<StreamId, StreamPtr>,
}

impl PipeWireConnection {
    fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        if self.thread.is_none() {
            return Err(LoopbackError::Disconnected);
        }
        let (tx, rx) = mpsc::channel();
        if self.commands.send(make(tx)).is_err() {
            return Err(LoopbackError::Disconnected);
        }
        rx.recv().map_err(|_| LoopbackError::Disconnected)?
    }
}

impl Connection for PipeWireConnection {
    type Queue = PwQueue;

    fn create_stream(&mut self, name: &str, props: &FrozenProperties) -> Result<StreamId> {
        let (id, ptr) = self.request(|reply| Command::CreateStream {
            name: name.to_string(),
            props: props.clone(),
            reply,
        })?;
        self.streams.insert(id, ptr);
        Ok(id)
    }

    fn connect_stream(
        &mut self,
        id: StreamId,
        params: &ConnectParams,
        process: Option<Box<dyn ProcessHandler>>,
    ) -> Result<()> {
        self.request(|reply| Command::Connect {
            id,
            params: params.clone(),
            process,
            reply,
        })
    }

    fn buffer_queue(&mut self, id: StreamId) -> Result<PwQueue> {
        let ptr = self
            .streams
            .get(&id)
            .copied()
            .ok_or(LoopbackError::UnknownStream(id))?;
        Ok(PwQueue { stream: ptr })
    }

    fn disconnect_stream(&mut self, id: StreamId) -> Result<()> {
        self.request(|reply| Command::Disconnect { id, reply })
    }

    fn destroy_stream(&mut self, id: StreamId) -> Result<()> {
        self.streams.remove(&id);
        self.request(|reply| Command::Destroy { id, reply })
    }

    fn disconnect(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        self.streams.clear();
        let _ = self.commands.send(Command::Quit);
        thread
            .join()
            .map_err(|_| LoopbackError::Backend("PipeWire thread panicked".to_string()))
    }
}

impl Drop for PipeWireConnection {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            error!("PipeWire teardown failed: {e}");
        }
    }
}

/// Realtime access to one stream's buffers.
pub struct PwQueue {
    stream: StreamPtr,
}

/// A dequeued `pw_buffer`, owned until queued back.
pub struct PwBuffer(NonNull<pw::sys::pw_buffer>);

// SAFETY: a dequeued buffer belongs exclusively to the holder until queued.
unsafe impl Send for PwBuffer {}

impl BufferQueue for PwQueue {
    type Buffer = PwBuffer;

    fn dequeue(&mut self) -> Option<PwBuffer> {
        // SAFETY: the stream outlives every queue handed out for it.
        let raw = unsafe { pw::sys::pw_stream_dequeue_buffer(self.stream.0.as_ptr()) };
        NonNull::new(raw).map(PwBuffer)
    }

    fn queue(&mut self, buffer: PwBuffer) {
        // SAFETY: `buffer` came from `dequeue` on this stream.
        unsafe {
            pw::sys::pw_stream_queue_buffer(self.stream.0.as_ptr(), buffer.0.as_ptr());
        }
    }

    fn forward(from: &PwBuffer, to: &mut PwBuffer) {
        // SAFETY: both buffers are dequeued and their spa_buffers are mapped.
        // Copying the spa_buffer aims the playback buffer at the capture
        // data blocks; no samples move.
        unsafe {
            let src = (*from.0.as_ptr()).buffer;
            let dst = (*to.0.as_ptr()).buffer;
            if !src.is_null() && !dst.is_null() {
                ptr::copy_nonoverlapping(src, dst, 1);
            }
        }
    }

    fn silence(buffer: &mut PwBuffer) {
        // SAFETY: the buffer is dequeued; chunks are mapped with MAP_BUFFERS.
        unsafe {
            let spa_buffer = (*buffer.0.as_ptr()).buffer;
            if spa_buffer.is_null() {
                return;
            }
            for i in 0..(*spa_buffer).n_datas as usize {
                let data = (*spa_buffer).datas.add(i);
                let chunk = (*data).chunk;
                if !chunk.is_null() {
                    (*chunk).offset = 0;
                    (*chunk).size = 0;
                }
            }
        }
    }
}

type ProcessSlot = Option<Box<dyn ProcessHandler>>;

struct StreamEntry {
    // Dropped before the stream it listens on.
    listener: Option<pw::stream::StreamListener<ProcessSlot>>,
    stream: pw::stream::StreamRc,
}

struct LoopState {
    core: pw::core::CoreRc,
    streams: HashMap<StreamId, StreamEntry>,
    next_id: u32,
}

fn run_main_loop(
    remote: Option<String>,
    events: LoopHandle,
    commands: pw::channel::Receiver<Command>,
    ready: mpsc::Sender<Result<()>>,
) {
    let (mainloop, _context, core) = match setup(remote.as_deref()) {
        Ok(parts) => parts,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    let _core_listener = core
        .add_listener_local()
        .error({
            let events = events.clone();
            move |id, seq, res, message| {
                events.post(DaemonEvent::Error {
                    id,
                    seq,
                    code: res,
                    message: message.to_string(),
                });
            }
        })
        .register();

    let state = Rc::new(RefCell::new(LoopState {
        core: core.clone(),
        streams: HashMap::new(),
        next_id: 1,
    }));

    let _receiver = commands.attach(mainloop.loop_(), {
        let mainloop = mainloop.clone();
        let state = Rc::clone(&state);
        move |command| match command {
            Command::Quit => mainloop.quit(),
            command => state.borrow_mut().handle(command, &events),
        }
    });

    info!(remote = remote.as_deref().unwrap_or("default"), "PipeWire core connected");
    if ready.send(Ok(())).is_err() {
        return;
    }

    mainloop.run();

    // Streams go before the core they were created on.
    state.borrow_mut().streams.clear();
    info!("PipeWire main loop exited");
}

fn setup(
    remote: Option<&str>,
) -> Result<(pw::main_loop::MainLoopRc, pw::context::ContextRc, pw::core::CoreRc)> {
    let mainloop = pw::main_loop::MainLoopRc::new(None)
        .map_err(|e| LoopbackError::Backend(format!("failed to create main loop: {e}")))?;
    let context = pw::context::ContextRc::new(&mainloop, None)
        .map_err(|e| LoopbackError::Backend(format!("failed to create context: {e}")))?;

    let mut props = pw::properties::PropertiesBox::new();
    if let Some(remote) = remote {
        props.insert(keys::REMOTE_NAME, remote);
    }
    let core = context.connect_rc(Some(props)).map_err(|e| {
        LoopbackError::ConnectFailed(format!(
            "can't connect to {}: {e}",
            remote.unwrap_or("default instance")
        ))
    })?;
    Ok((mainloop, context, core))
}

impl LoopState {
    fn handle(&mut self, command: Command, events: &LoopHandle) {
        match command {
            Command::CreateStream { name, props, reply } => {
                let _ = reply.send(self.create(&name, &props));
            }
            Command::Connect {
                id,
                params,
                process,
                reply,
            } => {
                let _ = reply.send(self.connect(id, &params, process, events));
            }
            Command::Disconnect { id, reply } => {
                let _ = reply.send(self.disconnect(id));
            }
            Command::Destroy { id, reply } => {
                let _ = reply.send(self.destroy(id));
            }
            Command::Quit => {}
        }
    }

    fn create(&mut self, name: &str, props: &FrozenProperties) -> Result<(StreamId, StreamPtr)> {
        let mut pw_props = pw::properties::PropertiesBox::new();
        for (key, value) in props.iter() {
            if key.contains('\0') || value.contains('\0') {
                warn!(key, "skipping property containing a NUL byte");
                continue;
            }
            pw_props.insert(key, value);
        }

        let stream = pw::stream::StreamRc::new(self.core.clone(), name, pw_props)
            .map_err(|e| LoopbackError::Backend(format!("failed to create stream {name:?}: {e}")))?;
        let ptr = NonNull::new(stream.as_raw_ptr())
            .map(StreamPtr)
            .ok_or_else(|| LoopbackError::Backend("stream pointer is null".to_string()))?;

        let id = StreamId(self.next_id);
        self.next_id += 1;
        self.streams.insert(
            id,
            StreamEntry {
                listener: None,
                stream,
            },
        );
        debug!(stream = %id, name, "PipeWire stream created");
        Ok((id, ptr))
    }

    fn connect(
        &mut self,
        id: StreamId,
        params: &ConnectParams,
        process: ProcessSlot,
        events: &LoopHandle,
    ) -> Result<()> {
        let entry = self
            .streams
            .get_mut(&id)
            .ok_or(LoopbackError::UnknownStream(id))?;

        let listener = entry
            .stream
            .add_local_listener_with_user_data(process)
            .state_changed({
                let events = events.clone();
                move |_, _, old, new| {
                    events.post(DaemonEvent::StreamState {
                        id,
                        old: stream_state(old),
                        new: stream_state(new),
                    });
                }
            })
            .param_changed({
                let events = events.clone();
                move |_, _, param, pod| {
                    if param != spa::param::ParamType::Format.as_raw() {
                        return;
                    }
                    let Some(pod) = pod else {
                        return;
                    };
                    match negotiated_format(pod) {
                        Some(format) => {
                            events.post(DaemonEvent::FormatChanged { id, format });
                        }
                        None => warn!(stream = %id, "ignoring non-raw-audio format"),
                    }
                }
            })
            .process(|_, handler| {
                if let Some(handler) = handler {
                    handler.process();
                }
            })
            .register()
            .map_err(|e| LoopbackError::Backend(format!("failed to register listener: {e}")))?;
        entry.listener = Some(listener);

        let values = format_pod(&params.format)?;
        let pod = Pod::from_bytes(&values)
            .ok_or_else(|| LoopbackError::Backend("invalid format pod".to_string()))?;
        let mut pods = [pod];

        let direction = match params.direction {
            Direction::Input => spa::utils::Direction::Input,
            Direction::Output => spa::utils::Direction::Output,
        };
        if let Err(e) = entry
            .stream
            .connect(direction, None, stream_flags(params.flags), &mut pods)
        {
            entry.listener = None;
            return Err(LoopbackError::StreamRefused {
                id,
                reason: e.to_string(),
            });
        }
        debug!(stream = %id, direction = %params.direction, format = %params.format, "PipeWire stream connecting");
        Ok(())
    }

    fn disconnect(&mut self, id: StreamId) -> Result<()> {
        let Some(entry) = self.streams.get_mut(&id) else {
            return Ok(());
        };
        // Returns once the data thread has left `process`.
        let result = entry
            .stream
            .disconnect()
            .map_err(|e| LoopbackError::Backend(format!("failed to disconnect stream {id}: {e}")));
        entry.listener = None;
        result
    }

    fn destroy(&mut self, id: StreamId) -> Result<()> {
        if self.streams.remove(&id).is_some() {
            debug!(stream = %id, "PipeWire stream destroyed");
        }
        Ok(())
    }
}

fn stream_state(state: pw::stream::StreamState) -> daemon::StreamState {
    match state {
        pw::stream::StreamState::Unconnected => daemon::StreamState::Unconnected,
        pw::stream::StreamState::Connecting => daemon::StreamState::Connecting,
        pw::stream::StreamState::Paused => daemon::StreamState::Paused,
        pw::stream::StreamState::Streaming => daemon::StreamState::Streaming,
        pw::stream::StreamState::Error(message) => daemon::StreamState::Error(message),
    }
}

fn stream_flags(flags: StreamFlags) -> pw::stream::StreamFlags {
    let mut out = pw::stream::StreamFlags::empty();
    if flags.contains(StreamFlags::AUTOCONNECT) {
        out |= pw::stream::StreamFlags::AUTOCONNECT;
    }
    if flags.contains(StreamFlags::MAP_BUFFERS) {
        out |= pw::stream::StreamFlags::MAP_BUFFERS;
    }
    if flags.contains(StreamFlags::RT_PROCESS) {
        out |= pw::stream::StreamFlags::RT_PROCESS;
    }
    out
}

/// `EnumFormat` pod offering planar f32 with unpositioned channels.
fn format_pod(format: &AudioFormat) -> Result<Vec<u8>> {
    let mut info = spa::param::audio::AudioInfoRaw::new();
    info.set_format(spa::param::audio::AudioFormat::F32P);
    info.set_flags(spa::param::audio::AudioInfoRawFlags::UNPOSITIONED);
    info.set_channels(format.channels);
    if let Some(rate) = format.rate {
        info.set_rate(rate);
    }

    let bytes = spa::pod::serialize::PodSerializer::serialize(
        std::io::Cursor::new(Vec::new()),
        &spa::pod::Value::Object(spa::pod::Object {
            type_: spa::sys::SPA_TYPE_OBJECT_Format,
            id: spa::sys::SPA_PARAM_EnumFormat,
            properties: info.into(),
        }),
    )
    .map_err(|e| LoopbackError::Backend(format!("failed to serialize format: {e:?}")))?
    .0
    .into_inner();
    Ok(bytes)
}

fn negotiated_format(pod: &Pod) -> Option<AudioFormat> {
    let (media_type, media_subtype) = spa::param::format_utils::parse_format(pod).ok()?;
    if media_type != spa::param::format::MediaType::Audio
        || media_subtype != spa::param::format::MediaSubtype::Raw
    {
        return None;
    }
    let mut info = spa::param::audio::AudioInfoRaw::new();
    info.parse(pod).ok()?;
    Some(AudioFormat::planar_f32(info.channels()).with_rate(Some(info.rate()).filter(|r| *r > 0)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_translation() {
        let flags = stream_flags(crate::engine::STREAM_FLAGS);
        assert!(flags.contains(pw::stream::StreamFlags::AUTOCONNECT));
        assert!(flags.contains(pw::stream::StreamFlags::MAP_BUFFERS));
        assert!(flags.contains(pw::stream::StreamFlags::RT_PROCESS));
        assert!(!flags.contains(pw::stream::StreamFlags::DRIVER));
        assert_eq!(stream_flags(StreamFlags::NONE), pw::stream::StreamFlags::empty());
    }

    #[test]
    fn test_format_pod_serializes() {
        let bytes = format_pod(&AudioFormat::planar_f32(2).with_rate(Some(48000))).unwrap();
        let pod = Pod::from_bytes(&bytes).unwrap();

        let mut info = spa::param::audio::AudioInfoRaw::new();
        info.parse(pod).unwrap();
        assert_eq!(info.format(), spa::param::audio::AudioFormat::F32P);
        assert_eq!(info.channels(), 2);
        assert_eq!(info.rate(), 48000);
        assert!(info
            .flags()
            .contains(spa::param::audio::AudioInfoRawFlags::UNPOSITIONED));
        assert_eq!(negotiated_format(pod).and_then(|f| f.rate), Some(48000));
    }

    #[test]
    fn test_format_pod_leaves_rate_open() {
        let bytes = format_pod(&AudioFormat::planar_f32(1)).unwrap();
        let pod = Pod::from_bytes(&bytes).unwrap();
        let format = negotiated_format(pod).unwrap();
        assert_eq!(format.channels, 1);
        assert_eq!(format.rate, None);
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            stream_state(pw::stream::StreamState::Streaming),
            daemon::StreamState::Streaming
        );
        assert_eq!(
            stream_state(pw::stream::StreamState::Error("gone".into())),
            daemon::StreamState::Error("gone".into())
        );
    }
}
