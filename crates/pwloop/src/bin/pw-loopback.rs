//! pw-loopback: connect a capture endpoint to a playback endpoint.
//!
//! Creates a capture and a playback stream in one node group and forwards
//! every captured buffer to the playback stream until SIGINT/SIGTERM or the
//! daemon goes away.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{CommandFactory, FromArgMatches, Parser};
use loopconf::{LoopConfig, LoopbackDefaults};
use pwloop::{Daemon, EventLoop, LoopbackEngine, LoopbackOptions, Session, StreamPlan};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Connect a capture source to a playback sink through the audio graph.
#[derive(Parser, Debug)]
#[command(name = "pw-loopback", about, disable_version_flag = true)]
struct Cli {
    /// Print version information
    #[arg(long)]
    version: bool,

    /// Remote daemon name
    #[arg(short, long)]
    remote: Option<String>,

    /// Node group shared by both streams
    #[arg(short, long)]
    group: Option<String>,

    /// Number of channels
    #[arg(short, long)]
    channels: Option<u32>,

    /// Channel map, e.g. "[ FL, FR ]"
    #[arg(short = 'm', long)]
    channel_map: Option<String>,

    /// Latency target in milliseconds
    #[arg(short, long, value_name = "MS")]
    latency: Option<u32>,

    /// Capture source to connect to
    #[arg(short = 'C', long = "capture", value_name = "TARGET")]
    capture: Option<String>,

    /// Playback sink to connect to
    #[arg(short = 'P', long = "playback", value_name = "TARGET")]
    playback: Option<String>,

    /// Extra capture stream properties
    #[arg(long, value_name = "PROPS")]
    capture_props: Option<String>,

    /// Extra playback stream properties
    #[arg(long, value_name = "PROPS")]
    playback_props: Option<String>,

    /// Config file to use instead of ./pw-loopback.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

impl Cli {
    /// Parse argv, showing the effective defaults in `--help`.
    fn parse_with_defaults(argv0: &str) -> Self {
        let command = Cli::command().after_help(format!(
            "Defaults: group {}, {} channels, channel map {}",
            default_group(argv0),
            loopconf::DEFAULT_CHANNELS,
            loopconf::DEFAULT_CHANNEL_MAP,
        ));
        let matches = command.get_matches();
        Cli::from_arg_matches(&matches).unwrap_or_else(|e| e.exit())
    }

    /// Flags win over the layered config.
    fn options(&self, argv0: &str, defaults: &LoopbackDefaults) -> LoopbackOptions {
        let group = self
            .group
            .clone()
            .or_else(|| defaults.group.clone())
            .unwrap_or_else(|| default_group(argv0));

        LoopbackOptions {
            remote: self.remote.clone().or_else(|| defaults.remote.clone()),
            group: Some(group),
            channels: self.channels.unwrap_or(defaults.channels),
            channel_map: self
                .channel_map
                .clone()
                .or_else(|| defaults.channel_map.clone()),
            latency_ms: self.latency.or(defaults.latency_ms),
            rate: defaults.rate,
            capture_target: self.capture.clone(),
            playback_target: self.playback.clone(),
            capture_props: self.capture_props.clone(),
            playback_props: self.playback_props.clone(),
        }
    }
}

fn default_group(argv0: &str) -> String {
    format!("{}-{}", argv0, std::process::id())
}

fn program_name() -> String {
    std::env::args()
        .next()
        .unwrap_or_else(|| "pw-loopback".to_string())
}

fn print_version(argv0: &str) {
    println!("{argv0}");
    println!("pwloop {}", env!("CARGO_PKG_VERSION"));
    #[cfg(feature = "pipewire")]
    println!(
        "Linked with libpipewire {}",
        pwloop::backend::pipewire::library_version()
    );
    #[cfg(not(feature = "pipewire"))]
    println!("Built without PipeWire support");
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let argv0 = program_name();
    let cli = Cli::parse_with_defaults(&argv0);
    if cli.version {
        print_version(&argv0);
        return ExitCode::SUCCESS;
    }

    let (config, sources) = match LoopConfig::load_with_sources_from(cli.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("{argv0}: {e}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&config.log.level);
    debug!(files = ?sources.files, env = ?sources.env_overrides, "configuration loaded");

    match run(&argv0, &cli, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(argv0: &str, cli: &Cli, config: &LoopConfig) -> Result<()> {
    let options = cli.options(argv0, &config.loopback);
    let plan = options.resolve().context("invalid arguments")?;

    let event_loop = EventLoop::new().context("failed to create event loop")?;
    for signum in [libc::SIGINT, libc::SIGTERM] {
        let handle = event_loop.handle();
        event_loop
            .add_signal(signum, move |signal| {
                info!(signal, "signal received, shutting down");
                handle.quit();
            })
            .with_context(|| format!("failed to watch signal {signum}"))?;
    }

    #[cfg(feature = "pipewire")]
    {
        let daemon = pwloop::backend::pipewire::PipeWireDaemon::new();
        serve(&event_loop, &daemon, options.remote.as_deref(), plan)
    }

    #[cfg(not(feature = "pipewire"))]
    {
        use pwloop::backend::memory::{MemoryDaemon, DEFAULT_QUANTUM};

        warn!("built without PipeWire support; looping through an in-process graph");
        let daemon = MemoryDaemon::new();
        if let Some(remote) = &options.remote {
            daemon.add_remote(remote);
        }
        for target in [&plan.capture.target, &plan.playback.target].into_iter().flatten() {
            daemon.add_node(target);
        }
        let period = std::time::Duration::from_micros(
            u64::from(DEFAULT_QUANTUM) * 1_000_000 / u64::from(plan.rate),
        );
        let _clock = daemon
            .spawn_clock(period)
            .context("failed to start graph clock")?;
        serve(&event_loop, &daemon, options.remote.as_deref(), plan)
    }
}

fn serve<D: Daemon>(
    event_loop: &EventLoop,
    daemon: &D,
    remote: Option<&str>,
    plan: StreamPlan,
) -> Result<()> {
    let session = Session::connect(event_loop, daemon, remote)
        .with_context(|| format!("can't connect to {}", remote.unwrap_or("the default daemon")))?;
    session.quit_on_broken_pipe();

    let engine = LoopbackEngine::start(&session, plan).context("failed to start loopback")?;

    event_loop.run().context("event loop failed")?;

    let broken = session.is_pipe_broken();
    if broken {
        info!("daemon closed the connection");
    }

    let shutdown = engine.shutdown();
    let stats = engine.stats().snapshot();
    drop(engine);
    let disconnect = session.disconnect();
    info!(
        ticks = stats.ticks,
        forwarded = stats.forwarded,
        underruns = stats.underruns,
        overruns = stats.overruns,
        "loopback finished"
    );

    match shutdown.and(disconnect) {
        Ok(()) => Ok(()),
        Err(e) if broken => {
            warn!("teardown after daemon exit: {e}");
            Ok(())
        }
        Err(e) => Err(e).context("teardown failed"),
    }
}
