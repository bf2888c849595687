//! `groove`: CLI glue binding a document on disk to a clock, an engine, a
//! MIDI sink, and the TCP control surface.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use log::{error, info, warn};

use groove_core::clock::{Clock, ExternalClock, ExternalClockOptions, InternalClock, TransportEvent};
use groove_core::conductor::Conductor;
use groove_core::config::Config;
use groove_core::engine::Engine;
use groove_core::sink::VirtualSink;
#[cfg(feature = "hardware")]
use groove_core::sink::MidirSink;
use groove_types::model::LoopDoc;

/// Every sink is boxed behind this alias so the rest of the binary doesn't
/// need to be generic over which one backs a given run.
type BoxSink = Box<dyn groove_core::sink::Sink + Send>;

#[derive(Parser, Debug)]
#[command(name = "groove", version, about = "Real-time MIDI groovebox conductor")]
struct Args {
    /// Path to the loop document to load and watch for external edits.
    #[arg(long = "loop")]
    loop_path: Option<PathBuf>,

    /// Substring matching the MIDI output port to open (requires the
    /// `hardware` feature; falls back to an in-memory sink otherwise).
    #[arg(long, env = "GROOVE_PORT")]
    port: Option<String>,

    /// Initial tempo in BPM, overriding the document's own `meta.tempo`.
    #[arg(long)]
    bpm: Option<f64>,

    /// Tick source: `internal` (free-running) or `external` (MIDI clock).
    #[arg(long, default_value = "internal")]
    clock_source: String,

    /// Control-surface bind address.
    #[arg(long, default_value = "127.0.0.1", env = "GROOVE_WS_HOST")]
    ws_host: String,

    /// Control-surface bind port.
    #[arg(long, default_value_t = 7878, env = "GROOVE_WS_PORT")]
    ws_port: u16,

    /// Reserved for a future status/health HTTP endpoint; accepted for CLI
    /// surface completeness but not yet served.
    #[arg(long)]
    http_port: Option<u16>,
}

const CONFIG_LOAD_FAILURE: i32 = 2;

fn main() {
    env_logger::init();
    let args = Args::parse();

    let config = Config::load();

    let doc = match load_initial_doc(&args, &config) {
        Ok(doc) => doc,
        Err(e) => {
            error!("failed to load loop document: {e}");
            std::process::exit(CONFIG_LOAD_FAILURE);
        }
    };

    if let Some(http_port) = args.http_port {
        warn!("--http-port {http_port} accepted but not served (no HTTP endpoint in this build)");
    }

    let bpm = args.bpm.unwrap_or(doc.meta.tempo);
    let ppq = doc.meta.ppq;

    let clock_source = args.clock_source.as_str();
    let clock = match clock_source {
        "internal" => Clock::Internal(InternalClock::new(ppq, bpm)),
        "external" => Clock::External(ExternalClock::new(ppq, ExternalClockOptions::default())),
        other => {
            error!("unknown clock source {other}, expected internal or external");
            std::process::exit(CONFIG_LOAD_FAILURE);
        }
    };

    let cc_limits = config.cc_limits();

    #[cfg(feature = "hardware")]
    let conductor: Arc<Conductor<BoxSink>> = if let Some(port_substr) = &args.port {
        match MidirSink::open(port_substr) {
            Ok(sink) => {
                let engine = Engine::new(Box::new(sink) as BoxSink, cc_limits);
                Arc::new(Conductor::new(engine, clock, args.loop_path.clone()))
            }
            Err(e) => {
                error!("failed to open MIDI port {port_substr}: {e}");
                std::process::exit(CONFIG_LOAD_FAILURE);
            }
        }
    } else {
        let engine = Engine::new(Box::new(VirtualSink::new()) as BoxSink, cc_limits);
        Arc::new(Conductor::new(engine, clock, args.loop_path.clone()))
    };

    #[cfg(not(feature = "hardware"))]
    let conductor: Arc<Conductor<BoxSink>> = {
        if args.port.is_some() {
            warn!("--port given but this build has no `hardware` feature; using an in-memory sink");
        }
        let engine = Engine::new(Box::new(VirtualSink::new()) as BoxSink, cc_limits);
        Arc::new(Conductor::new(engine, clock, args.loop_path.clone()))
    };

    conductor.bootstrap(doc);

    let addr = format!("{}:{}", args.ws_host, args.ws_port);
    let mut server = match groove_net::Server::bind(&addr, conductor.clone()) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to bind control surface on {addr}: {e}");
            std::process::exit(CONFIG_LOAD_FAILURE);
        }
    };
    info!("groove listening on {addr}, clock_source={clock_source}");

    run_loop(&conductor, &mut server, config.file_poll_interval_ms());
}

fn load_initial_doc(args: &Args, config: &Config) -> Result<LoopDoc, String> {
    match &args.loop_path {
        Some(path) => {
            let contents = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
            serde_json::from_str(&contents).map_err(|e| e.to_string())
        }
        None => Ok(LoopDoc {
            version: "1".to_string(),
            doc_version: 1,
            meta: groove_types::model::Meta {
                tempo: config.default_bpm(),
                ppq: config.default_ppq(),
                steps_per_bar: config.default_steps_per_bar(),
                key: None,
                mode: None,
            },
            device_profile: groove_types::model::DeviceProfile::default(),
            tracks: Vec::new(),
        }),
    }
}

/// Drives the engine and control surface forever: a free-running internal
/// clock sleeps toward its own expected tick interval; file-edit polling and
/// broadcast housekeeping run on a slower, fixed cadence alongside it.
fn run_loop(conductor: &Arc<Conductor<BoxSink>>, server: &mut groove_net::Server<BoxSink>, file_poll_ms: u64) {
    let mut last_housekeeping = Instant::now();
    let housekeeping_interval = Duration::from_millis(file_poll_ms.max(50));

    loop {
        server.accept_connections();
        let doc_changed = server.poll_commands();
        if doc_changed {
            server.broadcast_doc();
        }

        if let Some(interval) = conductor.internal_tick_interval() {
            std::thread::sleep(interval);
            if let Some(tick) = conductor.advance_internal_clock(interval) {
                conductor.tick(tick);
            }
        } else {
            // External clock: nothing to sleep toward here without a real
            // MIDI input port; yield briefly so the accept/command loop
            // still makes progress.
            std::thread::sleep(Duration::from_millis(5));
        }

        if last_housekeeping.elapsed() >= housekeeping_interval {
            last_housekeeping = Instant::now();
            if conductor.poll_file_edit() {
                server.broadcast_doc();
            }
            server.broadcast_state();
            server.broadcast_metrics(server.client_count());
        }
    }
}

#[allow(dead_code)]
fn feed_external_transport(conductor: &Conductor<BoxSink>, event: TransportEvent) {
    let ticks = conductor.handle_transport_event(event, Instant::now());
    for tick in ticks {
        conductor.tick(tick);
    }
}
