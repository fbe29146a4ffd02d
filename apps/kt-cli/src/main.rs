use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use device_engine::{DeviceEngine, EngineConfig, SimulatedImu};
use knee_protocol::{parse_line, Command, DeviceMessage, TelemetryFrame};
use link_transport::{
    LinkConfig, LinkDriver, LinkEvent, LinkTransport, MemoryPortRegistry, MockDriver, SerialDriver,
};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "kt",
    version,
    about = "KneeTrack sensor CLI",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Backend {
    Mock,
    Serial,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List candidate sensor ports
    Ports {
        #[arg(long, value_enum, default_value_t = Backend::Serial)]
        backend: Backend,
        /// Print JSON instead of a table
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
    },
    /// Classify one device line and print it as JSON
    Decode {
        /// The line as received, e.g. 'SESSION_STARTED:abc'
        line: String,
    },
    /// Run the device engine against a synthetic IMU and print its output
    Simulate {
        /// Number of ticks after boot
        #[arg(long, default_value_t = 100u32)]
        ticks: u32,
        /// Start a session with this id before the first tick
        #[arg(long)]
        session: Option<String>,
        /// Exercise mode code (0 flexion, 1 extension, 2 lateral)
        #[arg(long, default_value_t = 0u8)]
        mode: u8,
        #[arg(long, default_value_t = 50u64)]
        tick_ms: u64,
        #[arg(long, default_value_t = 7u64)]
        seed: u64,
        /// Sleep one tick period between ticks
        #[arg(long, action = ArgAction::SetTrue)]
        realtime: bool,
    },
    /// Open a port, optionally start a session, and print what arrives
    Monitor {
        #[arg(long, default_value = "sim0")]
        port: String,
        #[arg(long, value_enum, default_value_t = Backend::Mock)]
        backend: Backend,
        #[arg(long, default_value_t = 115_200u32)]
        baud: u32,
        /// Lines to read before exiting (0 until Ctrl-C)
        #[arg(long, default_value_t = 50u32)]
        count: u32,
        /// Start a session; an id is generated when the flag has no value
        #[arg(long, num_args = 0..=1, default_missing_value = "")]
        session: Option<String>,
        #[arg(long, default_value_t = 0u8)]
        mode: u8,
        /// Write telemetry frames to a JSONL file
        #[arg(long)]
        to: Option<String>,
    },
    /// Send one command and print replies
    Send {
        #[arg(long, default_value = "sim0")]
        port: String,
        #[arg(long, value_enum, default_value_t = Backend::Mock)]
        backend: Backend,
        #[arg(long, default_value_t = 115_200u32)]
        baud: u32,
        /// How long to wait for SYSTEM_READY after opening
        #[arg(long, default_value_t = 3_000u64)]
        ready_ms: u64,
        /// How long to print replies
        #[arg(long, default_value_t = 500u64)]
        listen_ms: u64,
        #[command(subcommand)]
        command: DeviceCmd,
    },
}

#[derive(Subcommand, Debug, Clone)]
enum DeviceCmd {
    /// START_SESSION; an id is generated when omitted
    Start {
        #[arg(long)]
        session: Option<String>,
    },
    /// STOP_SESSION
    Stop,
    /// SET_EXERCISE
    Exercise { mode: u8 },
    /// CALIBRATE
    Calibrate,
    /// GET_STATUS
    Status,
}

impl DeviceCmd {
    fn to_command(&self) -> Command {
        match self {
            DeviceCmd::Start { session } => {
                Command::StartSession(session.clone().unwrap_or_else(new_session_id))
            }
            DeviceCmd::Stop => Command::StopSession,
            DeviceCmd::Exercise { mode } => Command::SetExercise(*mode),
            DeviceCmd::Calibrate => Command::Calibrate,
            DeviceCmd::Status => Command::GetStatus,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Ports { backend, json } => ports(backend, json).await,
        Commands::Decode { line } => decode(&line),
        Commands::Simulate {
            ticks,
            session,
            mode,
            tick_ms,
            seed,
            realtime,
        } => simulate(ticks, session.as_deref(), mode, tick_ms, seed, realtime).await,
        Commands::Monitor {
            port,
            backend,
            baud,
            count,
            session,
            mode,
            to,
        } => monitor(&port, backend, baud, count, session, mode, to.as_deref()).await,
        Commands::Send {
            port,
            backend,
            baud,
            ready_ms,
            listen_ms,
            command,
        } => send(&port, backend, baud, ready_ms, listen_ms, &command).await,
    }
}

fn setup_tracing() {
    // Best-effort; avoid panics if already set
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}

fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn driver_for(backend: Backend) -> Arc<dyn LinkDriver> {
    match backend {
        Backend::Mock => Arc::new(MockDriver::default()),
        Backend::Serial => Arc::new(SerialDriver::new()),
    }
}

fn open_transport(backend: Backend, baud: u32) -> (LinkTransport, mpsc::UnboundedReceiver<LinkEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let config = LinkConfig {
        baud_rate: baud,
        ..LinkConfig::default()
    };
    let transport = LinkTransport::new(
        driver_for(backend),
        Arc::new(MemoryPortRegistry::new()),
        config,
        tx,
    );
    (transport, rx)
}

async fn ports(backend: Backend, json: bool) -> Result<()> {
    let (transport, _rx) = open_transport(backend, 115_200);
    let ports = transport.list_available_ports().await;
    if json {
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }
    if ports.is_empty() {
        eprintln!("no ports found");
    }
    for p in ports {
        let usb = match (p.vid, p.pid) {
            (Some(v), Some(d)) => format!("{v:04x}:{d:04x}"),
            _ => "-".to_string(),
        };
        println!(
            "{}\t{}\t{}\t{}",
            p.path,
            p.driver,
            usb,
            p.product.or(p.manufacturer).unwrap_or_default()
        );
    }
    Ok(())
}

/// JSON view of a classified line.
#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Decoded<'a> {
    Telemetry { frame: &'a TelemetryFrame },
    SessionStarted { session_id: &'a str },
    SessionStopped,
    Calibrating,
    CalibrationComplete,
    SystemReady,
    Status { status: &'a knee_protocol::DeviceStatus },
    Diagnostic { text: &'a str },
}

fn decoded(msg: &DeviceMessage) -> Decoded<'_> {
    match msg {
        DeviceMessage::Telemetry(frame) => Decoded::Telemetry { frame },
        DeviceMessage::SessionStarted(id) => Decoded::SessionStarted { session_id: id },
        DeviceMessage::SessionStopped => Decoded::SessionStopped,
        DeviceMessage::Calibrating => Decoded::Calibrating,
        DeviceMessage::CalibrationComplete => Decoded::CalibrationComplete,
        DeviceMessage::SystemReady => Decoded::SystemReady,
        DeviceMessage::Status(status) => Decoded::Status { status },
        DeviceMessage::Diagnostic(text) => Decoded::Diagnostic { text },
    }
}

fn decode(line: &str) -> Result<()> {
    let msg = parse_line(line).with_context(|| format!("rejected line: {line}"))?;
    println!("{}", serde_json::to_string_pretty(&decoded(&msg))?);
    Ok(())
}

async fn simulate(
    ticks: u32,
    session: Option<&str>,
    mode: u8,
    tick_ms: u64,
    seed: u64,
    realtime: bool,
) -> Result<()> {
    let config = EngineConfig {
        tick_ms,
        ..EngineConfig::default()
    };
    let imu = SimulatedImu::new(seed, tick_ms as f32 / 1000.0)
        .with_still_samples(config.calibration_samples);
    let mut engine = DeviceEngine::new(imu, config).context("building device engine")?;
    let mut out = std::io::stdout().lock();
    for msg in engine.boot() {
        out.write_all(msg.encode()?.as_bytes())?;
    }

    let mut pending = vec![Command::SetExercise(mode).encode()?];
    if let Some(id) = session {
        pending.push(Command::StartSession(id.to_string()).encode()?);
    }
    for i in 0..ticks {
        let now_ms = (i as u64 + 1) * tick_ms;
        for msg in engine.step(now_ms, pending.drain(..)) {
            out.write_all(msg.encode()?.as_bytes())?;
        }
        if realtime {
            out.flush()?;
            tokio::time::sleep(Duration::from_millis(tick_ms)).await;
        }
    }
    out.flush()?;
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FrameRecord<'a> {
    received_at: String,
    #[serde(flatten)]
    frame: &'a TelemetryFrame,
}

async fn monitor(
    port: &str,
    backend: Backend,
    baud: u32,
    count: u32,
    session: Option<String>,
    mode: u8,
    to: Option<&str>,
) -> Result<()> {
    let mut writer = match to {
        Some(path) => Some(BufWriter::new(
            File::create(path).with_context(|| format!("creating {path}"))?,
        )),
        None => None,
    };
    let (transport, mut rx) = open_transport(backend, baud);
    transport
        .connect(port, Some(baud))
        .await
        .with_context(|| format!("opening {port}"))?;
    info!(port, "monitoring");

    if let Some(id) = session {
        let id = if id.is_empty() { new_session_id() } else { id };
        eprintln!("session {id}");
        transport
            .send_line(&Command::SetExercise(mode).encode()?)
            .await?;
        transport
            .send_line(&Command::StartSession(id).encode()?)
            .await?;
    }

    let mut seen = 0u32;
    loop {
        let event = tokio::select! {
            ev = rx.recv() => ev,
            _ = tokio::signal::ctrl_c() => break,
        };
        let Some(event) = event else { break };
        match event {
            LinkEvent::Line(line) => {
                println!("{line}");
                if let (Some(w), Ok(DeviceMessage::Telemetry(frame))) = (writer.as_mut(), parse_line(&line)) {
                    let record = FrameRecord {
                        received_at: OffsetDateTime::now_utc().format(&Rfc3339)?,
                        frame: &frame,
                    };
                    serde_json::to_writer(&mut *w, &record)?;
                    w.write_all(b"\n")?;
                }
                seen += 1;
                if count > 0 && seen >= count {
                    break;
                }
            }
            LinkEvent::Disconnected { path, reason } => {
                warn!(%path, %reason, "link closed");
                break;
            }
            LinkEvent::Error(e) => warn!(error = %e, "link error"),
            LinkEvent::Connected { .. } => {}
        }
    }
    if let Some(mut w) = writer {
        w.flush()?;
    }
    transport.disconnect().await?;
    Ok(())
}

async fn send(
    port: &str,
    backend: Backend,
    baud: u32,
    ready_ms: u64,
    listen_ms: u64,
    cmd: &DeviceCmd,
) -> Result<()> {
    let (transport, mut rx) = open_transport(backend, baud);
    transport
        .connect(port, Some(baud))
        .await
        .with_context(|| format!("opening {port}"))?;

    // Boards reset on open; give the boot sequence a chance to finish.
    let ready = tokio::time::timeout(Duration::from_millis(ready_ms), async {
        while let Some(ev) = rx.recv().await {
            if let LinkEvent::Line(line) = ev {
                println!("{line}");
                if matches!(parse_line(&line), Ok(DeviceMessage::SystemReady)) {
                    return true;
                }
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    if !ready {
        warn!("no SYSTEM_READY from device; sending anyway");
    }

    let command = cmd.to_command();
    let line = command.encode()?;
    transport.send_line(&line).await.context("sending command")?;
    eprintln!("> {}", line.trim_end());

    let _ = tokio::time::timeout(Duration::from_millis(listen_ms), async {
        while let Some(ev) = rx.recv().await {
            if let LinkEvent::Line(line) = ev {
                println!("{line}");
            }
        }
    })
    .await;
    transport.disconnect().await?;
    Ok(())
}
