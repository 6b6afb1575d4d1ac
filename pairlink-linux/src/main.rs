// pairlink Linux daemon: LAN discovery, TCP transport, interactive and timed sessions.

mod config;
mod discovery;
mod transport;

use std::io::Write;
use std::sync::Arc;

use pairlink_core::{
    AllowAll, ConnectionSession, DeviceLink, DiscoveryEvent, SessionError, SERVICE_ID,
};
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const USAGE: &str = "usage: pairlink-linux [--version] <connect NAME | fetch NAME | serve>";

#[derive(Debug, PartialEq, Eq)]
enum Mode {
    /// Discover NAME, connect, print payloads, send stdin lines.
    Connect(String),
    /// Discover NAME once, then reconnect on the fetch schedule.
    Fetch(String),
    /// Advertise this host and echo for connecting peers.
    Serve,
}

/// `Ok(None)` means print the version and exit.
fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Option<Mode>, &'static str> {
    let args: Vec<String> = args.into_iter().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        return Ok(None);
    }
    let mut it = args.into_iter();
    match (it.next().as_deref(), it.next(), it.next()) {
        (Some("connect"), Some(name), None) => Ok(Some(Mode::Connect(name))),
        (Some("fetch"), Some(name), None) => Ok(Some(Mode::Fetch(name))),
        (Some("serve"), None, None) => Ok(Some(Mode::Serve)),
        _ => Err(USAGE),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mode = match parse_args(std::env::args().skip(1)) {
        Ok(Some(mode)) => mode,
        Ok(None) => {
            println!("pairlink-linux {}", VERSION);
            return Ok(());
        }
        Err(usage) => {
            eprintln!("{}", usage);
            std::process::exit(2);
        }
    };

    let cfg = config::load();
    init_logging(&cfg);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        match mode {
            Mode::Connect(name) => run_connect(&cfg, &name).await,
            Mode::Fetch(name) => run_fetch(&cfg, &name).await,
            Mode::Serve => run_serve(&cfg).await,
        }
    })
}

/// RUST_LOG wins over the config file's `log_filter`; default `info`. Logs go to stderr,
/// stdout carries payloads.
fn init_logging(cfg: &config::Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.log_filter.as_deref().unwrap_or("info")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

struct Wiring {
    link: Arc<DeviceLink>,
    discovered: UnboundedReceiver<DiscoveryEvent>,
    payloads: UnboundedReceiver<Vec<u8>>,
}

fn build_link(cfg: &config::Config) -> Wiring {
    let (found_tx, discovered) = mpsc::unbounded_channel();
    let (payload_tx, payloads) = mpsc::unbounded_channel();
    let scanner =
        discovery::UdpScanner::new(cfg.discovery_port, SERVICE_ID, cfg.scan_duration(), found_tx);
    let session = ConnectionSession::new(Arc::new(transport::TcpConnector), Arc::new(AllowAll))
        .with_scanner(scanner)
        .with_config(cfg.session_config());
    let link = DeviceLink::new(Arc::new(session)).with_payload_channel(payload_tx);
    Wiring {
        link: Arc::new(link),
        discovered,
        payloads,
    }
}

/// Scan until `name` shows up or the scan finishes.
async fn discover(
    link: &DeviceLink,
    events: &mut UnboundedReceiver<DiscoveryEvent>,
    name: &str,
) -> Result<(), SessionError> {
    link.start_discovery()?;
    while let Some(event) = events.recv().await {
        let finished = event == DiscoveryEvent::Finished;
        link.on_discovery_event(event);
        if link.session().paired_devices().resolve(name).is_some() {
            return Ok(());
        }
        if finished {
            break;
        }
    }
    warn!(device = name, seen = ?link.events().device_names(), "device not found");
    Err(SessionError::NotFound(name.to_owned()))
}

/// Print every received chunk to stdout and log notices.
fn spawn_reporters(link: &DeviceLink, mut payloads: UnboundedReceiver<Vec<u8>>) {
    tokio::spawn(async move {
        while let Some(chunk) = payloads.recv().await {
            let mut out = std::io::stdout().lock();
            let _ = out.write_all(&chunk);
            let _ = out.flush();
        }
    });
    let mut notices = link.events().subscribe_notices();
    tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(notice) => info!(?notice, "session notice"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "notices lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn run_connect(cfg: &config::Config, name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let Wiring {
        link,
        mut discovered,
        payloads,
    } = build_link(cfg);
    spawn_reporters(&link, payloads);
    discover(&link, &mut discovered, name).await?;
    link.connect_to_device(name).await?;

    let sender = link.clone();
    let stdin_task = tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Err(e) = sender.send_text(&line).await {
                warn!(error = %e, "send failed");
            }
        }
    });

    let mut state = link.events().subscribe_state();
    tokio::select! {
        r = shutdown_signal() => r?,
        _ = state.wait_for(|s| !s.is_connected()) => warn!("connection lost"),
    }
    stdin_task.abort();
    link.disconnect().await;
    Ok(())
}

async fn run_fetch(cfg: &config::Config, name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let Wiring {
        link,
        mut discovered,
        payloads,
    } = build_link(cfg);
    spawn_reporters(&link, payloads);
    discover(&link, &mut discovered, name).await?;
    let record = link
        .session()
        .resolve_device_by_name(name)
        .ok_or_else(|| SessionError::NotFound(name.to_owned()))?;
    link.session().last_device_address().set(record.address);

    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(pairlink_core::run_timed_fetch(
        link.clone(),
        cfg.fetch_schedule(),
        stop_rx,
    ));
    shutdown_signal().await?;
    let _ = stop_tx.send(true);
    task.await?;
    Ok(())
}

async fn run_serve(cfg: &config::Config) -> Result<(), Box<dyn std::error::Error>> {
    let advertiser = tokio::spawn(discovery::run_advertiser(
        cfg.device_name.clone(),
        SERVICE_ID,
        cfg.discovery_port,
        cfg.transport_port,
    ));
    let mut server = tokio::spawn(transport::run_echo_server(cfg.transport_port, SERVICE_ID));
    tokio::select! {
        r = shutdown_signal() => r?,
        r = &mut server => r??,
    }
    advertiser.abort();
    server.abort();
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    info!("shutting down");
    Ok(())
}
