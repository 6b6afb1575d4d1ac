//! Timed fetch: on a fixed delay, reconnect to the last known device, collect payloads
//! for a bounded window, then disconnect.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::link::DeviceLink;

pub const DEFAULT_FETCH_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_FETCH_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct FetchSchedule {
    /// Delay between the end of one run and the start of the next.
    pub interval: Duration,
    /// How long each run stays connected.
    pub window: Duration,
    /// End a run as soon as the first payload arrives instead of waiting out the window.
    pub finish_on_payload: bool,
}

impl Default for FetchSchedule {
    fn default() -> Self {
        Self {
            interval: DEFAULT_FETCH_INTERVAL,
            window: DEFAULT_FETCH_WINDOW,
            finish_on_payload: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum FetchOutcome {
    NoAddress,
    /// Someone else holds the connection; a run never replaces it.
    Busy,
    ConnectFailed,
    Completed,
}

/// Run until `shutdown` becomes true (or its sender is dropped). The first run starts immediately.
pub async fn run_timed_fetch(
    link: Arc<DeviceLink>,
    schedule: FetchSchedule,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        interval_secs = schedule.interval.as_secs(),
        window_secs = schedule.window.as_secs(),
        "timed fetch started"
    );
    while !*shutdown.borrow() {
        let outcome = fetch_once(&link, &schedule, &mut shutdown).await;
        debug!(?outcome, "fetch run finished");
        tokio::select! {
            _ = tokio::time::sleep(schedule.interval) => {}
            _ = wait_shutdown(&mut shutdown) => break,
        }
    }
    link.disconnect().await;
    info!("timed fetch stopped");
}

pub(crate) async fn fetch_once(
    link: &DeviceLink,
    schedule: &FetchSchedule,
    shutdown: &mut watch::Receiver<bool>,
) -> FetchOutcome {
    let session = link.session();
    let Some(address) = session.last_device_address().get() else {
        warn!("no known device address; skipping fetch");
        return FetchOutcome::NoAddress;
    };
    if session.is_connected() {
        debug!("session busy; skipping fetch");
        return FetchOutcome::Busy;
    }
    let mut payloads = link.events().subscribe_payload();
    payloads.borrow_and_update();
    if let Err(e) = link.connect_address(&address).await {
        warn!(address = %address, error = %e, "fetch connect failed");
        return FetchOutcome::ConnectFailed;
    }
    tokio::select! {
        _ = tokio::time::sleep(schedule.window) => {}
        _ = next_payload(&mut payloads), if schedule.finish_on_payload => {
            debug!("payload received; ending run early");
        }
        _ = wait_shutdown(shutdown) => {}
    }
    link.disconnect().await;
    FetchOutcome::Completed
}

async fn next_payload(rx: &mut watch::Receiver<Option<String>>) {
    if rx.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    // A dropped sender counts as shutdown.
    let _ = rx.wait_for(|stop| *stop).await;
}
