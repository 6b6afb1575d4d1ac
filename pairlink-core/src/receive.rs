//! Background receive loop: poll the session, forward non-empty payloads, sleep, repeat.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::session::ConnectionSession;

/// Handle to a running loop. The stop flag is checked between polls; a read already in
/// flight is not interrupted. Dropping the handle detaches the loop, which still ends
/// once the session leaves the connected state.
pub struct ReceiveLoop {
    running: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl ReceiveLoop {
    /// Spawn the loop on the current tokio runtime. Fails with `NotConnected` unless the
    /// session is connected.
    pub fn start<F>(session: Arc<ConnectionSession>, consumer: F) -> Result<Self, SessionError>
    where
        F: Fn(Vec<u8>) + Send + Sync + 'static,
    {
        if !session.is_connected() {
            return Err(SessionError::NotConnected);
        }
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let poll_interval = session.config().poll_interval;
        let task = tokio::spawn(async move {
            debug!("receive loop started");
            while flag.load(Ordering::Acquire) {
                if !session.is_connected() {
                    debug!("session no longer connected");
                    break;
                }
                if let Some(data) = session.receive_once().await {
                    // Re-check: stop() may have landed during the read.
                    if !data.is_empty() && flag.load(Ordering::Acquire) {
                        consumer(data);
                    }
                }
                tokio::time::sleep(poll_interval).await;
            }
            flag.store(false, Ordering::Release);
            debug!("receive loop stopped");
        });
        Ok(Self { running, task })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.task.is_finished()
    }

    /// Wait for the task to end. Call `stop` first or this waits for the session to close.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!(error = %e, "receive loop task failed");
        }
    }
}
