//! Background session worker.
//!
//! One periodic heartbeat drives two things: an event for embedders to
//! refetch user-dependent data, and a silent token refresh attempt. The
//! refresh attempt is unconditionally issued; the session's own guards make
//! it a no-op when there is nothing to refresh.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::session::{AuthEvent, AuthSession};

/// Default interval between heartbeats.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

/// Handle to the spawned heartbeat task.
///
/// Dropping the handle aborts the task; [`SessionWorker::shutdown`] stops it
/// cleanly and waits for it to finish.
#[derive(Debug)]
pub struct SessionWorker {
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl SessionWorker {
    /// Spawn the heartbeat loop on the current runtime.
    pub fn spawn(session: Arc<AuthSession>, heartbeat: Duration) -> Self {
        let (shutdown, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first interval tick completes immediately; the heartbeat
            // starts one full period after spawn.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        session.emit(AuthEvent::Heartbeat);
                        if let Err(e) = session.refresh_tokens().await {
                            // The session already invalidated itself and
                            // emitted the event; nothing to do but log.
                            warn!(err = %e, "background token refresh failed");
                        }
                    }
                    _ = stopped.changed() => {
                        if *stopped.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("session worker stopped");
        });
        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    /// Stop the loop and wait for the task to exit.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for SessionWorker {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}
