//! Background status polling.
//!
//! A [`FeedbackPoller`] is a tokio task bound to a session. Each cycle it
//! issues the configured status queries through the session's normal query
//! path, so it takes the transport lock fresh for every poll and never holds
//! it while sleeping. Results are published as [`FeedbackSample`]s on a
//! broadcast channel and cached per code.
//!
//! Lifecycle is `Stopped -> Running -> Stopped`: [`FeedbackPoller::spawn`]
//! starts the task, [`FeedbackPoller::stop`] signals it and waits a bounded
//! time for it to exit.

use crate::error::Reply;
use crate::session::SessionCore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// One status poll result.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackSample {
    /// Status query code (e.g. `DS`)
    pub code: String,
    /// Device reply; faults are kept as data
    pub reply: Reply,
    /// When the reply was received
    pub at: DateTime<Utc>,
}

/// Handle to a running poll task.
pub struct FeedbackPoller {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
    codes: Vec<String>,
    interval: Duration,
}

impl FeedbackPoller {
    /// Spawn the poll loop for `codes`, sleeping `interval` between cycles.
    pub(crate) fn spawn(core: Arc<SessionCore>, codes: Vec<String>, interval: Duration) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let task_codes = codes.clone();

        let handle = tokio::spawn(
            async move {
                tracing::debug!(codes = ?task_codes, ?interval, "Feedback poller started");

                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }

                    if core.is_connected() && !core.is_busy() && !core.is_feedback_paused() {
                        for code in &task_codes {
                            // A foreground command queued up since the last poll wins.
                            if *shutdown_rx.borrow() || core.is_busy() || core.is_feedback_paused() {
                                break;
                            }

                            match core.poll(code).await {
                                Ok(reply) => core.publish(code, reply),
                                Err(e) => tracing::warn!(code = %code, error = %e, "Feedback poll failed"),
                            }
                        }
                    }

                    tokio::select! {
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(interval) => {}
                    }
                }

                tracing::debug!("Feedback poller stopped");
            }
            .in_current_span(),
        );

        Self {
            shutdown,
            handle,
            codes,
            interval,
        }
    }

    /// Codes polled each cycle.
    pub fn codes(&self) -> &[String] {
        &self.codes
    }

    /// Pause between cycles.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether the task is still running.
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Signal the task and wait up to `join_timeout` for it to exit.
    ///
    /// Returns `false` if the task had to be aborted.
    pub async fn stop(self, join_timeout: Duration) -> bool {
        let _ = self.shutdown.send(true);
        let mut handle = self.handle;

        match tokio::time::timeout(join_timeout, &mut handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Feedback poller task ended abnormally");
                true
            }
            Err(_) => {
                tracing::warn!(
                    ?join_timeout,
                    "Feedback poller did not stop in time; aborting it"
                );
                handle.abort();
                false
            }
        }
    }
}

impl std::fmt::Debug for FeedbackPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedbackPoller")
            .field("codes", &self.codes)
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish()
    }
}
