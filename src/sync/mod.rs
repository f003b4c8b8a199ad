//! Status synchronization against a running gradeprobe server.
//!
//! The refresh protocol tolerates the gap between a write being accepted
//! and its run becoming visible: a NotFound response is retried with a
//! linearly growing delay before being reported, so observers do not
//! flash an error for a run that was created milliseconds ago.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::pipeline::stage::Stage;
use crate::registry::run::{ProcessingStats, RunStatus, StageRecord, StructuredData};

/// Errors that can occur while refreshing run status.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The run was still not visible after the whole retry budget.
    #[error("Run {0} not found after {1} attempts")]
    NotFound(Uuid, u32),

    /// The server answered with an unexpected status code.
    #[error("Server returned HTTP {0}")]
    Http(u16),

    /// Transport-level failure.
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Status projection returned by the server's status endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StatusView {
    pub id: Uuid,
    pub status: RunStatus,
    pub current_stage: Stage,
    pub stages: Vec<StageRecord>,
    #[serde(default)]
    pub structured_data: StructuredData,
    pub processing_stats: ProcessingStats,
    pub updated_at: DateTime<Utc>,
}

/// Controls one refresh call.
#[derive(Debug, Clone)]
pub struct RefreshOptions {
    /// Quiet refreshes leave the shared loading flag alone; loud ones
    /// raise it for the duration of the call.
    pub quiet: bool,
    /// NotFound retries after the initial attempt.
    pub retries: u32,
    /// Base delay of the linear backoff: attempt `n` sleeps `n * delay`.
    pub retry_delay: Duration,
}

impl Default for RefreshOptions {
    fn default() -> Self {
        Self {
            quiet: false,
            retries: 4,
            retry_delay: Duration::from_millis(250),
        }
    }
}

impl RefreshOptions {
    /// Options for background polling: no loading indication.
    pub fn quiet() -> Self {
        Self {
            quiet: true,
            ..Self::default()
        }
    }
}

/// Lowers the loading flag when a loud refresh ends, normally or not.
struct LoadingGuard {
    flag: Arc<AtomicBool>,
}

impl LoadingGuard {
    fn raise(flag: &Arc<AtomicBool>) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self {
            flag: Arc::clone(flag),
        }
    }
}

impl Drop for LoadingGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// HTTP client for the server's status endpoint.
#[derive(Debug, Clone)]
pub struct StatusClient {
    http: reqwest::Client,
    base_url: String,
    loading: Arc<AtomicBool>,
}

impl StatusClient {
    /// Creates a client against a server base URL such as
    /// `http://127.0.0.1:8080`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            loading: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The shared loading flag raised during loud refreshes.
    pub fn loading_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.loading)
    }

    /// Fetches the current status projection of a run.
    ///
    /// NotFound responses are retried `options.retries` times with a
    /// linearly growing delay; any other non-success status fails
    /// immediately.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::NotFound` when the retry budget is exhausted,
    /// `SyncError::Http` for other error statuses, `SyncError::Transport`
    /// for connection failures.
    pub async fn refresh(
        &self,
        run_id: Uuid,
        options: &RefreshOptions,
    ) -> Result<StatusView, SyncError> {
        let _guard = (!options.quiet).then(|| LoadingGuard::raise(&self.loading));
        let url = format!("{}/pipeline/{}/status", self.base_url, run_id);

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let response = self.http.get(&url).send().await?;
            let status = response.status();

            if status.is_success() {
                return Ok(response.json::<StatusView>().await?);
            }

            if status.as_u16() == 404 {
                if attempt > options.retries {
                    return Err(SyncError::NotFound(run_id, attempt));
                }
                let delay = options.retry_delay * attempt;
                debug!(
                    run_id = %run_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Run not visible yet, retrying"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            return Err(SyncError::Http(status.as_u16()));
        }
    }
}

/// Periodically refreshes a run's status and publishes it on a watch
/// channel. Stops itself once the run reaches a terminal status.
pub struct StatusPoller {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    receiver: watch::Receiver<Option<StatusView>>,
}

impl StatusPoller {
    /// Starts polling a run at the given interval.
    pub fn start(client: StatusClient, run_id: Uuid, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let (sender, receiver) = watch::channel(None);

        let stop_flag = Arc::clone(&stop);
        let handle = tokio::spawn(async move {
            let options = RefreshOptions::quiet();
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if stop_flag.load(Ordering::SeqCst) {
                    break;
                }
                match client.refresh(run_id, &options).await {
                    Ok(view) => {
                        let terminal = view.status.is_terminal();
                        if sender.send(Some(view)).is_err() {
                            break;
                        }
                        if terminal {
                            debug!(run_id = %run_id, "Run reached terminal status, stopping poller");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(run_id = %run_id, error = %e, "Status refresh failed");
                    }
                }
            }
        });

        Self {
            stop,
            handle: Some(handle),
            receiver,
        }
    }

    /// A receiver of the latest observed status.
    pub fn subscribe(&self) -> watch::Receiver<Option<StatusView>> {
        self.receiver.clone()
    }

    /// Signals the polling task to stop.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

impl Drop for StatusPoller {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
