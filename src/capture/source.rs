//! Reconnecting frame source.
//!
//! Opens a capture with fixed-delay retry, hands out sequence-numbered frames,
//! and on a failed read either reconnects (live cameras) or reports end of
//! stream (finite inputs). Blocking opens and reads run on tokio's blocking
//! pool so they never stall the session tasks.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::{Capture, CaptureError, CaptureOpener, Frame, SourceAddress};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{label} unavailable after {attempts} attempt(s): {last_error}")]
    Unavailable {
        label: String,
        attempts: u32,
        #[source]
        last_error: CaptureError,
    },

    #[error("read from {label} failed: {err}")]
    Read {
        label: String,
        #[source]
        err: CaptureError,
    },

    #[error("capture worker panicked")]
    Worker,
}

/// What to do when a read comes back empty or fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFailure {
    /// Close, wait the reconnect delay, open again
    Reconnect,
    /// Treat it as the end of the input
    EndOfStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    /// None retries forever
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    pub fn forever(delay: Duration) -> Self {
        Self { delay, max_attempts: None }
    }

    pub fn bounded(delay: Duration, attempts: u32) -> Self {
        Self {
            delay,
            max_attempts: Some(attempts.max(1)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    Opened,
    Failed(String),
}

/// Owned and mutated only by the source's open/read loop
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconnectState {
    pub consecutive_failures: u32,
    /// Delay that will be (or was last) applied before the next attempt
    pub current_delay: Duration,
    pub last_outcome: Option<OpenOutcome>,
}

/// Observable source lifecycle, published on the status channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceStatus {
    OpenFailed {
        attempt: u32,
        error: String,
        /// None when the policy gives up after this attempt
        retry_in: Option<Duration>,
    },
    Opened {
        reconnect: bool,
    },
    Disconnected {
        reason: String,
    },
}

pub struct LiveFrameSource {
    opener: Arc<dyn CaptureOpener>,
    label: String,
    policy: ReconnectPolicy,
    on_read_failure: ReadFailure,
    capture: Option<Box<dyn Capture>>,
    state: ReconnectState,
    seq: u64,
    ever_opened: bool,
    finished: bool,
    status_tx: Option<mpsc::UnboundedSender<SourceStatus>>,
}

impl LiveFrameSource {
    pub fn new(opener: Arc<dyn CaptureOpener>, label: impl Into<String>, policy: ReconnectPolicy) -> Self {
        Self {
            opener,
            label: label.into(),
            policy,
            on_read_failure: ReadFailure::Reconnect,
            capture: None,
            state: ReconnectState {
                current_delay: policy.delay,
                ..ReconnectState::default()
            },
            seq: 0,
            ever_opened: false,
            finished: false,
            status_tx: None,
        }
    }

    pub fn from_address(address: SourceAddress, policy: ReconnectPolicy) -> Self {
        let label = address.to_string();
        Self::new(Arc::new(address), label, policy)
    }

    pub fn on_read_failure(mut self, behavior: ReadFailure) -> Self {
        self.on_read_failure = behavior;
        self
    }

    pub fn with_status(mut self, status_tx: mpsc::UnboundedSender<SourceStatus>) -> Self {
        self.status_tx = Some(status_tx);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> &ReconnectState {
        &self.state
    }

    pub fn is_open(&self) -> bool {
        self.capture.is_some()
    }

    /// Open the capture, retrying after the fixed delay until it works or the
    /// policy runs out of attempts. Any previous handle is released first.
    pub async fn open(&mut self) -> Result<(), SourceError> {
        self.close();
        self.finished = false;

        loop {
            let opener = self.opener.clone();
            let result = tokio::task::spawn_blocking(move || opener.open())
                .await
                .map_err(|_| SourceError::Worker)?;

            match result {
                Ok(capture) => {
                    let reconnect = self.ever_opened;
                    self.capture = Some(capture);
                    self.seq = 0;
                    self.ever_opened = true;
                    self.state.consecutive_failures = 0;
                    self.state.current_delay = self.policy.delay;
                    self.state.last_outcome = Some(OpenOutcome::Opened);

                    if reconnect {
                        info!("reconnected to {}", self.label);
                    } else {
                        info!("opened {}", self.label);
                    }
                    self.emit(SourceStatus::Opened { reconnect });
                    return Ok(());
                }
                Err(e) => {
                    self.state.consecutive_failures += 1;
                    self.state.last_outcome = Some(OpenOutcome::Failed(e.to_string()));
                    let attempt = self.state.consecutive_failures;
                    let give_up = self.policy.max_attempts.is_some_and(|max| attempt >= max);

                    warn!("could not open {} (attempt {}): {}", self.label, attempt, e);
                    self.emit(SourceStatus::OpenFailed {
                        attempt,
                        error: e.to_string(),
                        retry_in: (!give_up).then_some(self.policy.delay),
                    });

                    if give_up {
                        return Err(SourceError::Unavailable {
                            label: self.label.clone(),
                            attempts: attempt,
                            last_error: e,
                        });
                    }
                    sleep(self.policy.delay).await;
                }
            }
        }
    }

    /// Next frame, or `Ok(None)` once the input has ended.
    ///
    /// Opens the source on first use. With `ReadFailure::Reconnect` a failed
    /// read closes the capture, waits the reconnect delay and reopens it;
    /// numbering then restarts at 1.
    pub async fn next(&mut self) -> Result<Option<Frame>, SourceError> {
        loop {
            if self.finished {
                return Ok(None);
            }
            let Some(mut capture) = self.capture.take() else {
                self.open().await?;
                continue;
            };

            let (capture, result) = tokio::task::spawn_blocking(move || {
                let result = capture.read();
                (capture, result)
            })
            .await
            .map_err(|_| SourceError::Worker)?;

            let reason = match result {
                Ok(Some(image)) => {
                    self.capture = Some(capture);
                    self.seq += 1;
                    return Ok(Some(Frame::new(self.seq, image)));
                }
                Ok(None) => None,
                Err(e) => Some(e),
            };

            // Release the handle before doing anything else
            drop(capture);

            match self.on_read_failure {
                ReadFailure::EndOfStream => {
                    self.finished = true;
                    return match reason {
                        None => Ok(None),
                        Some(err) => Err(SourceError::Read {
                            label: self.label.clone(),
                            err,
                        }),
                    };
                }
                ReadFailure::Reconnect => {
                    let reason = reason
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "no data".to_string());
                    warn!("lost {} ({}), reconnecting in {:?}", self.label, reason, self.policy.delay);
                    self.emit(SourceStatus::Disconnected { reason });
                    sleep(self.policy.delay).await;
                    self.open().await?;
                }
            }
        }
    }

    /// Release the capture handle. The next `next()` reopens it.
    pub fn close(&mut self) {
        if self.is_open() {
            debug!("releasing {}", self.label);
        }
        self.capture = None;
    }

    fn emit(&self, status: SourceStatus) {
        if let Some(tx) = &self.status_tx {
            let _ = tx.send(status);
        }
    }
}
