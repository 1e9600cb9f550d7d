//! Headless camera viewer and one-shot health check.

use chrono::Local;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::capture::{LiveFrameSource, OpenOutcome, ReconnectPolicy, SourceError, SourceStatus};
use crate::config::ViewerConfig;

/// Keeps a source open forever and counts what comes out of it
pub struct Viewer {
    source: LiveFrameSource,
    frame_log_interval: u64,
    frames: u64,
    last_size: Option<(u32, u32)>,
}

impl Viewer {
    pub fn new(source: LiveFrameSource, config: &ViewerConfig) -> Self {
        Self {
            source,
            frame_log_interval: config.frame_log_interval.max(1),
            frames: 0,
            last_size: None,
        }
    }

    /// Frames seen so far, across reconnects
    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn last_size(&self) -> Option<(u32, u32)> {
        self.last_size
    }

    /// Error from the latest open attempt, if that attempt failed
    pub fn last_open_error(&self) -> Option<&str> {
        match &self.source.state().last_outcome {
            Some(OpenOutcome::Failed(err)) => Some(err.as_str()),
            _ => None,
        }
    }

    /// Read until `stop` fires or the source gives up. With a forever
    /// reconnect policy only `stop` ends it.
    pub async fn run(&mut self, stop: &CancellationToken) -> Result<(), SourceError> {
        info!("viewing {}", self.source.label());
        loop {
            let next = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                next = self.source.next() => next?,
            };
            let Some(frame) = next else {
                info!("{} ended", self.source.label());
                break;
            };

            self.frames += 1;
            self.last_size = Some((frame.width(), frame.height()));
            if self.frames % self.frame_log_interval == 0 {
                println!(
                    "[{}] 🎥 {} frames received ({}x{})",
                    timestamp(),
                    self.frames,
                    frame.width(),
                    frame.height()
                );
            }
        }
        self.source.close();
        Ok(())
    }
}

/// Open the source within the policy's attempts and read one frame.
/// Returns its size, or None if the source opened but had nothing to give.
pub async fn probe(source: &mut LiveFrameSource) -> Result<Option<(u32, u32)>, SourceError> {
    source.open().await?;
    let frame = source.next().await?;
    source.close();
    Ok(frame.map(|f| (f.width(), f.height())))
}

/// Probe policy: `attempts` tries with the usual fixed delay in between
pub fn probe_policy(config: &ViewerConfig, attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy::bounded(config.reconnect_delay, attempts)
}

pub fn status_line(status: &SourceStatus) -> String {
    let body = match status {
        SourceStatus::OpenFailed {
            attempt,
            error,
            retry_in: Some(delay),
        } => format!(
            "⚠️  Could not open source (attempt {}): {}. Retrying in {:.0}s",
            attempt,
            error,
            delay.as_secs_f64()
        ),
        SourceStatus::OpenFailed {
            attempt,
            error,
            retry_in: None,
        } => format!("❌ Could not open source (attempt {}): {}. Giving up", attempt, error),
        SourceStatus::Opened { reconnect: false } => "✅ Source opened".to_string(),
        SourceStatus::Opened { reconnect: true } => "🔄 Reconnected".to_string(),
        SourceStatus::Disconnected { reason } => format!("⚠️  Lost source: {}", reason),
    };
    format!("[{}] {}", timestamp(), body)
}

/// Print every status event until the sending side is gone
pub fn spawn_status_printer(mut status_rx: mpsc::UnboundedReceiver<SourceStatus>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(status) = status_rx.recv().await {
            eprintln!("{}", status_line(&status));
        }
    })
}

fn timestamp() -> String {
    Local::now().format("%H:%M:%S").to_string()
}
