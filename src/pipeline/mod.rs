//! Producer side of a live session: source → encoder → session.
//!
//! Frames go out in capture order, one at a time. A frame that fails to
//! encode is skipped with a warning. With a cadence set, the loop sleeps one
//! interval after every frame it actually sent; encode time is not
//! compensated.

use std::io::Write;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::capture::LiveFrameSource;
use crate::config::SessionConfig;
use crate::encode::FrameEncoder;
use crate::session::{SessionError, StreamSession};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReport {
    pub frames_read: u64,
    pub frames_sent: u64,
    pub frames_skipped: u64,
    /// Ended by the stop token rather than by the source or frame limit
    pub stopped: bool,
    /// Set when the source gave up instead of ending normally
    pub source_error: Option<String>,
}

/// Run the send loop until the source ends, `max_frames` is reached or
/// `stop` fires, then send the closing prompt. The caller closes the session.
pub async fn run_send_loop(
    session: &StreamSession,
    source: &mut LiveFrameSource,
    config: &SessionConfig,
    stop: &CancellationToken,
) -> Result<SendReport, SessionError> {
    let encoder = FrameEncoder::from_config(config);
    let interval = config.frame_interval();
    let mut report = SendReport::default();

    let prompt = config.prompt.trim();
    if !prompt.is_empty() {
        session.send_text(prompt).await?;
    }

    loop {
        if config.max_frames.is_some_and(|max| report.frames_read >= max) {
            debug!("frame limit reached");
            break;
        }

        let next = tokio::select! {
            biased;
            _ = stop.cancelled() => {
                report.stopped = true;
                break;
            }
            next = source.next() => next,
        };
        let frame = match next {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                warn!("frame source ended: {}", e);
                report.source_error = Some(e.to_string());
                break;
            }
        };
        report.frames_read += 1;

        let seq = frame.seq();
        let encoded = match tokio::task::spawn_blocking(move || encoder.encode(frame)).await {
            Ok(Ok(payload)) => payload,
            Ok(Err(e)) => {
                eprintln!("⚠️  Skipping frame {}: {}", seq, e);
                report.frames_skipped += 1;
                continue;
            }
            Err(e) => {
                warn!("encoder task failed on frame {}: {}", seq, e);
                report.frames_skipped += 1;
                continue;
            }
        };

        session.send_frame(&encoded).await?;
        report.frames_sent += 1;
        print!("📤 Sending frame {}…\r", seq);
        let _ = std::io::stdout().flush();

        if let Some(interval) = interval {
            tokio::select! {
                _ = stop.cancelled() => {
                    report.stopped = true;
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
    if report.frames_sent > 0 {
        println!();
    }

    let final_prompt = config.final_prompt.trim();
    if !final_prompt.is_empty() {
        session.send_text(final_prompt).await?;
    }

    Ok(report)
}
