//! Display capture via scrap.
//!
//! `scrap::Capturer` is !Send on X11, so it lives on a dedicated thread for
//! its whole life. Each `read()` asks that thread for one fresh frame, which
//! keeps at most a single frame in flight.

use image::RgbImage;
use scrap::{Capturer, Display};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing::debug;

use super::{Capture, CaptureError};

/// Give up on a display that keeps returning WouldBlock for this long
const FRAME_TIMEOUT: Duration = Duration::from_secs(2);

pub struct ScreenCapture {
    request_tx: Option<mpsc::SyncSender<()>>,
    frame_rx: mpsc::Receiver<Option<RgbImage>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl ScreenCapture {
    /// Start a capture thread for display `index` (0 = primary)
    pub fn open(index: usize) -> Result<Self, CaptureError> {
        let (request_tx, request_rx) = mpsc::sync_channel::<()>(1);
        let (frame_tx, frame_rx) = mpsc::sync_channel::<Option<RgbImage>>(1);
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), String>>();

        let worker = thread::Builder::new()
            .name(format!("screen-capture-{}", index))
            .spawn(move || {
                // Create Capturer inside the thread (scrap::Capturer is !Send on X11)
                let display = match pick_display(index) {
                    Ok(d) => d,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let (w, h) = (display.width(), display.height());
                let capturer = match Capturer::new(display) {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("failed to start capturer: {}", e)));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                serve_frames(capturer, w, h, request_rx, frame_tx);
            })
            .map_err(|err| CaptureError::Spawn { program: "screen capture thread", err })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                request_tx: Some(request_tx),
                frame_rx,
                worker: Some(worker),
            }),
            Ok(Err(e)) => Err(CaptureError::NoDisplay(e)),
            Err(_) => Err(CaptureError::Stopped),
        }
    }
}

impl Capture for ScreenCapture {
    fn read(&mut self) -> Result<Option<RgbImage>, CaptureError> {
        let Some(request_tx) = &self.request_tx else {
            return Ok(None);
        };
        if request_tx.send(()).is_err() {
            return Ok(None);
        }
        // A dead worker is the same as "no data" for the caller
        Ok(self.frame_rx.recv().unwrap_or(None))
    }
}

impl Drop for ScreenCapture {
    fn drop(&mut self) {
        // Closing the request channel ends the worker loop
        self.request_tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn pick_display(index: usize) -> Result<Display, String> {
    if index == 0 {
        return Display::primary().map_err(|e| e.to_string());
    }
    let mut displays = Display::all().map_err(|e| e.to_string())?;
    if index >= displays.len() {
        return Err(format!("display {} not found ({} available)", index, displays.len()));
    }
    Ok(displays.swap_remove(index))
}

fn serve_frames(
    mut capturer: Capturer,
    width: usize,
    height: usize,
    requests: mpsc::Receiver<()>,
    frames: mpsc::SyncSender<Option<RgbImage>>,
) {
    while requests.recv().is_ok() {
        let frame = grab(&mut capturer, width, height);
        if frames.send(frame).is_err() {
            break;
        }
    }
    debug!("screen capture thread exiting");
}

fn grab(capturer: &mut Capturer, width: usize, height: usize) -> Option<RgbImage> {
    let started = std::time::Instant::now();
    loop {
        match capturer.frame() {
            // scrap gives us BGRA pixels (stride may include padding)
            Ok(frame) => return bgra_to_rgb(&frame, width, height),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if started.elapsed() > FRAME_TIMEOUT {
                    return None;
                }
                // Frame not ready yet
                thread::sleep(Duration::from_millis(5));
            }
            Err(e) => {
                debug!("screen capture error: {}", e);
                return None;
            }
        }
    }
}

/// Convert a BGRA buffer (rows may be padded) to an RGB image
fn bgra_to_rgb(bgra: &[u8], width: usize, height: usize) -> Option<RgbImage> {
    if width == 0 || height == 0 {
        return None;
    }
    let stride = bgra.len() / height;
    if stride < width * 4 {
        return None;
    }

    let mut rgb = Vec::with_capacity(width * height * 3);
    for y in 0..height {
        let row = &bgra[y * stride..y * stride + width * 4];
        for px in row.chunks_exact(4) {
            rgb.extend_from_slice(&[px[2], px[1], px[0]]);
        }
    }

    RgbImage::from_raw(width as u32, height as u32, rgb)
}
