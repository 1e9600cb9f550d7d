//! RTSP / webcam / video file capture through an `ffmpeg` child process.
//!
//! ffmpeg decodes whatever it is given and re-emits MJPEG on stdout. Frames
//! are cut out of that byte stream at JPEG start/end markers and decoded with
//! `image`.

use image::{ImageFormat, RgbImage};
use std::io::Read;
use std::process::{Child, ChildStdout, Command, Stdio};
use tracing::{debug, warn};

use super::{Capture, CaptureError};

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];
const READ_CHUNK: usize = 64 * 1024;
/// Network inputs that stall longer than this make ffmpeg exit (microseconds)
const NETWORK_TIMEOUT_US: &str = "10000000";

/// Input side of the ffmpeg command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FfmpegInput {
    args: Vec<String>,
}

impl FfmpegInput {
    pub fn url(url: &str) -> Self {
        let mut args = Vec::new();
        if url.starts_with("rtsp://") || url.starts_with("rtsps://") {
            // TCP transport and no input buffering keeps latency down
            args.extend(["-rtsp_transport", "tcp", "-fflags", "nobuffer"].map(String::from));
            args.extend(["-timeout".to_string(), NETWORK_TIMEOUT_US.to_string()]);
        } else if url.contains("://") {
            args.extend(["-rw_timeout".to_string(), NETWORK_TIMEOUT_US.to_string()]);
        }
        args.extend(["-i".to_string(), url.to_string()]);
        Self { args }
    }

    pub fn webcam(index: u32) -> Self {
        let device = if cfg!(target_os = "macos") {
            ["-f".to_string(), "avfoundation".to_string(), "-i".to_string(), index.to_string()]
        } else {
            ["-f".to_string(), "v4l2".to_string(), "-i".to_string(), format!("/dev/video{}", index)]
        };
        Self { args: device.to_vec() }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("ffmpeg");
        cmd.args(["-hide_banner", "-loglevel", "error", "-nostdin"])
            .args(&self.args)
            .args(["-an", "-f", "image2pipe", "-vcodec", "mjpeg", "-q:v", "3", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        cmd
    }
}

pub struct FfmpegCapture {
    child: Child,
    stdout: ChildStdout,
    splitter: JpegSplitter,
    /// First frame, read during open to prove the input works
    pending: Option<RgbImage>,
}

impl FfmpegCapture {
    /// Spawn ffmpeg and wait for the first frame. An input that yields
    /// nothing counts as a failed open.
    pub fn open(input: &FfmpegInput) -> Result<Self, CaptureError> {
        let mut child = input
            .command()
            .spawn()
            .map_err(|err| CaptureError::Spawn { program: "ffmpeg", err })?;
        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            return Err(CaptureError::Stopped);
        };

        let mut capture = Self {
            child,
            stdout,
            splitter: JpegSplitter::default(),
            pending: None,
        };
        match capture.read_frame()? {
            Some(first) => {
                capture.pending = Some(first);
                Ok(capture)
            }
            None => Err(CaptureError::NoData),
        }
    }

    fn read_frame(&mut self) -> Result<Option<RgbImage>, CaptureError> {
        read_jpeg_frame(&mut self.stdout, &mut self.splitter)
    }
}

/// Next decodable picture from an MJPEG byte stream. Frames that fail to
/// decode are dropped; only EOF or an I/O error ends the read.
fn read_jpeg_frame<R: Read>(reader: &mut R, splitter: &mut JpegSplitter) -> Result<Option<RgbImage>, CaptureError> {
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        while let Some(jpeg) = splitter.next_frame() {
            match image::load_from_memory_with_format(&jpeg, ImageFormat::Jpeg) {
                Ok(image) => return Ok(Some(image.to_rgb8())),
                Err(e) => warn!("dropping undecodable frame ({} bytes): {}", jpeg.len(), e),
            }
        }
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            return Ok(None);
        }
        splitter.push(&chunk[..n]);
    }
}

impl Capture for FfmpegCapture {
    fn read(&mut self) -> Result<Option<RgbImage>, CaptureError> {
        if let Some(first) = self.pending.take() {
            return Ok(Some(first));
        }
        self.read_frame()
    }
}

impl Drop for FfmpegCapture {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        debug!("ffmpeg capture released");
    }
}

/// Cuts complete JPEG images out of an MJPEG byte stream
#[derive(Debug, Default)]
struct JpegSplitter {
    buf: Vec<u8>,
}

impl JpegSplitter {
    fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    fn next_frame(&mut self) -> Option<Vec<u8>> {
        let Some(start) = find(&self.buf, &SOI) else {
            // Nothing useful yet; keep a trailing 0xFF in case a marker is split
            let keep = usize::from(self.buf.last() == Some(&0xFF));
            let cut = self.buf.len() - keep;
            self.buf.drain(..cut);
            return None;
        };
        let end = find(&self.buf[start + 2..], &EOI)? + start + 4;
        let frame = self.buf[start..end].to_vec();
        self.buf.drain(..end);
        Some(frame)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splitter_handles_split_markers() {
        let mut splitter = JpegSplitter::default();
        splitter.push(&[0x00, 0x11, 0xFF]);
        assert!(splitter.next_frame().is_none());
        splitter.push(&[0xD8, 0x01, 0x02, 0xFF]);
        assert!(splitter.next_frame().is_none());
        splitter.push(&[0xD9, 0xFF, 0xD8, 0x03, 0xFF, 0xD9]);

        assert_eq!(
            splitter.next_frame().unwrap(),
            vec![0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9]
        );
        assert_eq!(splitter.next_frame().unwrap(), vec![0xFF, 0xD8, 0x03, 0xFF, 0xD9]);
        assert!(splitter.next_frame().is_none());
    }

    #[test]
    fn test_splitter_drops_garbage() {
        let mut splitter = JpegSplitter::default();
        splitter.push(&[1, 2, 3, 4]);
        assert!(splitter.next_frame().is_none());
        assert!(splitter.buf.is_empty());
    }

    #[test]
    fn test_corrupt_frame_is_skipped() {
        let mut good = Vec::new();
        RgbImage::new(6, 4)
            .write_to(&mut std::io::Cursor::new(&mut good), ImageFormat::Jpeg)
            .unwrap();

        let mut stream = vec![0xFF, 0xD8, 0x00, 0x01, 0xFF, 0xD9];
        stream.extend_from_slice(&good);
        let mut reader = std::io::Cursor::new(stream);
        let mut splitter = JpegSplitter::default();

        let image = read_jpeg_frame(&mut reader, &mut splitter).unwrap().unwrap();
        assert_eq!(image.dimensions(), (6, 4));
        assert!(read_jpeg_frame(&mut reader, &mut splitter).unwrap().is_none());
    }

    #[test]
    fn test_rtsp_input_uses_tcp() {
        let input = FfmpegInput::url("rtsp://cam/stream1");
        assert_eq!(&input.args[..2], ["-rtsp_transport", "tcp"]);
        assert!(input.args.windows(2).any(|w| w == ["-timeout", NETWORK_TIMEOUT_US]));
        assert_eq!(input.args.last().unwrap(), "rtsp://cam/stream1");

        let http = FfmpegInput::url("http://cam/video.mjpg");
        assert_eq!(&http.args[..2], ["-rw_timeout", NETWORK_TIMEOUT_US]);

        let file = FfmpegInput::url("clip.mp4");
        assert_eq!(file.args, vec!["-i".to_string(), "clip.mp4".to_string()]);
    }
}
