//! Replays a still image, or every image in a directory in name order.

use image::RgbImage;
use std::path::{Path, PathBuf};
use tracing::warn;

use super::{is_still_image, Capture, CaptureError};

pub struct StillsCapture {
    paths: Vec<PathBuf>,
    next: usize,
}

impl StillsCapture {
    pub fn open(path: &Path) -> Result<Self, CaptureError> {
        let paths = if path.is_dir() {
            let mut paths: Vec<PathBuf> = std::fs::read_dir(path)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && is_still_image(p))
                .collect();
            paths.sort();
            paths
        } else if path.is_file() {
            vec![path.to_path_buf()]
        } else {
            Vec::new()
        };

        if paths.is_empty() {
            return Err(CaptureError::NoImages(path.to_path_buf()));
        }
        Ok(Self { paths, next: 0 })
    }
}

impl Capture for StillsCapture {
    /// Files that fail to decode are skipped; `None` once every file is used
    fn read(&mut self) -> Result<Option<RgbImage>, CaptureError> {
        while let Some(path) = self.paths.get(self.next) {
            self.next += 1;
            match image::open(path) {
                Ok(image) => return Ok(Some(image.to_rgb8())),
                Err(e) => warn!("skipping {}: {}", path.display(), e),
            }
        }
        Ok(None)
    }
}
