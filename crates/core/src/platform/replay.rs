use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use image::DynamicImage;

use super::Device;
use crate::error::{ConfigError, DeviceError};
use crate::types::Point;

/// Serves recorded screenshots from a directory, in file-name order, looping
/// at the end. Clicks are logged only. Used to dry-run a profile offline.
pub struct ReplayDevice {
    frames: Vec<PathBuf>,
    cursor: AtomicUsize,
}

const EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

impl ReplayDevice {
    pub fn open(dir: &Path) -> Result<Self, ConfigError> {
        let entries = fs::read_dir(dir).map_err(|source| ConfigError::Io { path: dir.to_path_buf(), source })?;
        let mut frames: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.extension()
                    .map(|ext| EXTENSIONS.contains(&ext.to_string_lossy().to_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        if frames.is_empty() {
            return Err(ConfigError::invalid(format!("no screenshots found in {}", dir.display())));
        }
        frames.sort();
        tracing::info!(target: "device", dir = %dir.display(), frames = frames.len(), "replay device opened");
        Ok(Self { frames, cursor: AtomicUsize::new(0) })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl Device for ReplayDevice {
    fn name(&self) -> &str {
        "replay"
    }

    fn click(&self, at: Point) -> Result<(), DeviceError> {
        tracing::info!(target: "device", x = at.x, y = at.y, "replay click");
        Ok(())
    }

    fn capture(&self) -> Result<DynamicImage, DeviceError> {
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % self.frames.len();
        let path = &self.frames[i];
        image::open(path).map_err(|e| DeviceError::Failed(format!("{}: {}", path.display(), e)))
    }

    fn is_connected(&self) -> bool {
        true
    }
}
