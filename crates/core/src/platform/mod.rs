pub mod replay;
pub mod stub;

use std::path::Path;
use std::sync::Arc;

use image::DynamicImage;

use crate::error::{ConfigError, DeviceError};
use crate::types::Point;

/// Transport to the device being automated (emulator, phone, window).
///
/// Implementations must be callable from several threads: the capture
/// producer samples while the orchestrator clicks.
pub trait Device: Send + Sync {
    fn name(&self) -> &str;
    fn click(&self, at: Point) -> Result<(), DeviceError>;
    fn capture(&self) -> Result<DynamicImage, DeviceError>;
    fn is_connected(&self) -> bool;
}

/// Create the device the runner was asked for.
pub fn create_device(replay_dir: Option<&Path>) -> Result<Arc<dyn Device>, ConfigError> {
    match replay_dir {
        Some(dir) => Ok(Arc::new(replay::ReplayDevice::open(dir)?)),
        None => Ok(Arc::new(stub::StubDevice::new(1280, 720))),
    }
}
