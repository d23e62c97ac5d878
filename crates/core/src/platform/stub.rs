use std::sync::atomic::{AtomicBool, Ordering};

use image::{DynamicImage, GrayImage};

use super::Device;
use crate::error::DeviceError;
use crate::types::Point;

/// Device that logs every command and captures a blank screen.
pub struct StubDevice {
    width: u32,
    height: u32,
    connected: AtomicBool,
}

impl StubDevice {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height, connected: AtomicBool::new(true) }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

impl Device for StubDevice {
    fn name(&self) -> &str {
        "stub"
    }

    fn click(&self, at: Point) -> Result<(), DeviceError> {
        if !self.is_connected() {
            return Err(DeviceError::Disconnected);
        }
        tracing::info!(target: "device", x = at.x, y = at.y, "stub click");
        Ok(())
    }

    fn capture(&self) -> Result<DynamicImage, DeviceError> {
        if !self.is_connected() {
            return Err(DeviceError::Disconnected);
        }
        tracing::trace!(target: "device", w = self.width, h = self.height, "stub capture");
        Ok(DynamicImage::ImageLuma8(GrayImage::new(self.width, self.height)))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
