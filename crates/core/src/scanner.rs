//! Box/slot occupancy scan.
//!
//! Every slot is judged on its own region. A sold slot is collected with a
//! single tap and then counts as empty; a slot that shows neither marker is
//! treated as occupied.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::DeviceError;
use crate::matcher::TemplateMatcher;
use crate::platform::Device;
use crate::sleep::sleep_jitter;
use crate::template::SharedTemplate;
use crate::types::{Frame, Point, Rect, ScanReport, Slot, SlotStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SlotRegion {
    pub roi: Rect,
    pub tap: Point,
}

/// Slot geometry plus the two markers that classify a slot.
#[derive(Debug, Clone)]
pub struct SlotLayout {
    pub sold: SharedTemplate,
    pub empty: SharedTemplate,
    pub regions: Vec<SlotRegion>,
}

impl SlotLayout {
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Region of a 1-based slot index.
    pub fn region(&self, index: usize) -> Option<&SlotRegion> {
        index.checked_sub(1).and_then(|i| self.regions.get(i))
    }
}

pub struct SlotScanner {
    matcher: TemplateMatcher,
    device: Arc<dyn Device>,
    layout: Arc<SlotLayout>,
    settle: Duration,
}

impl SlotScanner {
    pub fn new(matcher: TemplateMatcher, device: Arc<dyn Device>, layout: Arc<SlotLayout>, settle: Duration) -> Self {
        Self { matcher, device, layout, settle }
    }

    pub fn layout(&self) -> &SlotLayout {
        &self.layout
    }

    /// Classify every slot of `frame` in index order. A failed collection tap
    /// aborts the scan.
    pub fn scan(&self, frame: &Frame) -> Result<ScanReport, DeviceError> {
        let mut report = ScanReport::default();
        for (i, region) in self.layout.regions.iter().enumerate() {
            let index = i + 1;
            let status = if self.matcher.find(frame, &self.layout.sold, Some(region.roi)).is_some() {
                self.device.click(region.tap)?;
                tracing::info!(target: "scanner", slot = index, "collected sold slot");
                sleep_jitter(self.settle);
                report.sold += 1;
                SlotStatus::Sold
            } else if self.matcher.find(frame, &self.layout.empty, Some(region.roi)).is_some() {
                SlotStatus::Empty
            } else {
                report.occupied += 1;
                SlotStatus::Occupied
            };
            if status != SlotStatus::Occupied {
                report.empty.push(index);
            }
            tracing::debug!(target: "scanner", slot = index, ?status);
            report.slots.push(Slot { index, region: region.roi, tap: region.tap, status });
        }
        tracing::info!(target: "scanner", "scan: {}", report.summary());
        Ok(report)
    }
}
