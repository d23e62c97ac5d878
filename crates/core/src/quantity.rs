//! Reading and driving the shop's quantity counter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cancel::CancellationToken;
use crate::capture::{fresh_frame, FrameSource};
use crate::error::StepError;
use crate::matcher::TemplateMatcher;
use crate::platform::Device;
use crate::template::SharedTemplate;
use crate::types::{Frame, Point, Rect};

/// Where the counter is and how to move it. `digits[i]` shows value `i + 1`.
#[derive(Debug, Clone)]
pub struct QuantityLayout {
    pub roi: Rect,
    pub increase: Point,
    pub decrease: Point,
    pub digits: Vec<SharedTemplate>,
}

#[derive(Debug, Clone, Copy)]
pub struct AdjustOptions {
    /// Extra attempts on top of the distance to the target.
    pub slack: u32,
    pub frame_wait: Duration,
    pub retry_delay: Duration,
}

pub struct QuantityReader {
    matcher: TemplateMatcher,
    layout: Arc<QuantityLayout>,
}

impl QuantityReader {
    pub fn new(matcher: TemplateMatcher, layout: Arc<QuantityLayout>) -> Self {
        Self { matcher, layout }
    }

    /// Value on the counter, or `None` when no digit clears its threshold.
    /// With several candidates the most confident one wins.
    pub fn read(&self, frame: &Frame) -> Option<u32> {
        self.layout
            .digits
            .iter()
            .enumerate()
            .filter_map(|(i, digit)| {
                self.matcher.find(frame, digit, Some(self.layout.roi)).map(|m| (i as u32 + 1, m.confidence))
            })
            .fold(None, |best: Option<(u32, f32)>, (value, confidence)| match best {
                Some((_, c)) if c >= confidence => best,
                _ => Some((value, confidence)),
            })
            .map(|(value, _)| value)
    }

    /// Click the counter toward `target`, re-reading after each batch of
    /// clicks. The attempt budget is the distance seen on the first good
    /// reading plus `slack`; unreadable frames use up attempts too.
    pub fn adjust(
        &self,
        target: u32,
        device: &dyn Device,
        frames: &dyn FrameSource,
        options: AdjustOptions,
        cancel: &CancellationToken,
    ) -> Result<u32, StepError> {
        let mut budget = options.slack.max(1);
        let mut measured = false;
        let mut attempts = 0;
        let mut last_read = None;
        let mut since = Instant::now();

        while attempts < budget {
            if cancel.is_requested() {
                return Err(StepError::Cancelled);
            }
            attempts += 1;
            let frame = match fresh_frame(frames, since, options.frame_wait, cancel) {
                Some(frame) => frame,
                None if cancel.is_requested() => return Err(StepError::Cancelled),
                None => return Err(StepError::NoFrame),
            };
            let Some(value) = self.read(&frame) else {
                tracing::debug!(target: "orchestrator", attempt = attempts, "quantity unreadable");
                cancel.wait(options.retry_delay);
                since = Instant::now();
                continue;
            };
            if !measured {
                budget = target.abs_diff(value) + options.slack.max(1);
                measured = true;
            }
            last_read = Some(value);
            if value == target {
                tracing::debug!(target: "orchestrator", target, attempts, "quantity set");
                return Ok(value);
            }
            let (button, clicks) = if value < target {
                (self.layout.increase, target - value)
            } else {
                (self.layout.decrease, value - target)
            };
            tracing::debug!(target: "orchestrator", value, target, clicks, "adjusting quantity");
            for _ in 0..clicks {
                device.click(button)?;
            }
            cancel.wait(options.retry_delay);
            since = Instant::now();
        }
        Err(StepError::QuantityNotReached { target, last_read, attempts })
    }
}
