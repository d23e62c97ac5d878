//! Fakes for exercising the core without a device or real screenshots.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::{DynamicImage, GrayImage};

use crate::bus::NotificationBus;
use crate::capture::{FrameQueue, FrameSource};
use crate::classifier::StateFeed;
use crate::error::DeviceError;
use crate::matcher::{MatchPrimitive, RawMatch};
use crate::platform::Device;
use crate::template::{MatchPolicy, SharedTemplate, TemplateDescriptor, TemplateImage};
use crate::types::{Frame, GameState, PipelineHealth, Point, Rect, StateChange};

/// 1x1 descriptor searched over the whole frame. The image name is the id,
/// which is what [`ScriptedMatcher`] keys on.
pub fn descriptor(id: &str) -> SharedTemplate {
    Arc::new(TemplateDescriptor {
        id: id.to_string(),
        image: TemplateImage::new(id, GrayImage::new(1, 1)),
        roi: Rect::default(),
        threshold: 0.8,
        policy: MatchPolicy::Best,
    })
}

pub fn blank_frame() -> Frame {
    Frame::new(GrayImage::new(64, 64), 0)
}

/// Match primitive whose answers are set by the test: a template is "on
/// screen" wherever it was shown, with the confidence it was shown with.
#[derive(Default)]
pub struct ScriptedMatcher {
    visible: Mutex<HashMap<String, Vec<RawMatch>>>,
}

impl ScriptedMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn show(&self, name: &str) {
        self.show_at(name, 0, 0, 1.0);
    }

    /// Add one occurrence of `name`. A template may be shown in several places.
    pub fn show_at(&self, name: &str, x: u32, y: u32, confidence: f32) {
        self.lock().entry(name.to_string()).or_default().push(RawMatch { x, y, confidence });
    }

    pub fn hide(&self, name: &str) {
        self.lock().remove(name);
    }

    /// Remove the occurrence of `name` at `(x, y)`, if any.
    pub fn hide_at(&self, name: &str, x: u32, y: u32) {
        if let Some(hits) = self.lock().get_mut(name) {
            hits.retain(|m| (m.x, m.y) != (x, y));
        }
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn is_shown(&self, name: &str) -> bool {
        self.lock().get(name).is_some_and(|hits| !hits.is_empty())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<RawMatch>>> {
        self.visible.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MatchPrimitive for ScriptedMatcher {
    fn locate(&self, _: &GrayImage, needle: &TemplateImage, region: Rect, _: MatchPolicy, _: f32) -> Option<RawMatch> {
        let visible = self.lock();
        visible
            .get(&needle.name)?
            .iter()
            .filter(|m| m.x >= region.x && m.x < region.right() && m.y >= region.y && m.y < region.bottom())
            .copied()
            .fold(None, |best: Option<RawMatch>, m| match best {
                Some(b) if b.confidence >= m.confidence => Some(b),
                _ => Some(m),
            })
    }
}

type ClickHook = Box<dyn Fn(Point) + Send + Sync>;

/// Device that records every click and captures a blank screen. An
/// optional hook lets a test react to clicks (e.g. bump a counter on screen).
pub struct RecordingDevice {
    clicks: Mutex<Vec<Point>>,
    connected: AtomicBool,
    hook: Mutex<Option<ClickHook>>,
}

impl Default for RecordingDevice {
    fn default() -> Self {
        Self { clicks: Mutex::new(Vec::new()), connected: AtomicBool::new(true), hook: Mutex::new(None) }
    }
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_click<F>(&self, hook: F)
    where
        F: Fn(Point) + Send + Sync + 'static,
    {
        *self.hook.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(hook));
    }

    pub fn clicks(&self) -> Vec<Point> {
        self.clicks.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

impl Device for RecordingDevice {
    fn name(&self) -> &str {
        "recording"
    }

    fn click(&self, at: Point) -> Result<(), DeviceError> {
        if !self.is_connected() {
            return Err(DeviceError::Disconnected);
        }
        self.clicks.lock().unwrap_or_else(|e| e.into_inner()).push(at);
        if let Some(hook) = self.hook.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            hook(at);
        }
        Ok(())
    }

    fn capture(&self) -> Result<DynamicImage, DeviceError> {
        if !self.is_connected() {
            return Err(DeviceError::Disconnected);
        }
        Ok(DynamicImage::ImageLuma8(GrayImage::new(64, 64)))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Frame source for tests. `latest()` behaves like a live screen and hands
/// out a new blank frame per call; `next_frame` serves pushed frames.
pub struct ScriptedFrames {
    queue: FrameQueue,
    seq: AtomicU64,
    blind: AtomicBool,
    health: Mutex<PipelineHealth>,
}

impl Default for ScriptedFrames {
    fn default() -> Self {
        Self {
            queue: FrameQueue::new(16),
            seq: AtomicU64::new(1),
            blind: AtomicBool::new(false),
            health: Mutex::new(PipelineHealth::Running),
        }
    }
}

impl ScriptedFrames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, frame: Frame) {
        self.queue.push(frame);
    }

    /// With `blind` set, `latest()` reports no frame at all.
    pub fn set_blind(&self, blind: bool) {
        self.blind.store(blind, Ordering::SeqCst);
    }

    pub fn set_health(&self, health: PipelineHealth) {
        *self.health.lock().unwrap_or_else(|e| e.into_inner()) = health;
    }
}

impl FrameSource for ScriptedFrames {
    fn latest(&self) -> Option<Frame> {
        if self.blind.load(Ordering::SeqCst) {
            return None;
        }
        Some(Frame::new(GrayImage::new(64, 64), self.seq.fetch_add(1, Ordering::Relaxed)))
    }

    fn next_frame(&self, timeout: Duration) -> Option<Frame> {
        self.queue.pop_timeout(timeout)
    }

    fn health(&self) -> PipelineHealth {
        *self.health.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// State feed driven by hand: `set` publishes a change the way the
/// classifier would, only when the state differs.
pub struct ScriptedFeed {
    state: Mutex<GameState>,
    bus: NotificationBus<StateChange>,
}

impl Default for ScriptedFeed {
    fn default() -> Self {
        Self { state: Mutex::new(GameState::Unknown), bus: NotificationBus::new("scripted-state") }
    }
}

impl ScriptedFeed {
    pub fn new(initial: GameState) -> Self {
        let feed = Self::default();
        *feed.state.lock().unwrap_or_else(|e| e.into_inner()) = initial;
        feed
    }

    pub fn set(&self, next: GameState) {
        let from = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state == next {
                return;
            }
            std::mem::replace(&mut *state, next.clone())
        };
        self.bus.notify(&StateChange { from, to: next, at: std::time::Instant::now() });
    }
}

impl StateFeed for ScriptedFeed {
    fn current_state(&self) -> GameState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn changes(&self) -> &NotificationBus<StateChange> {
        &self.bus
    }
}
