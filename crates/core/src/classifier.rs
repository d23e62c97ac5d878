//! Frame → logical state, with edge-triggered change notifications.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::bus::NotificationBus;
use crate::cancel::CancellationToken;
use crate::capture::FrameSource;
use crate::matcher::TemplateMatcher;
use crate::template::SharedTemplate;
use crate::types::{Frame, GameState, StateChange};

/// A state is confirmed when every one of its templates is found.
#[derive(Debug, Clone)]
pub struct StateRule {
    pub state: GameState,
    pub display_name: String,
    pub templates: Vec<SharedTemplate>,
}

impl StateRule {
    pub fn new(state: GameState, templates: Vec<SharedTemplate>) -> Self {
        Self { display_name: state.id().to_string(), state, templates }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }
}

/// Anything the orchestrator can follow state through.
pub trait StateFeed: Send + Sync {
    fn current_state(&self) -> GameState;
    fn changes(&self) -> &NotificationBus<StateChange>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierSnapshot {
    pub current: GameState,
    pub previous: Option<GameState>,
    pub display_name: String,
    /// Time spent in `current` so far.
    pub dwell: Duration,
}

struct Tracker {
    current: GameState,
    previous: Option<GameState>,
    display_name: String,
    entered_at: Instant,
}

pub struct StateClassifier {
    rules: Vec<StateRule>,
    matcher: TemplateMatcher,
    tracker: Mutex<Tracker>,
    bus: NotificationBus<StateChange>,
}

impl StateClassifier {
    /// `rules` are tried in order; the first full match wins.
    pub fn new(rules: Vec<StateRule>, matcher: TemplateMatcher) -> Self {
        Self {
            rules,
            matcher,
            tracker: Mutex::new(Tracker {
                current: GameState::Unknown,
                previous: None,
                display_name: GameState::Unknown.id().to_string(),
                entered_at: Instant::now(),
            }),
            bus: NotificationBus::new("state"),
        }
    }

    pub fn rules(&self) -> &[StateRule] {
        &self.rules
    }

    /// Pure classification of one frame; does not touch the tracked state.
    pub fn classify(&self, frame: &Frame) -> (GameState, &str) {
        for rule in &self.rules {
            if rule.templates.is_empty() {
                continue;
            }
            if rule.templates.iter().all(|t| self.matcher.find(frame, t, None).is_some()) {
                return (rule.state.clone(), rule.display_name.as_str());
            }
        }
        (GameState::Unknown, "unknown")
    }

    /// Classify `frame` and, if the state changed, record and publish the
    /// transition. Subscribers run after the lock is released.
    pub fn observe(&self, frame: &Frame) -> Option<StateChange> {
        let (state, display_name) = self.classify(frame);
        let change = {
            let mut tracker = self.lock();
            if tracker.current == state {
                return None;
            }
            let now = Instant::now();
            let dwell = now.duration_since(tracker.entered_at);
            let from = std::mem::replace(&mut tracker.current, state.clone());
            tracker.previous = Some(from.clone());
            tracker.display_name = display_name.to_string();
            tracker.entered_at = now;
            tracing::info!(
                target: "classifier",
                from = %from,
                to = %state,
                name = display_name,
                dwell_ms = dwell.as_millis() as u64,
                seq = frame.seq(),
                "state changed"
            );
            StateChange { from, to: state, at: now }
        };
        self.bus.notify(&change);
        Some(change)
    }

    pub fn snapshot(&self) -> ClassifierSnapshot {
        let tracker = self.lock();
        ClassifierSnapshot {
            current: tracker.current.clone(),
            previous: tracker.previous.clone(),
            display_name: tracker.display_name.clone(),
            dwell: tracker.entered_at.elapsed(),
        }
    }

    /// Run the consumer loop on its own thread until `stop` is requested.
    pub fn spawn(
        self: &Arc<Self>,
        frames: Arc<dyn FrameSource>,
        poll: Duration,
        stop: CancellationToken,
    ) -> io::Result<JoinHandle<()>> {
        let this = Arc::clone(self);
        thread::Builder::new().name("classifier".into()).spawn(move || {
            tracing::debug!(target: "classifier", rules = this.rules.len(), "classifier started");
            while !stop.is_requested() {
                if let Some(frame) = frames.next_frame(poll) {
                    this.observe(&frame);
                }
            }
            tracing::debug!(target: "classifier", "classifier stopped");
        })
    }

    fn lock(&self) -> MutexGuard<'_, Tracker> {
        self.tracker.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StateFeed for StateClassifier {
    fn current_state(&self) -> GameState {
        self.lock().current.clone()
    }

    fn changes(&self) -> &NotificationBus<StateChange> {
        &self.bus
    }
}
