//! The run loop: follow state changes and act on them.
//!
//! A run subscribes to the state feed, handles whatever state it is in
//! (an action list, or the scan-plan-fill cycle in the working state), then
//! blocks until the next state change. Cancellation and the interruption
//! state are noticed between steps; a step already sent to the device is
//! never torn.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::action::ActionStep;
use crate::bus::SubscriptionGuard;
use crate::cancel::CancellationToken;
use crate::capture::{fresh_frame, FrameSource};
use crate::classifier::StateFeed;
use crate::error::{ConfigError, DeviceError, RunError, StepError};
use crate::kit::KitConfiguration;
use crate::matcher::TemplateMatcher;
use crate::platform::Device;
use crate::profile::Profile;
use crate::quantity::{AdjustOptions, QuantityReader};
use crate::scanner::SlotScanner;
use crate::settings::OrchestratorSettings;
use crate::sleep::sleep_jitter_unless;
use crate::template::TemplateDescriptor;
use crate::types::{Frame, GameState, PipelineHealth, Point, ScanReport, StateChange};

/// What a goal predicate gets to look at after every iteration.
#[derive(Debug, Clone, Copy)]
pub struct GoalContext<'a> {
    pub state: &'a GameState,
    pub last_scan: Option<&'a ScanReport>,
    pub filled: usize,
    /// Kit slots still to fill according to the latest scan.
    pub pending: Option<usize>,
}

pub type Goal = Box<dyn Fn(&GoalContext<'_>) -> bool + Send + Sync>;

pub mod goals {
    use super::{Goal, GoalContext};

    /// Done once a scan finds no empty slot at all.
    pub fn no_empty_slots() -> Goal {
        Box::new(|ctx: &GoalContext<'_>| ctx.last_scan.is_some_and(|s| s.empty.is_empty()))
    }

    /// Done once a scan finds nothing left to fill from the kit.
    pub fn kit_filled() -> Goal {
        Box::new(|ctx: &GoalContext<'_>| ctx.pending == Some(0))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub iterations: u32,
    pub filled: usize,
    pub fill_passes: u32,
    pub restarts: u32,
    pub step_failures: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(RunSummary),
    Cancelled(RunSummary),
}

impl RunOutcome {
    pub fn summary(&self) -> &RunSummary {
        match self {
            RunOutcome::Completed(s) | RunOutcome::Cancelled(s) => s,
        }
    }
}

/// Why the current list of steps stopped early.
enum Interrupt {
    Cancelled,
    Restart,
    Step(StepError),
    Fatal(RunError),
}

impl From<StepError> for Interrupt {
    fn from(e: StepError) -> Self {
        match e {
            StepError::Cancelled => Interrupt::Cancelled,
            StepError::Device(DeviceError::Disconnected) => Interrupt::Fatal(RunError::DeviceUnavailable),
            other => Interrupt::Step(other),
        }
    }
}

impl From<DeviceError> for Interrupt {
    fn from(e: DeviceError) -> Self {
        Interrupt::from(StepError::Device(e))
    }
}

enum Phase {
    Restart,
    Finished(Result<RunOutcome, RunError>),
}

/// State changes delivered to one run phase.
struct Inbox {
    interruption: GameState,
    changes: Mutex<VecDeque<StateChange>>,
    arrived: Condvar,
    restart: AtomicBool,
}

impl Inbox {
    fn new(interruption: GameState) -> Self {
        Self {
            interruption,
            changes: Mutex::new(VecDeque::new()),
            arrived: Condvar::new(),
            restart: AtomicBool::new(false),
        }
    }

    fn deliver(&self, change: &StateChange) {
        if change.to == self.interruption {
            tracing::warn!(target: "orchestrator", from = %change.from, "interruption state observed");
            self.restart.store(true, Ordering::SeqCst);
        }
        self.lock().push_back(change.clone());
        self.arrived.notify_all();
    }

    fn restart_requested(&self) -> bool {
        self.restart.load(Ordering::SeqCst)
    }

    /// Drain the inbox, keeping only the newest change.
    fn take_latest(&self) -> Option<StateChange> {
        self.lock().drain(..).last()
    }

    fn wait(&self, timeout: Duration) {
        let changes = self.lock();
        if changes.is_empty() {
            let _ = self.arrived.wait_timeout(changes, timeout);
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<StateChange>> {
        self.changes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Mutable bookkeeping of one `start_orchestration` call.
struct Run<'k> {
    kit: &'k KitConfiguration,
    deadline: Instant,
    summary: RunSummary,
    pending: Option<usize>,
}

pub struct Orchestrator {
    device: Arc<dyn Device>,
    frames: Arc<dyn FrameSource>,
    feed: Arc<dyn StateFeed>,
    matcher: TemplateMatcher,
    profile: Arc<Profile>,
    settings: OrchestratorSettings,
    scanner: SlotScanner,
    quantity: QuantityReader,
    cancel: CancellationToken,
    last_scan: Mutex<Option<ScanReport>>,
}

impl Orchestrator {
    pub fn new(
        device: Arc<dyn Device>,
        frames: Arc<dyn FrameSource>,
        feed: Arc<dyn StateFeed>,
        matcher: TemplateMatcher,
        profile: Arc<Profile>,
        settings: OrchestratorSettings,
        cancel: CancellationToken,
    ) -> Self {
        let scanner = SlotScanner::new(matcher.clone(), Arc::clone(&device), Arc::clone(&profile.slots), settings.settle());
        let quantity = QuantityReader::new(matcher.clone(), Arc::clone(&profile.quantity));
        Self {
            device,
            frames,
            feed,
            matcher,
            profile,
            settings,
            scanner,
            quantity,
            cancel,
            last_scan: Mutex::new(None),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Ask a running orchestration to stop at the next step boundary.
    pub fn request_cancel(&self) {
        self.cancel.request();
    }

    pub fn reset_cancel(&self) {
        self.cancel.reset();
    }

    /// Result of the most recent slot scan, if any.
    pub fn last_scan(&self) -> Option<ScanReport> {
        self.lock_scan().clone()
    }

    /// Drive the application until `goal` holds, the run is cancelled, or a
    /// fatal error occurs. Blocks the calling thread.
    pub fn start_orchestration(&self, kit: &KitConfiguration, goal: Goal) -> Result<RunOutcome, RunError> {
        self.cancel.reset();
        let mut run = Run {
            kit,
            deadline: Instant::now() + self.settings.run_timeout(),
            summary: RunSummary::default(),
            pending: None,
        };
        tracing::info!(
            target: "orchestrator",
            kit = %kit.name,
            working = %self.profile.working_state,
            interruption = %self.profile.interruption_state,
            "run started"
        );

        loop {
            let inbox = Arc::new(Inbox::new(self.profile.interruption_state.clone()));
            let sink = Arc::clone(&inbox);
            let bus = self.feed.changes();
            let id = bus.subscribe(move |change: &StateChange| {
                sink.deliver(change);
                Ok(())
            });
            let guard = SubscriptionGuard::new(bus, id);
            let phase = self.run_phase(&mut run, &inbox, &goal);
            drop(guard);

            match phase {
                Phase::Finished(result) => {
                    match &result {
                        Ok(RunOutcome::Completed(s)) => tracing::info!(target: "orchestrator", summary = ?s, "run completed"),
                        Ok(RunOutcome::Cancelled(s)) => tracing::info!(target: "orchestrator", summary = ?s, "run cancelled"),
                        Err(e) => tracing::error!(target: "orchestrator", error = %e, summary = ?run.summary, "run failed"),
                    }
                    return result;
                }
                Phase::Restart => {
                    run.summary.restarts += 1;
                    if run.summary.restarts > self.settings.max_restarts {
                        tracing::error!(target: "orchestrator", restarts = run.summary.restarts, "restart limit reached");
                        return Err(RunError::RestartLimit { restarts: run.summary.restarts });
                    }
                    tracing::warn!(target: "orchestrator", restarts = run.summary.restarts, "restarting from the initial phase");
                }
            }
        }
    }

    fn run_phase(&self, run: &mut Run<'_>, inbox: &Inbox, goal: &Goal) -> Phase {
        let mut state = self.feed.current_state();
        let mut entered = Instant::now();

        loop {
            if self.cancel.is_requested() {
                return Phase::Finished(Ok(RunOutcome::Cancelled(run.summary.clone())));
            }
            if inbox.restart_requested() {
                return Phase::Restart;
            }
            if Instant::now() >= run.deadline {
                return Phase::Finished(Err(self.timeout(&state, entered)));
            }
            run.summary.iterations += 1;
            tracing::debug!(target: "orchestrator", state = %state, iteration = run.summary.iterations, "handling state");

            match self.handle_state(&state, run, inbox) {
                Ok(()) => {}
                Err(Interrupt::Cancelled) => return Phase::Finished(Ok(RunOutcome::Cancelled(run.summary.clone()))),
                Err(Interrupt::Restart) => return Phase::Restart,
                Err(Interrupt::Fatal(e)) => return Phase::Finished(Err(e)),
                Err(Interrupt::Step(_)) if self.cancel.is_requested() => {
                    return Phase::Finished(Ok(RunOutcome::Cancelled(run.summary.clone())));
                }
                Err(Interrupt::Step(e)) => {
                    run.summary.step_failures += 1;
                    tracing::warn!(
                        target: "orchestrator",
                        state = %state,
                        error = %e,
                        failures = run.summary.step_failures,
                        "step failed, re-evaluating"
                    );
                    if run.summary.step_failures >= self.settings.max_step_failures {
                        return Phase::Finished(Err(RunError::StepFailed { state, source: e }));
                    }
                    inbox.take_latest();
                    let now = self.feed.current_state();
                    if now != state {
                        state = now;
                        entered = Instant::now();
                    }
                    sleep_jitter_unless(&self.cancel, self.settings.retry_delay());
                    continue;
                }
            }

            let scan = self.last_scan();
            let ctx = GoalContext {
                state: &state,
                last_scan: scan.as_ref(),
                filled: run.summary.filled,
                pending: run.pending,
            };
            if goal(&ctx) {
                return Phase::Finished(Ok(RunOutcome::Completed(run.summary.clone())));
            }

            match self.await_change(&state, entered, run.deadline, inbox) {
                Ok(next) => {
                    state = next;
                    entered = Instant::now();
                }
                Err(Interrupt::Cancelled) => return Phase::Finished(Ok(RunOutcome::Cancelled(run.summary.clone()))),
                Err(Interrupt::Restart) => return Phase::Restart,
                Err(Interrupt::Fatal(e)) => return Phase::Finished(Err(e)),
                Err(Interrupt::Step(e)) => return Phase::Finished(Err(RunError::StepFailed { state, source: e })),
            }
        }
    }

    /// Block until the feed reports a new state.
    fn await_change(&self, state: &GameState, entered: Instant, deadline: Instant, inbox: &Inbox) -> Result<GameState, Interrupt> {
        loop {
            if self.cancel.is_requested() {
                return Err(Interrupt::Cancelled);
            }
            if inbox.restart_requested() {
                return Err(Interrupt::Restart);
            }
            if let Some(change) = inbox.take_latest() {
                return Ok(change.to);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Interrupt::Fatal(self.timeout(state, entered)));
            }
            inbox.wait((deadline - now).min(self.settings.poll()));
        }
    }

    fn timeout(&self, state: &GameState, entered: Instant) -> RunError {
        RunError::StateTimeout {
            state: state.clone(),
            waited: entered.elapsed(),
            device_degraded: self.frames.health() == PipelineHealth::Degraded,
        }
    }

    fn handle_state(&self, state: &GameState, run: &mut Run<'_>, inbox: &Inbox) -> Result<(), Interrupt> {
        if *state == self.profile.working_state {
            return self.work(run, inbox);
        }
        let steps = self.profile.actions_for(state);
        if steps.is_empty() {
            tracing::debug!(target: "orchestrator", state = %state, "no actions for state");
            return Ok(());
        }
        self.run_steps(steps, inbox)
    }

    /// Scan, plan and fill until the kit has nothing left to place.
    fn work(&self, run: &mut Run<'_>, inbox: &Inbox) -> Result<(), Interrupt> {
        let mut passes = 0;
        loop {
            self.checkpoint(inbox)?;
            let frame = self.fresh()?;
            let report = self.scanner.scan(&frame)?;
            let plan = run.kit.plan(&report);
            run.pending = Some(plan.len());
            *self.lock_scan() = Some(report);
            if plan.is_empty() {
                tracing::info!(target: "orchestrator", passes, "nothing left to fill");
                return Ok(());
            }
            if passes >= self.settings.max_fill_passes {
                return Err(Interrupt::Fatal(RunError::FillIncomplete { passes, remaining: plan.len() }));
            }
            passes += 1;
            run.summary.fill_passes += 1;
            tracing::info!(target: "orchestrator", pass = passes, slots = plan.len(), "fill pass");

            for assignment in &plan {
                let region = self.profile.slots.region(assignment.slot).ok_or_else(|| {
                    let e = ConfigError::invalid(format!("slot {} is not in the layout", assignment.slot));
                    Interrupt::Fatal(e.into())
                })?;
                let steps = self.profile.shop.fill_steps(region.tap, &assignment.template.id, assignment.quantity);
                self.run_steps(&steps, inbox)?;
                run.summary.filled += 1;
                tracing::info!(
                    target: "orchestrator",
                    slot = assignment.slot,
                    item = %assignment.item,
                    quantity = assignment.quantity,
                    "slot filled"
                );
            }
        }
    }

    fn run_steps(&self, steps: &[ActionStep], inbox: &Inbox) -> Result<(), Interrupt> {
        for step in steps {
            self.checkpoint(inbox)?;
            tracing::debug!(target: "orchestrator", step = %step);
            self.execute(step)?;
        }
        Ok(())
    }

    /// Step boundary: the only place a run stops early.
    fn checkpoint(&self, inbox: &Inbox) -> Result<(), Interrupt> {
        if self.cancel.is_requested() {
            return Err(Interrupt::Cancelled);
        }
        if inbox.restart_requested() {
            return Err(Interrupt::Restart);
        }
        Ok(())
    }

    fn execute(&self, step: &ActionStep) -> Result<(), Interrupt> {
        match step {
            ActionStep::Click { x, y } => self.click(Point::new(*x, *y)),
            ActionStep::Wait { ms } => {
                if self.cancel.wait(Duration::from_millis(*ms)) {
                    return Err(Interrupt::Cancelled);
                }
                Ok(())
            }
            ActionStep::FindAndClick { template, max_attempts } => {
                let descriptor = self.profile.template(template).map_err(|e| Interrupt::Fatal(e.into()))?;
                self.find_and_click(descriptor, *max_attempts)
            }
            ActionStep::AdjustQuantity { target } => {
                let options = AdjustOptions {
                    slack: self.settings.quantity_slack,
                    frame_wait: self.settings.frame_wait(),
                    retry_delay: self.settings.retry_delay(),
                };
                self.quantity
                    .adjust(*target, self.device.as_ref(), self.frames.as_ref(), options, &self.cancel)
                    .map(|_| ())
                    .map_err(Interrupt::from)
            }
            ActionStep::ExpectState { state, max_attempts } => self.expect_state(state, *max_attempts),
        }
    }

    fn click(&self, at: Point) -> Result<(), Interrupt> {
        self.device.click(at).map_err(Interrupt::from)
    }

    fn fresh(&self) -> Result<Frame, Interrupt> {
        match fresh_frame(self.frames.as_ref(), Instant::now(), self.settings.frame_wait(), &self.cancel) {
            Some(frame) => Ok(frame),
            None if self.cancel.is_requested() => Err(Interrupt::Cancelled),
            None => Err(Interrupt::Step(StepError::NoFrame)),
        }
    }

    fn find_and_click(&self, template: &TemplateDescriptor, max_attempts: u32) -> Result<(), Interrupt> {
        for attempt in 1..=max_attempts {
            if self.cancel.is_requested() {
                return Err(Interrupt::Cancelled);
            }
            let frame = self.fresh()?;
            if let Some(hit) = self.matcher.find(&frame, template, None) {
                tracing::debug!(
                    target: "orchestrator",
                    template = %template.id,
                    x = hit.center.x,
                    y = hit.center.y,
                    confidence = hit.confidence,
                    attempt,
                    "found"
                );
                return self.click(hit.center);
            }
            if attempt < max_attempts && sleep_jitter_unless(&self.cancel, self.settings.retry_delay()) {
                return Err(Interrupt::Cancelled);
            }
        }
        Err(Interrupt::Step(StepError::TransientMatchFailure {
            template: template.id.clone(),
            attempts: max_attempts,
        }))
    }

    fn expect_state(&self, expected: &GameState, max_attempts: u32) -> Result<(), Interrupt> {
        let mut actual = self.feed.current_state();
        for attempt in 1..=max_attempts {
            actual = self.feed.current_state();
            if actual == *expected {
                return Ok(());
            }
            if attempt < max_attempts && self.cancel.wait(self.settings.poll()) {
                return Err(Interrupt::Cancelled);
            }
        }
        Err(Interrupt::Step(StepError::UnexpectedState { expected: expected.clone(), actual }))
    }

    fn lock_scan(&self) -> MutexGuard<'_, Option<ScanReport>> {
        self.last_scan.lock().unwrap_or_else(|e| e.into_inner())
    }
}
