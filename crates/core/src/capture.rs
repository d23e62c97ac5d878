//! Screen capture producer.
//!
//! One thread samples the device at a fixed rate and pushes frames into a
//! bounded queue that drops the oldest frame on overflow. Each sample is
//! bounded by a timeout; repeated failures or a lost device link mark the
//! pipeline `Degraded` instead of blocking consumers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use image::DynamicImage;

use crate::bus::SubscriptionId;
use crate::cancel::CancellationToken;
use crate::connectivity::ConnectivityObserver;
use crate::error::DeviceError;
use crate::platform::Device;
use crate::settings::CaptureSettings;
use crate::types::{ConnectionState, Frame, PipelineHealth};

/// Where consumers get frames from.
pub trait FrameSource: Send + Sync {
    /// Most recent frame, without consuming it.
    fn latest(&self) -> Option<Frame>;
    /// Oldest queued frame, waiting up to `timeout` for one to arrive.
    fn next_frame(&self, timeout: Duration) -> Option<Frame>;
    fn health(&self) -> PipelineHealth;
}

struct QueueState {
    frames: VecDeque<Frame>,
    latest: Option<Frame>,
    dropped: u64,
}

/// Bounded frame queue; recency wins over completeness.
pub struct FrameQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState { frames: VecDeque::new(), latest: None, dropped: 0 }),
            ready: Condvar::new(),
        }
    }

    /// Enqueue a frame. Returns `true` if the oldest frame was discarded.
    pub fn push(&self, frame: Frame) -> bool {
        let mut state = self.lock();
        let mut dropped = false;
        while state.frames.len() >= self.capacity {
            state.frames.pop_front();
            state.dropped += 1;
            dropped = true;
        }
        state.latest = Some(frame.clone());
        state.frames.push_back(frame);
        drop(state);
        self.ready.notify_one();
        dropped
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(frame) = state.frames.pop_front() {
                return Some(frame);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = match self.ready.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    pub fn latest(&self) -> Option<Frame> {
        self.lock().latest.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames discarded because a consumer fell behind.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

const FRESH_POLL: Duration = Duration::from_millis(20);

/// Wait until `source` offers a frame captured at or after `since`, so a
/// decision is never made on a screen that predates the last click.
pub fn fresh_frame(
    source: &dyn FrameSource,
    since: Instant,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Option<Frame> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(frame) = source.latest().filter(|f| f.captured_at() >= since) {
            return Some(frame);
        }
        let now = Instant::now();
        if now >= deadline || cancel.wait(FRESH_POLL.min(deadline - now)) {
            return None;
        }
    }
}

type CaptureResult = Result<DynamicImage, DeviceError>;

/// Runs `Device::capture` on a helper thread so a hung device cannot stall
/// the producer. At most one sample is outstanding.
struct Sampler {
    device: Arc<dyn Device>,
    pending: Option<mpsc::Receiver<CaptureResult>>,
}

impl Sampler {
    fn new(device: Arc<dyn Device>) -> Self {
        Self { device, pending: None }
    }

    fn sample(&mut self, timeout: Duration) -> CaptureResult {
        if let Some(rx) = &self.pending {
            match rx.try_recv() {
                // Late result of a timed-out attempt: stale, discard it.
                Ok(_) | Err(TryRecvError::Disconnected) => self.pending = None,
                Err(TryRecvError::Empty) => return Err(DeviceError::Timeout(timeout)),
            }
        }
        let (tx, rx) = mpsc::channel();
        let device = Arc::clone(&self.device);
        thread::Builder::new()
            .name("capture-sample".into())
            .spawn(move || {
                let _ = tx.send(device.capture());
            })
            .map_err(|e| DeviceError::Failed(format!("failed to spawn sampler: {e}")))?;
        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                self.pending = Some(rx);
                Err(DeviceError::Timeout(timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(DeviceError::Failed("sampler exited without a result".into())),
        }
    }
}

/// One started producer with its own stop token. A producer that missed
/// the stop timeout stays here until the next `start()` joins it.
struct Worker {
    handle: JoinHandle<()>,
    done: mpsc::Receiver<()>,
    stop: CancellationToken,
}

impl Worker {
    fn is_live(&self) -> bool {
        !self.stop.is_requested() && !self.handle.is_finished()
    }
}

pub struct CapturePipeline {
    device: Arc<dyn Device>,
    settings: CaptureSettings,
    queue: FrameQueue,
    health: Mutex<PipelineHealth>,
    failures: AtomicU32,
    link_down: AtomicBool,
    seq: AtomicU64,
    stopped: AtomicBool,
    worker: Mutex<Option<Worker>>,
}

impl CapturePipeline {
    pub fn new(device: Arc<dyn Device>, settings: CaptureSettings) -> Arc<Self> {
        Arc::new(Self {
            device,
            queue: FrameQueue::new(settings.queue_capacity),
            settings,
            health: Mutex::new(PipelineHealth::Idle),
            failures: AtomicU32::new(0),
            link_down: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            worker: Mutex::new(None),
        })
    }

    pub fn queue(&self) -> &FrameQueue {
        &self.queue
    }

    pub fn is_running(&self) -> bool {
        self.lock_worker().as_ref().is_some_and(Worker::is_live)
    }

    /// Start the producer thread. A no-op while it is already running.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.lock_worker();
        if worker.as_ref().is_some_and(Worker::is_live) {
            tracing::debug!(target: "capture", "start ignored, already running");
            return;
        }
        // A stopping producer exits after its current sample.
        if let Some(old) = worker.take() {
            let _ = old.handle.join();
        }
        self.stopped.store(false, Ordering::SeqCst);
        self.failures.store(0, Ordering::SeqCst);
        self.refresh_health();

        let stop = CancellationToken::new();
        let (done_tx, done) = mpsc::channel();
        let (this, token) = (Arc::clone(self), stop.clone());
        let handle = thread::spawn(move || {
            this.produce(&token);
            let _ = done_tx.send(());
        });
        *worker = Some(Worker { handle, done, stop });
        tracing::info!(target: "capture", fps = self.settings.fps, device = self.device.name(), "capture started");
    }

    /// Ask the producer to exit and wait up to the configured stop timeout.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let mut slot = self.lock_worker();
        if let Some(worker) = slot.take() {
            worker.stop.request();
            match worker.done.recv_timeout(self.settings.stop_timeout()) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    let _ = worker.handle.join();
                    tracing::info!(target: "capture", "capture stopped");
                }
                Err(RecvTimeoutError::Timeout) => {
                    tracing::warn!(target: "capture", timeout = ?self.settings.stop_timeout(), "producer did not exit in time, leaving it to finish its sample");
                    *slot = Some(worker);
                }
            }
        }
        drop(slot);
        self.set_health(PipelineHealth::Stopped);
    }

    /// Follow the connectivity observer: a lost link degrades the pipeline.
    pub fn watch(self: &Arc<Self>, observer: &ConnectivityObserver) -> SubscriptionId {
        let weak: Weak<Self> = Arc::downgrade(self);
        observer.bus().subscribe(move |state: &ConnectionState| {
            if let Some(this) = weak.upgrade() {
                this.link_down.store(*state == ConnectionState::Disconnected, Ordering::SeqCst);
                this.refresh_health();
            }
            Ok(())
        })
    }

    fn produce(&self, stop: &CancellationToken) {
        let mut sampler = Sampler::new(Arc::clone(&self.device));
        let interval = self.settings.interval();
        loop {
            if stop.is_requested() {
                break;
            }
            let started = Instant::now();
            let sample = sampler.sample(self.settings.sample_timeout());
            if stop.is_requested() {
                break;
            }
            match sample {
                Ok(image) => {
                    self.failures.store(0, Ordering::SeqCst);
                    let seq = self.seq.fetch_add(1, Ordering::Relaxed);
                    if self.queue.push(Frame::new(image.to_luma8(), seq)) {
                        tracing::trace!(target: "capture", seq, "queue full, dropped oldest frame");
                    }
                }
                Err(e) => {
                    let n = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                    tracing::warn!(target: "capture", error = %e, failures = n, threshold = self.settings.failure_threshold, "capture failed");
                }
            }
            self.refresh_health();

            let pause = interval.saturating_sub(started.elapsed()).max(Duration::from_millis(10));
            if stop.wait(pause) {
                break;
            }
        }
        tracing::debug!(target: "capture", "producer exiting");
    }

    fn refresh_health(&self) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let degraded = self.link_down.load(Ordering::SeqCst)
            || self.failures.load(Ordering::SeqCst) >= self.settings.failure_threshold;
        self.set_health(if degraded { PipelineHealth::Degraded } else { PipelineHealth::Running });
    }

    fn set_health(&self, next: PipelineHealth) {
        let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        if *health != next {
            match next {
                PipelineHealth::Degraded => tracing::warn!(target: "capture", from = ?*health, "pipeline degraded"),
                _ => tracing::info!(target: "capture", from = ?*health, to = ?next, "pipeline health changed"),
            }
            *health = next;
        }
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl FrameSource for CapturePipeline {
    fn latest(&self) -> Option<Frame> {
        self.queue.latest()
    }

    fn next_frame(&self, timeout: Duration) -> Option<Frame> {
        self.queue.pop_timeout(timeout)
    }

    fn health(&self) -> PipelineHealth {
        *self.health.lock().unwrap_or_else(|e| e.into_inner())
    }
}
