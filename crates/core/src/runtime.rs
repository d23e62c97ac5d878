//! Wires the long-running parts together and tears them down again.

use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};

use crate::cancel::CancellationToken;
use crate::capture::{CapturePipeline, FrameSource};
use crate::classifier::{ClassifierSnapshot, StateClassifier};
use crate::connectivity::ConnectivityObserver;
use crate::matcher::{MatchPrimitive, NccPrimitive, TemplateMatcher};
use crate::orchestrator::Orchestrator;
use crate::platform::Device;
use crate::profile::Profile;
use crate::settings::Settings;
use crate::types::{ConnectionState, PipelineHealth};

/// Point-in-time view of a running system.
#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub classifier: ClassifierSnapshot,
    pub health: PipelineHealth,
    pub connection: Option<ConnectionState>,
    pub dropped_frames: u64,
    pub last_scan: Option<String>,
}

pub struct Runtime {
    profile: Arc<Profile>,
    connectivity: Arc<ConnectivityObserver>,
    pipeline: Arc<CapturePipeline>,
    classifier: Arc<StateClassifier>,
    classifier_stop: CancellationToken,
    classifier_thread: Option<JoinHandle<()>>,
    orchestrator: Arc<Orchestrator>,
}

impl Runtime {
    /// Start with the bundled correlation matcher.
    pub fn start(settings: &Settings, profile: Profile, device: Arc<dyn Device>) -> Result<Self> {
        Self::start_with(settings, profile, device, Arc::new(NccPrimitive))
    }

    /// Start connectivity polling, capture and classification.
    pub fn start_with(
        settings: &Settings,
        profile: Profile,
        device: Arc<dyn Device>,
        primitive: Arc<dyn MatchPrimitive>,
    ) -> Result<Self> {
        let profile = Arc::new(profile);
        let matcher = TemplateMatcher::new(primitive);

        let connectivity = ConnectivityObserver::new(Arc::clone(&device), settings.connectivity.interval());
        let pipeline = CapturePipeline::new(Arc::clone(&device), settings.capture.clone());
        pipeline.watch(&connectivity);
        connectivity.start();
        pipeline.start();

        let classifier = Arc::new(StateClassifier::new(profile.rules.clone(), matcher.clone()));
        let classifier_stop = CancellationToken::new();
        let frames: Arc<dyn FrameSource> = pipeline.clone();
        let classifier_thread = match classifier.spawn(Arc::clone(&frames), settings.classifier.poll(), classifier_stop.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                pipeline.stop();
                connectivity.stop();
                return Err(e).context("failed to start classifier thread");
            }
        };

        let orchestrator = Arc::new(Orchestrator::new(
            device,
            frames,
            classifier.clone(),
            matcher,
            Arc::clone(&profile),
            settings.orchestrator.clone(),
            CancellationToken::new(),
        ));
        tracing::info!(target: "runtime", rules = profile.rules.len(), "runtime started");

        Ok(Self {
            profile,
            connectivity,
            pipeline,
            classifier,
            classifier_stop,
            classifier_thread: Some(classifier_thread),
            orchestrator,
        })
    }

    pub fn profile(&self) -> &Arc<Profile> {
        &self.profile
    }

    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        Arc::clone(&self.orchestrator)
    }

    pub fn classifier(&self) -> &Arc<StateClassifier> {
        &self.classifier
    }

    pub fn status(&self) -> RuntimeStatus {
        RuntimeStatus {
            classifier: self.classifier.snapshot(),
            health: self.pipeline.health(),
            connection: self.connectivity.state(),
            dropped_frames: self.pipeline.queue().dropped(),
            last_scan: self.orchestrator.last_scan().map(|s| s.summary()),
        }
    }

    /// Stop everything, consumers first. Safe to call more than once.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.classifier_thread.take() else {
            return;
        };
        self.orchestrator.request_cancel();
        self.classifier_stop.request();
        if handle.join().is_err() {
            tracing::error!(target: "runtime", "classifier thread panicked");
        }
        self.pipeline.stop();
        self.connectivity.stop();
        tracing::info!(target: "runtime", "runtime stopped");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
