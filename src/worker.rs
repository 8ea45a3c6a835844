//! Background execution of one build or emulator run at a time.
//!
//! The caller thread only reads the published status string. A second
//! submission while one is in flight is rejected: reconciliation moves and
//! deletes files, so two attempts must never share a working directory.
use crate::emulator::{launch, LaunchOutcome, LaunchRequest};
use crate::pipeline::{run_build_observed, BuildReport, BuildRequest};
use anyhow::{anyhow, Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Runs attempts off the caller's thread and publishes their status.
#[derive(Debug, Clone, Default)]
pub struct BuildWorker {
    busy: Arc<AtomicBool>,
    status: Arc<Mutex<String>>,
}

/// Clears the busy flag when the attempt ends, even on panic.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl BuildWorker {
    pub fn new() -> Self {
        let worker = Self::default();
        worker.publish("Ready");
        worker
    }

    /// Latest published status.
    pub fn status(&self) -> String {
        self.status
            .lock()
            .map(|status| status.clone())
            .unwrap_or_default()
    }

    /// Start a build in the background.
    pub fn submit_build(&self, request: BuildRequest) -> Result<JoinHandle<BuildReport>> {
        let guard = self.claim()?;
        let worker = self.clone();
        worker.publish("Building...");
        thread::Builder::new()
            .name("asmtodsk-build".to_string())
            .spawn(move || {
                let _guard = guard;
                let report = run_build_observed(&request, &mut |state| worker.publish(state.label()));
                worker.publish(&report.outcome.status_line());
                report
            })
            .context("spawn build worker")
    }

    /// Start an emulator session (with optional fallback build) in the background.
    pub fn submit_run(
        &self,
        request: LaunchRequest,
        fallback_build: Option<BuildRequest>,
    ) -> Result<JoinHandle<Result<LaunchOutcome>>> {
        let guard = self.claim()?;
        let worker = self.clone();
        worker.publish("Starting emulator...");
        thread::Builder::new()
            .name("asmtodsk-run".to_string())
            .spawn(move || {
                let _guard = guard;
                let outcome = launch(&request, fallback_build.as_ref());
                match &outcome {
                    Ok(outcome) => worker.publish(&outcome.status_line()),
                    Err(err) => worker.publish(&format!("Run failed: {err:#}")),
                }
                outcome
            })
            .context("spawn run worker")
    }

    fn claim(&self) -> Result<BusyGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| anyhow!("another build or run is already in progress"))?;
        Ok(BusyGuard(Arc::clone(&self.busy)))
    }

    fn publish(&self, text: &str) {
        if let Ok(mut status) = self.status.lock() {
            *status = text.to_string();
        }
    }
}
