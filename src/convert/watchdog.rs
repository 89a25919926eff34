//! Debounced trigger that starts the converter when uploads arrive.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pipeline::{ConverterPipeline, StartOutcome};

/// Follow-up delay while a batch is still running.
const MIN_FOLLOW_UP: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct ConverterWatchdog {
    wake: Arc<Notify>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ConverterWatchdog {
    /// Start watching. With `kickoff`, pending work from a previous run is
    /// started right away.
    pub fn spawn(pipeline: Arc<ConverterPipeline>, throttle: Duration, kickoff: bool) -> Self {
        let wake = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(watch(
            pipeline,
            throttle,
            Arc::clone(&wake),
            cancel.clone(),
            kickoff,
        ));
        info!(throttle_secs = throttle.as_secs_f64(), "Converter watchdog started");
        Self {
            wake,
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Something changed in the raw holding area.
    pub fn signal(&self) {
        self.wake.notify_one();
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().expect("watchdog handle lock poisoned").take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Converter watchdog ended abnormally");
            }
        }
        info!("Converter watchdog stopped");
    }
}

impl Drop for ConverterWatchdog {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn watch(
    pipeline: Arc<ConverterPipeline>,
    throttle: Duration,
    wake: Arc<Notify>,
    cancel: CancellationToken,
    kickoff: bool,
) {
    let mut follow_up = kickoff && trigger(&pipeline);
    loop {
        if follow_up {
            tokio::select! {
                () = tokio::time::sleep(throttle.max(MIN_FOLLOW_UP)) => {}
                () = wake.notified() => {}
                () = cancel.cancelled() => return,
            }
        } else {
            tokio::select! {
                () = wake.notified() => {}
                () = cancel.cancelled() => return,
            }
        }

        // Every new signal restarts the throttle window.
        loop {
            tokio::select! {
                () = tokio::time::sleep(throttle) => break,
                () = wake.notified() => debug!("Upload signal, throttle window restarted"),
                () = cancel.cancelled() => return,
            }
        }

        follow_up = trigger(&pipeline);
    }
}

/// Queue new uploads and start a batch if possible. Returns true when the
/// converter was busy and another look is needed later.
fn trigger(pipeline: &Arc<ConverterPipeline>) -> bool {
    match pipeline.enqueue_new_files() {
        Ok(added) if added > 0 => debug!(added, "Watchdog queued new uploads"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Watchdog could not scan raw uploads"),
    }
    match pipeline.start() {
        Ok(StartOutcome::Started { pending, .. }) => {
            info!(pending, "Watchdog started converter");
            false
        }
        Ok(StartOutcome::AlreadyRunning) => {
            debug!(pending = pipeline.pending(), "Converter busy, checking again later");
            true
        }
        Ok(StartOutcome::NothingToConvert) => false,
        Err(e) => {
            warn!(error = %e, "Watchdog could not start converter");
            false
        }
    }
}
