//! Background periodic loop and one-shot recording timers

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use super::engine::Recorder;
use crate::request::RequestEngine;

/// Drive periodic hooks, stream flushing and the disk monitor until the
/// recorder is dropped or the task is aborted
pub(crate) async fn run_periodic(recorder: Weak<Recorder>, requests: Arc<RequestEngine>) {
    debug!("Periodic task started");
    let mut last = Instant::now();

    loop {
        let wait = {
            let Some(recorder) = recorder.upgrade() else {
                break;
            };
            let now = Instant::now();
            let elapsed = now.duration_since(last);
            last = now;
            recorder.periodic_step(elapsed)
        };

        tokio::select! {
            () = requests.wakeup().notified() => {}
            () = tokio::time::sleep(wait) => {}
        }
    }

    debug!("Periodic task finished");
}

pub(crate) fn spawn_periodic(
    runtime: &Handle,
    recorder: &Arc<Recorder>,
    requests: Arc<RequestEngine>,
) -> AbortHandle {
    runtime
        .spawn(run_periodic(Arc::downgrade(recorder), requests))
        .abort_handle()
}

/// Start recording `id` after `delay`
pub(crate) fn spawn_start_timer(
    runtime: &Handle,
    recorder: &Arc<Recorder>,
    id: u64,
    delay: Duration,
) -> AbortHandle {
    let recorder = Arc::downgrade(recorder);
    runtime
        .spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(recorder) = recorder.upgrade() {
                debug!("Start timer fired for recording {}", id);
                if let Err(e) = recorder.start(id) {
                    warn!("Scheduled start of recording {} failed: {}", id, e);
                }
            }
        })
        .abort_handle()
}

/// Stop recording `id` after `delay`
pub(crate) fn spawn_stop_timer(
    runtime: &Handle,
    recorder: &Arc<Recorder>,
    id: u64,
    delay: Duration,
) -> AbortHandle {
    let recorder = Arc::downgrade(recorder);
    runtime
        .spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(recorder) = recorder.upgrade() {
                debug!("Stop timer fired for recording {}", id);
                if let Err(e) = recorder.stop(id) {
                    warn!("Scheduled stop of recording {} failed: {}", id, e);
                }
            }
        })
        .abort_handle()
}
