//! Asynchronous device release
//!
//! Hardware teardown can block for tens of milliseconds, so it runs on a
//! background worker instead of the thread driving the sink. The pool is an
//! explicitly owned resource: the worker thread is started on first use,
//! counts outstanding releases, and exits as soon as none remain.
//!
//! The owner must treat a device as gone the instant release is requested.
//! Completion is signalled through the closure handed to
//! [`ReleasePool::release`], which runs on the worker thread; the sink uses
//! it to clear its `releasing` gate and queue a notification for the owning
//! thread.

use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct PoolState {
    sender: Option<Sender<Job>>,
    pending: usize,
}

/// Reference-counted background release worker.
#[derive(Clone, Default)]
pub struct ReleasePool {
    state: Arc<Mutex<PoolState>>,
}

impl ReleasePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of releases not yet completed
    pub fn pending(&self) -> usize {
        self.state.lock().map(|s| s.pending).unwrap_or(0)
    }

    /// Run `job` (the blocking teardown plus its completion signalling) on
    /// the worker thread, starting the thread if idle.
    pub fn release(&self, job: Job) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.pending += 1;

        if state.sender.is_none() {
            let (sender, receiver) = channel::<Job>();
            let pool_state = Arc::clone(&self.state);
            let spawned = thread::Builder::new()
                .name("playhead-release".into())
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        job();
                        let mut state = match pool_state.lock() {
                            Ok(state) => state,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        state.pending -= 1;
                        if state.pending == 0 {
                            // Nothing outstanding: let the thread die. A
                            // later release starts a fresh one.
                            state.sender = None;
                            debug!("release worker idle, shutting down");
                            break;
                        }
                    }
                });
            match spawned {
                Ok(_) => state.sender = Some(sender),
                Err(e) => {
                    // No worker available: run inline rather than leak the
                    // device. This blocks the caller, which beats losing the
                    // hardware handle.
                    warn!("failed to spawn release worker: {e}; releasing inline");
                    state.pending -= 1;
                    drop(state);
                    job();
                    return;
                }
            }
        }

        if let Some(sender) = state.sender.as_ref() {
            if sender.send(job).is_err() {
                warn!("release worker exited unexpectedly");
                state.pending -= 1;
            }
        }
    }
}
