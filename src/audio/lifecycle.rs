//! Engine lifecycle: state machine and worker threads with bounded joins

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::AudioError;

/// Lifecycle state of a capture or playback engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    Uninitialized,
    Ready,
    Running,
    Stopped,
    /// Terminal
    Closed,
}

impl EngineState {
    pub fn name(self) -> &'static str {
        match self {
            EngineState::Uninitialized => "uninitialized",
            EngineState::Ready => "ready",
            EngineState::Running => "running",
            EngineState::Stopped => "stopped",
            EngineState::Closed => "closed",
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a lifecycle request should do given the current state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    Proceed,
    /// Already in the requested state; warn and return
    AlreadyDone,
}

fn invalid(engine: &'static str, operation: &'static str, state: EngineState) -> AudioError {
    AudioError::InvalidState {
        engine,
        operation,
        state: state.name(),
    }
}

pub(crate) fn check_initialize(
    engine: &'static str,
    state: EngineState,
) -> Result<Transition, AudioError> {
    match state {
        EngineState::Uninitialized => Ok(Transition::Proceed),
        EngineState::Closed => Err(invalid(engine, "initialize", state)),
        _ => Ok(Transition::AlreadyDone),
    }
}

pub(crate) fn check_start(
    engine: &'static str,
    state: EngineState,
) -> Result<Transition, AudioError> {
    match state {
        EngineState::Ready | EngineState::Stopped => Ok(Transition::Proceed),
        EngineState::Running => Ok(Transition::AlreadyDone),
        EngineState::Uninitialized | EngineState::Closed => Err(invalid(engine, "start", state)),
    }
}

/// A named thread whose exit can be awaited with a timeout.
///
/// Each worker gets its own run flag. A thread abandoned after a join timeout
/// keeps seeing its flag cleared even if the engine starts a new worker.
pub(crate) struct Worker {
    name: String,
    handle: JoinHandle<()>,
    /// Disconnects when the thread returns or unwinds
    done: Receiver<()>,
    running: Arc<AtomicBool>,
}

impl Worker {
    /// Spawn `body` with the worker's run flag, already set
    pub(crate) fn spawn<F>(name: &str, body: F) -> Result<Self, AudioError>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let (done_tx, done_rx) = bounded::<()>(0);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _done = done_tx;
                body(flag);
            })
            .map_err(|e| AudioError::StreamError(format!("failed to spawn {}: {}", name, e)))?;

        Ok(Self {
            name: name.to_string(),
            handle,
            done: done_rx,
            running,
        })
    }

    /// Clear this worker's run flag
    pub(crate) fn signal_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Wait up to `timeout` for the thread to finish. Returns true once it has.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        matches!(
            self.done.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected) | Ok(())
        )
    }

    /// Join the thread if it finishes within `timeout`, otherwise hand the worker back
    pub(crate) fn try_join(self, timeout: Duration) -> Result<(), Worker> {
        if !self.wait(timeout) {
            return Err(self);
        }
        if self.handle.join().is_err() {
            tracing::error!("Worker thread {} panicked", self.name);
        }
        Ok(())
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }
}

/// Stop a worker and wait up to `timeout` for it. A worker that does not exit
/// in time is returned so the next start can wait for it.
pub(crate) fn stop_worker(worker: Worker, timeout: Duration) -> Option<Worker> {
    worker.signal_stop();
    match worker.try_join(timeout) {
        Ok(()) => None,
        Err(worker) => {
            tracing::warn!(
                "{} thread did not exit within {:?}; leaving it to finish",
                worker.name(),
                timeout
            );
            Some(worker)
        }
    }
}

/// Wait for a worker left behind by an earlier stop.
///
/// Fails with `JoinTimeout`, keeping the worker, if it is still running after `timeout`.
pub(crate) fn reap_stale(stale: &mut Option<Worker>, timeout: Duration) -> Result<(), AudioError> {
    let Some(worker) = stale.take() else {
        return Ok(());
    };

    tracing::debug!("Waiting for previous {} thread", worker.name());
    match worker.try_join(timeout) {
        Ok(()) => Ok(()),
        Err(worker) => {
            *stale = Some(worker);
            Err(AudioError::JoinTimeout(timeout))
        }
    }
}
