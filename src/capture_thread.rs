//! Per-feed background capture thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::error::{CameraError, Result};

/// Cooperative stop flag shared between a capture thread and its owner.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    /// Ask the capture loop to exit after its current iteration.
    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether a stop was requested.
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A named background thread running one capture loop.
///
/// The thread is always joined, never detached: dropping the handle raises
/// the stop signal and waits for the body to return.
#[derive(Debug)]
pub struct CaptureThread<T> {
    name: String,
    stop: StopSignal,
    handle: Option<JoinHandle<T>>,
}

impl<T: Send + 'static> CaptureThread<T> {
    /// Spawn `body` on a new thread. The body polls the signal it is given.
    pub fn spawn<F>(name: &str, body: F) -> Result<Self>
    where
        F: FnOnce(StopSignal) -> T + Send + 'static,
    {
        let stop = StopSignal::default();
        let signal = stop.clone();
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || body(signal))
            .map_err(|err| CameraError::CaptureThread(format!("spawn {name}: {err}")))?;

        log::debug!("{name}: capture thread started");
        Ok(Self {
            name: name.to_owned(),
            stop,
            handle: Some(handle),
        })
    }

    /// Thread name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the body has already returned.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Raise the stop signal and wait for the body's result.
    pub fn stop(mut self) -> Result<T> {
        self.stop.raise();
        let handle = self
            .handle
            .take()
            .ok_or_else(|| CameraError::CaptureThread(format!("{} already joined", self.name)))?;
        let value = handle
            .join()
            .map_err(|_| CameraError::CaptureThread(format!("{} panicked", self.name)))?;
        log::debug!("{}: capture thread joined", self.name);
        Ok(value)
    }
}

impl<T> Drop for CaptureThread<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.stop.raise();
            if handle.join().is_err() {
                log::error!("{}: capture thread panicked", self.name);
            }
        }
    }
}
