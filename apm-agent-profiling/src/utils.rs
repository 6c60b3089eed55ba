// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::{
    sync::{Arc, Condvar, Mutex},
    thread,
    time::Duration,
};

use apm_agent::apm_error;

use crate::error::ProfilingError;

/// A one-shot flag threads can wait on with a timeout
#[derive(Default)]
pub(crate) struct Signal {
    raised: Mutex<bool>,
    condvar: Condvar,
}

impl Signal {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn raise(&self) {
        if let Ok(mut raised) = self.raised.lock() {
            *raised = true;
            self.condvar.notify_all();
        }
    }

    /// Waits up to `timeout` for the signal. Returns whether it was raised,
    /// which ends any periodic loop promptly instead of at the next tick.
    pub(crate) fn wait_raised(&self, timeout: Duration) -> bool {
        let Ok(raised) = self.raised.lock() else {
            return true;
        };
        match self
            .condvar
            .wait_timeout_while(raised, timeout, |raised| !*raised)
        {
            Ok((raised, _)) => *raised,
            Err(_) => true,
        }
    }
}

/// Owns a background worker thread: a stop signal, a finished signal and the
/// join handle
pub(crate) struct WorkerHandle {
    join_handle: Mutex<Option<thread::JoinHandle<()>>>,
    stop: Arc<Signal>,
    finished: Arc<Signal>,
}

impl WorkerHandle {
    pub(crate) fn new(
        stop: Arc<Signal>,
        finished: Arc<Signal>,
        handle: thread::JoinHandle<()>,
    ) -> Self {
        WorkerHandle {
            join_handle: Mutex::new(Some(handle)),
            stop,
            finished,
        }
    }

    /// Signals the worker to stop and joins it, bounded by `timeout`
    pub(crate) fn stop_and_join(&self, timeout: Duration) -> Result<(), ProfilingError> {
        let Some(handle) = self
            .join_handle
            .lock()
            .map_err(|_| {
                apm_error!("WorkerHandle.stop_and_join: handle mutex poisoned");
                ProfilingError::WorkerStop("handle mutex poisoned".to_string())
            })?
            .take()
        else {
            return Ok(());
        };
        self.stop.raise();
        if !self.finished.wait_raised(timeout) {
            return Err(ProfilingError::WorkerStop("shutdown timed out".to_string()));
        }
        handle.join().map_err(|e| {
            let err = if let Some(e) = e.downcast_ref::<&'static str>() {
                e
            } else if let Some(e) = e.downcast_ref::<String>() {
                e
            } else {
                "unknown panic type"
            };
            apm_error!("WorkerHandle.stop_and_join: worker panicked: {}", err);
            ProfilingError::WorkerStop(err.to_string())
        })?;
        Ok(())
    }
}
