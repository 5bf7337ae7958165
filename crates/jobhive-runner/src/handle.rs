use std::{sync::Arc, time::Duration};

use jobhive_common::TerminationReason;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopRequest {
    pub reason: TerminationReason,
    /// Time between SIGTERM and SIGKILL.
    pub grace: Duration,
}

/// Control handle for one supervised process.
///
/// Only the first stop request counts; later ones, and requests made after
/// the process is gone, are no-ops.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    stop: Arc<watch::Sender<Option<StopRequest>>>,
}

impl Default for ProcessHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessHandle {
    pub fn new() -> Self {
        let (stop, _) = watch::channel(None);
        Self {
            stop: Arc::new(stop),
        }
    }

    /// Returns `true` if this call issued the stop.
    pub fn terminate(&self, reason: TerminationReason, grace: Duration) -> bool {
        self.stop.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(StopRequest { reason, grace });
            true
        })
    }

    pub fn stop_requested(&self) -> Option<StopRequest> {
        *self.stop.borrow()
    }

    /// Waits for the first stop request.
    pub async fn stopped(&self) -> StopRequest {
        stop_signal(&mut self.subscribe()).await
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Option<StopRequest>> {
        self.stop.subscribe()
    }
}

/// Resolves once a stop has been requested.
pub(crate) async fn stop_signal(receiver: &mut watch::Receiver<Option<StopRequest>>) -> StopRequest {
    loop {
        if let Some(stop) = *receiver.borrow_and_update() {
            return stop;
        }
        if receiver.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
