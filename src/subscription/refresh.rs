//! In-flight refresh tracking.
//!
//! Every dispatched refresh holds a [`RefreshTicket`] from the moment it is
//! scheduled until it finishes. A [`RefreshHandle`] resolves once no ticket is
//! outstanding, which is what unsubscribe waits for. A refresh that panicked
//! marks its ticket, and the handle reports it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Default)]
struct InFlight {
    pending: usize,
    panicked: u64,
}

/// Refreshes awaited by a [`RefreshHandle`] panicked. The panics were contained
/// and logged; the subscription itself is unaffected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{count} in-flight refresh(es) panicked")]
pub struct RefreshPanicked {
    pub count: u64,
}

#[derive(Debug)]
pub(crate) struct RefreshTracker {
    state: Arc<watch::Sender<InFlight>>,
}

impl RefreshTracker {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(InFlight::default());
        Self {
            state: Arc::new(state),
        }
    }

    /// Mark a refresh as in flight until the ticket is dropped.
    pub(crate) fn begin(&self) -> RefreshTicket {
        self.state.send_modify(|s| s.pending += 1);
        RefreshTicket {
            state: Arc::clone(&self.state),
            panicked: AtomicBool::new(false),
        }
    }

    pub(crate) fn current(&self) -> RefreshHandle {
        let state = self.state.subscribe();
        let baseline = state.borrow().panicked;
        RefreshHandle { state, baseline }
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.state.borrow().pending
    }
}

/// Held by a scheduled or running refresh.
#[derive(Debug)]
pub(crate) struct RefreshTicket {
    state: Arc<watch::Sender<InFlight>>,
    panicked: AtomicBool,
}

impl RefreshTicket {
    /// Record that the refresh holding this ticket panicked.
    pub(crate) fn mark_panicked(&self) {
        self.panicked.store(true, Ordering::Relaxed);
    }
}

impl Drop for RefreshTicket {
    fn drop(&mut self) {
        let panicked = u64::from(*self.panicked.get_mut());
        self.state.send_modify(|s| {
            s.pending = s.pending.saturating_sub(1);
            s.panicked += panicked;
        });
    }
}

/// Completes when every refresh in flight at the time of the call (and any
/// started since) has finished.
#[derive(Debug)]
pub struct RefreshHandle {
    state: watch::Receiver<InFlight>,
    baseline: u64,
}

impl RefreshHandle {
    pub fn is_idle(&self) -> bool {
        self.state.borrow().pending == 0
    }

    /// Wait until idle. Fails if any refresh that finished in the meantime
    /// panicked.
    pub async fn wait(mut self) -> Result<(), RefreshPanicked> {
        // Err means the tracker is gone, so nothing can still be running
        let panicked = self
            .state
            .wait_for(|s| s.pending == 0)
            .await
            .map(|s| s.panicked)
            .unwrap_or_else(|_| self.state.borrow().panicked);

        match panicked.saturating_sub(self.baseline) {
            0 => Ok(()),
            count => Err(RefreshPanicked { count }),
        }
    }
}
