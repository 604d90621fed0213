//! Rendezvous barriers for paired workers.
//!
//! A [`Rendezvous`] keeps the control and treatment workers aligned at fixed
//! protocol checkpoints: both must arrive before either proceeds, and an
//! optional callback fires exactly once on release.
//!
//! A barrier has no timeout. Instead, every wait observes the pair's shared
//! [`AbortSignal`]: when one worker fails fatally it trips the signal, and
//! the sibling's wait returns [`BarrierWait::Aborted`] instead of blocking
//! forever on a partner that will never arrive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Outcome of one barrier wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierWait {
    /// All parties arrived; everyone proceeds together.
    Released,
    /// The pair's abort signal tripped while waiting.
    Aborted,
}

/// Shared one-way kill switch for a worker pair. Any worker can trip it;
/// it never resets.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    tripped: Arc<AtomicBool>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trip(&self) {
        self.tripped.store(true, Ordering::SeqCst);
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }
}

struct BarrierState {
    arrived: usize,
    generation: u64,
}

type ReleaseCallback = Box<dyn Fn() + Send + Sync>;

/// N-party rendezvous point (here always 2) with an on-release callback.
pub struct Rendezvous {
    parties: usize,
    state: Mutex<BarrierState>,
    condvar: Condvar,
    on_release: Option<ReleaseCallback>,
}

/// Wake-up cadence while blocked; each wake re-checks the abort signal.
const ABORT_POLL: Duration = Duration::from_millis(100);

impl Rendezvous {
    pub fn new(parties: usize) -> Self {
        Self {
            parties,
            state: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
            }),
            condvar: Condvar::new(),
            on_release: None,
        }
    }

    pub fn with_callback<F>(parties: usize, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut barrier = Self::new(parties);
        barrier.on_release = Some(Box::new(callback));
        barrier
    }

    /// Blocks until all parties arrive or the abort signal trips.
    ///
    /// The final arriver releases everyone and fires the callback; since a
    /// barrier is consumed once per experiment, the callback fires exactly
    /// once per release.
    pub fn wait(&self, abort: &AbortSignal) -> BarrierWait {
        if abort.is_tripped() {
            return BarrierWait::Aborted;
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.arrived += 1;
        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation += 1;
            if let Some(callback) = &self.on_release {
                callback();
            }
            self.condvar.notify_all();
            return BarrierWait::Released;
        }
        let generation = state.generation;
        loop {
            let (next, _timeout) = self
                .condvar
                .wait_timeout(state, ABORT_POLL)
                .unwrap_or_else(|e| e.into_inner());
            state = next;
            if state.generation != generation {
                return BarrierWait::Released;
            }
            if abort.is_tripped() {
                return BarrierWait::Aborted;
            }
        }
    }
}
