//! Global load admission queue
//!
//! FIFO of pending load jobs gated by a fixed concurrency ceiling. Each dispatched
//! job receives a `LoadTicket`; completing (or dropping) the ticket frees the slot
//! and re-dispatches after a short delay. A job that panics while being started, or
//! whose task panics later, still releases its slot because the ticket is dropped
//! during unwinding.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, error};

use crate::config::LoaderConfig;
use crate::error::AssetError;

type LoadFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type LoadJob = Box<dyn FnOnce(LoadTicket) -> LoadFuture + Send>;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<LoadJob>,
    in_flight: usize,
    peak: usize,
}

struct QueueInner {
    state: Mutex<QueueState>,
    ceiling: usize,
    redispatch_delay: Duration,
    idle: Notify,
}

#[derive(Clone)]
pub struct LoadQueue {
    inner: Arc<QueueInner>,
}

/// Proof of an occupied slot. Completing or dropping it frees the slot exactly once.
pub struct LoadTicket {
    queue: LoadQueue,
    done: bool,
}

impl LoadTicket {
    pub fn complete(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if !self.done {
            self.done = true;
            self.queue.on_complete();
        }
    }
}

impl Drop for LoadTicket {
    fn drop(&mut self) {
        self.finish();
    }
}

impl LoadQueue {
    pub fn new(config: &LoaderConfig) -> Self {
        Self::with_ceiling(config.max_concurrent_loads, config.redispatch_delay())
    }

    pub fn with_ceiling(ceiling: usize, redispatch_delay: Duration) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                ceiling: ceiling.max(1),
                redispatch_delay,
                idle: Notify::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a job and start it if a slot is free.
    ///
    /// The job must eventually complete or drop its ticket; a job that never does
    /// holds its slot forever.
    pub fn enqueue<F, Fut>(&self, job: F)
    where
        F: FnOnce(LoadTicket) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let job: LoadJob = Box::new(move |ticket| Box::pin(job(ticket)));
        self.state().pending.push_back(job);
        self.dispatch();
    }

    fn dispatch(&self) {
        loop {
            let job = {
                let mut state = self.state();
                if state.in_flight >= self.inner.ceiling {
                    return;
                }
                let Some(job) = state.pending.pop_front() else {
                    return;
                };
                state.in_flight += 1;
                state.peak = state.peak.max(state.in_flight);
                job
            };

            let ticket = LoadTicket {
                queue: self.clone(),
                done: false,
            };

            // The ticket moves into the job, so an unwind drops it and frees the slot.
            let future = match catch_unwind(AssertUnwindSafe(move || job(ticket))) {
                Ok(future) => future,
                Err(_) => {
                    error!("Load job panicked before starting; slot released");
                    continue;
                }
            };

            match Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(future);
                }
                Err(_) => {
                    error!("No async runtime to run load job; dropping it");
                    drop(future);
                }
            }
        }
    }

    fn on_complete(&self) {
        let (idle, has_pending) = {
            let mut state = self.state();
            if state.in_flight == 0 {
                let violation = AssetError::QueueOverrun {
                    in_flight: state.in_flight,
                    ceiling: self.inner.ceiling,
                };
                error!("{}", violation);
            } else {
                state.in_flight -= 1;
            }
            (
                state.in_flight == 0 && state.pending.is_empty(),
                !state.pending.is_empty(),
            )
        };

        if idle {
            self.inner.idle.notify_waiters();
        }
        if has_pending {
            self.schedule_dispatch();
        }
    }

    fn schedule_dispatch(&self) {
        let delay = self.inner.redispatch_delay;
        match Handle::try_current() {
            Ok(runtime) if !delay.is_zero() => {
                let queue = self.clone();
                runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    queue.dispatch();
                });
            }
            _ => self.dispatch(),
        }
    }

    pub fn ceiling(&self) -> usize {
        self.inner.ceiling
    }

    pub fn in_flight(&self) -> usize {
        self.state().in_flight
    }

    pub fn pending(&self) -> usize {
        self.state().pending.len()
    }

    /// Highest in-flight count observed since construction
    pub fn peak_in_flight(&self) -> usize {
        self.state().peak
    }

    pub fn is_idle(&self) -> bool {
        let state = self.state();
        state.in_flight == 0 && state.pending.is_empty()
    }

    /// Resolve once nothing is pending or in flight
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                debug!("Load queue idle");
                return;
            }
            notified.await;
        }
    }
}

impl Default for LoadQueue {
    fn default() -> Self {
        Self::new(&LoaderConfig::default())
    }
}
