//! One-shot hydration gate
//!
//! Mutations issued before the initial load completes are parked in a FIFO
//! queue and each caller waits until its own closure has actually run. The
//! first resolution (real or forced by timeout) drains the queue exactly
//! once and discards it; later resolutions are no-ops.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::{Mutex, oneshot, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HydrationState {
    Pending,
    /// The load from disk completed
    Resolved,
    /// The load did not finish in time; resolution was forced
    TimedOut,
}

impl HydrationState {
    pub fn is_resolved(self) -> bool {
        !matches!(self, HydrationState::Pending)
    }
}

type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Job = Box<dyn FnOnce() -> JobFuture + Send>;

pub struct HydrationGate {
    /// `Some` while pending. Held for the whole drain, so direct callers
    /// queue up behind the parked closures instead of interleaving.
    queue: Mutex<Option<VecDeque<Job>>>,
    state: watch::Sender<HydrationState>,
}

impl Default for HydrationGate {
    fn default() -> Self {
        Self::new()
    }
}

impl HydrationGate {
    pub fn new() -> Self {
        let (state, _) = watch::channel(HydrationState::Pending);
        Self {
            queue: Mutex::new(Some(VecDeque::new())),
            state,
        }
    }

    pub fn state(&self) -> HydrationState {
        *self.state.borrow()
    }

    pub fn is_hydrated(&self) -> bool {
        self.state().is_resolved()
    }

    pub async fn pending_len(&self) -> usize {
        self.queue.lock().await.as_ref().map_or(0, VecDeque::len)
    }

    /// Run `f` now if hydrated, otherwise park it until resolution.
    ///
    /// Returns `None` only if the gate is dropped while `f` is still parked.
    /// A parked closure must not call back into this gate.
    pub async fn enqueue_or_run<F, Fut, T>(&self, f: F) -> Option<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let mut queue = self.queue.lock().await;
        if queue.is_none() {
            drop(queue);
            return Some(f().await);
        }

        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || -> JobFuture {
            Box::pin(async move {
                let _ = tx.send(f().await);
            })
        });
        if let Some(pending) = queue.as_mut() {
            pending.push_back(job);
            debug!(queued = pending.len(), "Deferred settings operation until hydration");
        }
        drop(queue);

        rx.await.ok()
    }

    pub async fn resolve(&self, outcome: HydrationState) -> bool {
        self.resolve_with(outcome, || {}).await
    }

    /// Resolve the gate, running `apply` first if (and only if) this call
    /// is the one that resolves it. Returns `false` when already resolved.
    pub async fn resolve_with(&self, outcome: HydrationState, apply: impl FnOnce()) -> bool {
        if !outcome.is_resolved() {
            warn!("Ignoring request to resolve hydration gate to Pending");
            return false;
        }

        let mut queue = self.queue.lock().await;
        let Some(pending) = queue.take() else {
            debug!(?outcome, "Hydration gate already resolved");
            return false;
        };

        apply();
        info!(?outcome, queued = pending.len(), "Settings hydrated, draining deferred operations");
        for job in pending {
            job().await;
        }
        drop(queue);

        self.state.send_replace(outcome);
        true
    }

    /// Wait for hydration, forcing resolution after `timeout`. Never fails.
    pub async fn await_hydration(&self, timeout: Duration) -> HydrationState {
        let mut rx = self.state.subscribe();
        let wait = async {
            loop {
                let current = *rx.borrow_and_update();
                if current.is_resolved() || rx.changed().await.is_err() {
                    return current;
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(state) if state.is_resolved() => state,
            _ => {
                if self.resolve(HydrationState::TimedOut).await {
                    warn!(timeout_ms = timeout.as_millis() as u64, "Hydration timed out, continuing with current settings");
                }
                self.state()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn wait_for_queue(gate: &HydrationGate, len: usize) {
        while gate.pending_len().await < len {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_runs_immediately_once_resolved() {
        let gate = HydrationGate::new();
        assert!(gate.resolve(HydrationState::Resolved).await);
        assert_eq!(gate.enqueue_or_run(|| async { 7 }).await, Some(7));
    }

    #[tokio::test]
    async fn test_queued_operations_wait_then_run_in_order() {
        let gate = Arc::new(HydrationGate::new());
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..3 {
            let gate_task = gate.clone();
            let log_task = log.clone();
            handles.push(tokio::spawn(async move {
                gate_task
                    .enqueue_or_run(move || async move {
                        log_task.lock().unwrap().push(i);
                        i * 10
                    })
                    .await
            }));
            wait_for_queue(&gate, i + 1).await;
        }

        assert!(log.lock().unwrap().is_empty());
        assert!(!gate.is_hydrated());

        gate.resolve(HydrationState::Resolved).await;
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(gate.pending_len().await, 0);

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        assert_eq!(results, vec![Some(0), Some(10), Some(20)]);
    }

    #[tokio::test]
    async fn test_second_resolution_is_noop() {
        let gate = HydrationGate::new();
        assert!(gate.resolve(HydrationState::TimedOut).await);
        assert!(!gate.resolve(HydrationState::Resolved).await);
        assert_eq!(gate.state(), HydrationState::TimedOut);
    }

    #[tokio::test]
    async fn test_resolve_with_applies_only_first_time() {
        let gate = HydrationGate::new();
        let mut applied = 0;
        gate.resolve_with(HydrationState::Resolved, || applied += 1).await;
        gate.resolve_with(HydrationState::Resolved, || applied += 1).await;
        assert_eq!(applied, 1);
    }

    #[tokio::test]
    async fn test_timeout_forces_resolution_and_drains() {
        let gate = Arc::new(HydrationGate::new());
        let gate_task = gate.clone();
        let parked = tokio::spawn(async move { gate_task.enqueue_or_run(|| async { "ran" }).await });
        wait_for_queue(&gate, 1).await;

        let state = gate.await_hydration(Duration::from_millis(20)).await;
        assert_eq!(state, HydrationState::TimedOut);
        assert!(gate.is_hydrated());
        assert_eq!(parked.await.unwrap(), Some("ran"));
    }

    #[tokio::test]
    async fn test_await_returns_real_resolution() {
        let gate = Arc::new(HydrationGate::new());
        let resolver = gate.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            resolver.resolve(HydrationState::Resolved).await;
        });
        let state = gate.await_hydration(Duration::from_secs(5)).await;
        assert_eq!(state, HydrationState::Resolved);
    }

    #[tokio::test]
    async fn test_pending_is_not_a_resolution() {
        let gate = HydrationGate::new();
        assert!(!gate.resolve(HydrationState::Pending).await);
        assert!(!gate.is_hydrated());
    }
}
