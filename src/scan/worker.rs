//! Deadline-bounded batch worker shared by both scan variants.
//!
//! Each batch runs its items concurrently, every item under its own timeout.
//! The phase as a whole is bounded by an optional stall window (no item
//! finished without timing out) and an optional total wall-clock budget.

use std::future::Future;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::time::Instant;

use crate::error::ScanError;
use crate::types::StopReason;

#[derive(Debug, Clone, Copy)]
pub struct WorkerPolicy {
    pub batch_size: usize,
    pub per_item_timeout: Duration,
    pub stall: Option<Duration>,
    pub total: Option<Duration>,
    pub pause: Duration,
}

/// One finished item. `elapsed` covers only this item's own work.
#[derive(Debug)]
pub struct Completed<T, R> {
    pub item: T,
    pub result: Result<R, ScanError>,
    pub elapsed: Duration,
}

pub struct BoundedWorker {
    policy: WorkerPolicy,
    started: Instant,
    last_progress: Instant,
}

impl BoundedWorker {
    pub fn new(policy: WorkerPolicy) -> Self {
        let now = Instant::now();
        Self { policy, started: now, last_progress: now }
    }

    pub fn batch_size(&self) -> usize {
        self.policy.batch_size.max(1)
    }

    fn deadline(&self) -> Option<Instant> {
        let total = self.policy.total.map(|d| self.started + d);
        let stall = self.policy.stall.map(|d| self.last_progress + d);
        match (total, stall) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Why the phase must stop now, if it must.
    pub fn stop_reason(&self) -> Option<StopReason> {
        let now = Instant::now();
        if self.policy.total.is_some_and(|d| now >= self.started + d) {
            return Some(StopReason::BudgetExhausted);
        }
        if self.policy.stall.is_some_and(|d| now >= self.last_progress + d) {
            return Some(StopReason::Stalled);
        }
        None
    }

    pub async fn pause(&self) {
        if !self.policy.pause.is_zero() {
            tokio::time::sleep(self.policy.pause).await;
        }
    }

    /// Run one batch. Items still in flight when the deadline passes are
    /// cancelled and come back as [`ScanError::CutOff`], so every item of the
    /// batch is accounted for. The stop reason is returned alongside.
    pub async fn run_batch<T, R, F, Fut>(
        &mut self,
        items: Vec<T>,
        work: F,
    ) -> (Vec<Completed<T, R>>, Option<StopReason>)
    where
        T: Clone,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R, ScanError>>,
    {
        let limit = self.policy.per_item_timeout;
        let batch_started = Instant::now();
        let mut pending: Vec<Option<T>> = items.iter().cloned().map(Some).collect();
        let mut in_flight: FuturesUnordered<_> = items
            .into_iter()
            .enumerate()
            .map(|(idx, item)| {
                let fut = work(item.clone());
                async move {
                    let started = Instant::now();
                    let result = match tokio::time::timeout(limit, fut).await {
                        Ok(r) => r,
                        Err(_) => Err(ScanError::Timeout(limit)),
                    };
                    (idx, Completed { item, result, elapsed: started.elapsed() })
                }
            })
            .collect();

        let mut done = Vec::new();
        while !in_flight.is_empty() {
            let next = match self.deadline() {
                Some(deadline) => match tokio::time::timeout_at(deadline, in_flight.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        let reason = self.stop_reason().unwrap_or(StopReason::Stalled);
                        let elapsed = batch_started.elapsed();
                        done.extend(pending.into_iter().flatten().map(|item| Completed {
                            item,
                            result: Err(ScanError::CutOff(reason)),
                            elapsed,
                        }));
                        return (done, Some(reason));
                    }
                },
                None => in_flight.next().await,
            };
            let Some((idx, c)) = next else { break };
            pending[idx] = None;
            if !matches!(c.result, Err(ScanError::Timeout(_))) {
                self.last_progress = Instant::now();
            }
            done.push(c);
        }
        (done, None)
    }
}
