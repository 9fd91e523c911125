//! Entry point for triggering runs. At most one run per scan kind is in
//! flight in this process; the run itself executes on a spawned task so the
//! trigger returns as soon as the run row exists.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{info, warn};

use super::run_log::RunLog;
use super::{AthScanner, Sources, SpikeScanner};
use crate::api::health::HealthState;
use crate::config::ScanSettings;
use crate::db::store::now_ms;
use crate::db::Store;
use crate::error::{AppError, Result};
use crate::types::{RunSummary, ScanKind};

#[derive(Clone)]
pub struct ScanService {
    store: Store,
    sources: Sources,
    /// Kind → run id of the run in flight. 0 while the run row is being created.
    active: Arc<DashMap<ScanKind, i64>>,
    health: Arc<HealthState>,
}

/// Releases the kind's slot when the run task ends, however it ends.
struct ActiveRun {
    kind: ScanKind,
    active: Arc<DashMap<ScanKind, i64>>,
}

impl ActiveRun {
    fn set_run_id(&self, run_id: i64) {
        self.active.insert(self.kind, run_id);
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.active.remove(&self.kind);
    }
}

impl ScanService {
    pub fn new(store: Store, sources: Sources, health: Arc<HealthState>) -> Self {
        Self { store, sources, active: Arc::new(DashMap::new()), health }
    }

    pub fn health(&self) -> &HealthState {
        &self.health
    }

    /// Runs in flight, as `(kind, run_id)`.
    pub fn active(&self) -> Vec<(ScanKind, i64)> {
        self.active.iter().map(|e| (*e.key(), *e.value())).collect()
    }

    fn claim(&self, kind: ScanKind) -> Result<ActiveRun> {
        match self.active.entry(kind) {
            Entry::Occupied(_) => Err(AppError::AlreadyRunning(kind.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(0);
                Ok(ActiveRun { kind, active: Arc::clone(&self.active) })
            }
        }
    }

    /// Create the run row and execute it in the background. Returns the new
    /// run id, or `AlreadyRunning` when this kind already has a run in flight.
    pub async fn start(&self, kind: ScanKind) -> Result<i64> {
        let guard = self.claim(kind)?;
        let run_id = self.store.create_run(kind).await?;
        guard.set_run_id(run_id);
        info!(run_id, kind = %kind, "[SERVICE] run accepted");

        let svc = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            svc.execute(kind, run_id).await;
        });
        Ok(run_id)
    }

    /// Same single-flight rule as [`start`](Self::start), but waits for the
    /// terminal summary.
    pub async fn run_to_completion(&self, kind: ScanKind) -> Result<RunSummary> {
        let guard = self.claim(kind)?;
        let run_id = self.store.create_run(kind).await?;
        guard.set_run_id(run_id);
        Ok(self.execute(kind, run_id).await)
    }

    async fn execute(&self, kind: ScanKind, run_id: i64) -> RunSummary {
        self.health.run_started();
        let summary = match self.store.load_settings().await {
            Ok(rows) => {
                let settings = ScanSettings::from_rows(&rows);
                let (store, sources) = (self.store.clone(), self.sources.clone());
                match kind {
                    ScanKind::Ath => AthScanner::new(store, sources, &settings).execute(run_id).await,
                    ScanKind::Spike => SpikeScanner::new(store, sources, &settings).execute(run_id).await,
                }
            }
            Err(e) => {
                warn!(run_id, "[SERVICE] settings unavailable: {e}");
                RunLog::new(run_id, kind, self.store.clone()).fail(e).await
            }
        };
        self.health.run_finished(summary.status, now_ms().max(0) as u64);
        summary
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::error::ScanError;
    use crate::fetcher::{ScreenerApi, ScreenerPage, ScreenerQuery};
    use crate::scan::testing::{MockHistory, MockQuotes, MockScreener};
    use crate::types::ScanStatus;

    /// Every page request waits for a permit, then comes back empty.
    struct GatedScreener {
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl ScreenerApi for GatedScreener {
        async fn scan_page(
            &self,
            _market: &str,
            _query: &ScreenerQuery,
            _offset: usize,
            _limit: usize,
        ) -> std::result::Result<ScreenerPage, ScanError> {
            let _permit = self.gate.acquire().await.ok();
            Ok(ScreenerPage { total_count: 0, rows: Vec::new() })
        }
    }

    fn service(store: Store, screener: Arc<dyn ScreenerApi>) -> ScanService {
        let sources = Sources {
            screener,
            history: Arc::new(MockHistory::default()),
            quotes: Arc::new(MockQuotes(None)),
        };
        ScanService::new(store, sources, Arc::new(HealthState::new()))
    }

    async fn wait_idle(svc: &ScanService) {
        for _ in 0..200 {
            if svc.active().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run never finished");
    }

    #[tokio::test]
    async fn second_trigger_for_same_kind_is_refused() {
        let store = Store::in_memory().await.unwrap();
        store.put_setting("ath.groups", "america:NYSE").await.unwrap();
        let gate = Arc::new(Semaphore::new(0));
        let svc = service(store.clone(), Arc::new(GatedScreener { gate: gate.clone() }));

        let first = svc.start(ScanKind::Ath).await.unwrap();
        assert_eq!(svc.active(), vec![(ScanKind::Ath, first)]);
        let err = svc.start(ScanKind::Ath).await.unwrap_err();
        assert!(matches!(err, AppError::AlreadyRunning(ref k) if k == "ath"));

        gate.add_permits(100);
        wait_idle(&svc).await;

        let row = store.get_run(first).await.unwrap().unwrap();
        assert_eq!(row.status, "failed");
        let second = svc.start(ScanKind::Ath).await.unwrap();
        assert!(second > first);
        wait_idle(&svc).await;
        assert_eq!(svc.health().snapshot().runs_failed, 2);
    }

    #[tokio::test]
    async fn kinds_do_not_block_each_other() {
        let store = Store::in_memory().await.unwrap();
        store.put_setting("spike.markets", "america").await.unwrap();
        let gate = Arc::new(Semaphore::new(0));
        let svc = service(store, Arc::new(GatedScreener { gate: gate.clone() }));

        svc.start(ScanKind::Ath).await.unwrap();
        svc.start(ScanKind::Spike).await.unwrap();
        assert_eq!(svc.active().len(), 2);

        gate.add_permits(1_000);
        wait_idle(&svc).await;
    }

    #[tokio::test]
    async fn run_to_completion_returns_the_terminal_summary() {
        let store = Store::in_memory().await.unwrap();
        store.put_setting("spike.markets", "america").await.unwrap();
        let svc = service(store, Arc::new(MockScreener { rows: HashMap::new() }));

        let summary = svc.run_to_completion(ScanKind::Spike).await.unwrap();
        assert_eq!(summary.status, ScanStatus::Failed);
        assert!(svc.active().is_empty());
        let h = svc.health().snapshot();
        assert_eq!((h.runs_started, h.runs_failed), (1, 1));
        assert!(h.last_finished_at_ms.is_some());
    }
}
