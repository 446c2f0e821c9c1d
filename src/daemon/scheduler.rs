// Scheduler: one pipeline run per tick, never two at once.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::pipeline::Pipeline;
use crate::store::ReportStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Counters returned when the scheduler stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub runs: usize,
    pub skipped_ticks: usize,
}

pub struct Scheduler {
    pipeline: Pipeline,
    store: Arc<ReportStore>,
    interval: Duration,
    run_on_start: bool,
    state: watch::Sender<SchedulerState>,
}

impl Scheduler {
    pub fn new(
        pipeline: Pipeline,
        store: Arc<ReportStore>,
        interval: Duration,
        run_on_start: bool,
    ) -> Self {
        let (state, _) = watch::channel(SchedulerState::Stopped);
        Self {
            pipeline,
            store,
            interval,
            run_on_start,
            state,
        }
    }

    pub fn state(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: SchedulerState) {
        debug!(?state, "scheduler state");
        self.state.send_replace(state);
    }

    /// Ticks until `shutdown` resolves, then waits for the in-flight run.
    ///
    /// A tick that fires while a run is still going is dropped, not queued.
    pub async fn run<F>(&self, shutdown: F) -> SchedulerStats
    where
        F: Future<Output = ()>,
    {
        self.set_state(SchedulerState::Starting);

        let first = if self.run_on_start {
            Instant::now()
        } else {
            Instant::now() + self.interval
        };
        let mut ticker = interval_at(first, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut stats = SchedulerStats::default();
        let mut in_flight: Option<JoinHandle<()>> = None;
        tokio::pin!(shutdown);

        self.set_state(SchedulerState::Running);
        info!(
            interval_secs = self.interval.as_secs(),
            run_on_start = self.run_on_start,
            endpoints = self.pipeline.endpoint_count(),
            "scheduler running"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    if in_flight.as_ref().is_some_and(|h| !h.is_finished()) {
                        stats.skipped_ticks += 1;
                        debug!("previous run still in progress, skipping tick");
                        continue;
                    }
                    if let Some(handle) = in_flight.take() {
                        reap(handle).await;
                    }

                    stats.runs += 1;
                    let pipeline = self.pipeline.clone();
                    let store = Arc::clone(&self.store);
                    in_flight = Some(tokio::spawn(async move {
                        let report = pipeline.run().await;
                        if let Err(e) = store.publish(report) {
                            error!(code = %e.code(), error = %e, "cannot persist report");
                        }
                    }));
                }
            }
        }

        self.set_state(SchedulerState::Stopping);
        if let Some(handle) = in_flight.take() {
            info!("waiting for in-flight run to finish");
            reap(handle).await;
        }
        self.set_state(SchedulerState::Stopped);

        info!(runs = stats.runs, skipped_ticks = stats.skipped_ticks, "scheduler stopped");
        stats
    }
}

async fn reap(handle: JoinHandle<()>) {
    if let Err(e) = handle.await {
        warn!(error = %e, "pipeline run task failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineLimits;
    use crate::errors::FetchError;
    use crate::fetcher::ResponseFetcher;
    use crate::protocol::{CapturedResponse, EndpointDefinition};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Slow fetcher that records how many fetches overlap.
    #[derive(Default)]
    struct SlowFetcher {
        delay: Duration,
        active: AtomicUsize,
        max_active: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ResponseFetcher for SlowFetcher {
        async fn fetch(
            &self,
            definition: &EndpointDefinition,
        ) -> Result<CapturedResponse, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(CapturedResponse {
                url: definition.request.url.clone(),
                status: 200,
                headers: BTreeMap::new(),
                body: json!({}),
                elapsed_ms: self.delay.as_millis() as u64,
            })
        }
    }

    fn scheduler(
        fetcher: Arc<SlowFetcher>,
        interval: Duration,
        run_on_start: bool,
    ) -> (Scheduler, Arc<ReportStore>) {
        let def: EndpointDefinition = serde_json::from_value(json!({
            "name": "slow",
            "request": { "url": "http://localhost/slow" }
        }))
        .unwrap();
        let pipeline = Pipeline::new(vec![def], vec![], fetcher, PipelineLimits::default());
        let store = Arc::new(ReportStore::in_memory());
        (
            Scheduler::new(pipeline, Arc::clone(&store), interval, run_on_start),
            store,
        )
    }

    #[tokio::test]
    async fn test_overlapping_ticks_are_skipped() {
        let fetcher = Arc::new(SlowFetcher {
            delay: Duration::from_millis(150),
            ..Default::default()
        });
        let (scheduler, store) = scheduler(Arc::clone(&fetcher), Duration::from_millis(20), true);

        let stats = scheduler
            .run(tokio::time::sleep(Duration::from_millis(500)))
            .await;

        assert_eq!(fetcher.max_active.load(Ordering::SeqCst), 1);
        assert!(stats.runs >= 2);
        assert!(stats.skipped_ticks > 0);
        // Every started run completed and published exactly one report.
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), stats.runs);
        assert_eq!(store.history().len(), stats.runs);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_run() {
        let fetcher = Arc::new(SlowFetcher {
            delay: Duration::from_millis(200),
            ..Default::default()
        });
        let (scheduler, store) = scheduler(Arc::clone(&fetcher), Duration::from_secs(60), true);
        let state = scheduler.state();

        let stats = scheduler
            .run(tokio::time::sleep(Duration::from_millis(30)))
            .await;

        assert_eq!(stats.runs, 1);
        assert!(store.current().is_some());
        assert_eq!(*state.borrow(), SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn test_without_run_on_start_waits_one_interval() {
        let fetcher = Arc::new(SlowFetcher::default());
        let (scheduler, store) = scheduler(Arc::clone(&fetcher), Duration::from_secs(60), false);

        let stats = scheduler
            .run(tokio::time::sleep(Duration::from_millis(50)))
            .await;

        assert_eq!(stats.runs, 0);
        assert!(store.current().is_none());
    }
}
