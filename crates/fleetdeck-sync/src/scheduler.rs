use fleetdeck_api::RunnerTransport;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::SharedFleetStore;

pub const DEFAULT_TICK: Duration = Duration::from_secs(5);
pub const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(60);
const COMMAND_QUEUE_CAPACITY: usize = 8;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick: Duration,
    pub idle_threshold: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: DEFAULT_TICK,
            idle_threshold: DEFAULT_IDLE_THRESHOLD,
        }
    }
}

/// Injected activity signal. Interaction layers call `record` on operator
/// input; the scheduler only reads `idle_for`. Backed by the tokio clock so
/// paused-time tests drive it deterministically.
#[derive(Clone)]
pub struct ActivityPulse {
    last: Arc<Mutex<Instant>>,
}

impl ActivityPulse {
    pub fn new() -> Self {
        Self {
            last: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn record(&self) {
        *self.last.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last.lock().unwrap().elapsed()
    }
}

impl Default for ActivityPulse {
    fn default() -> Self {
        Self::new()
    }
}

enum SchedulerCommand {
    RefreshNow,
    Shutdown,
}

/// Control handle for a running scheduler loop. Safe to call after the loop
/// is gone; a dropped request is logged, not fatal.
pub struct SchedulerHandle {
    tx: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    pub fn refresh_now(&self) {
        match self.tx.try_send(SchedulerCommand::RefreshNow) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(event = "refresh_request_drop", reason = "queue_full");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(event = "refresh_request_drop", reason = "channel_closed");
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = self.tx.try_send(SchedulerCommand::Shutdown);
    }
}

/// Idle-aware refresh loop. While the operator is active their own commands
/// keep the fleet current, so background refresh only runs once the activity
/// pulse has been quiet past the idle threshold. Each refresh is awaited
/// inline, which keeps at most one in flight.
pub struct Scheduler<T: RunnerTransport> {
    transport: T,
    store: SharedFleetStore,
    pulse: ActivityPulse,
    config: SchedulerConfig,
    rx: mpsc::Receiver<SchedulerCommand>,
}

impl<T: RunnerTransport> Scheduler<T> {
    pub fn new(
        transport: T,
        store: SharedFleetStore,
        pulse: ActivityPulse,
        config: SchedulerConfig,
    ) -> (Self, SchedulerHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        (
            Self {
                transport,
                store,
                pulse,
                config,
                rx,
            },
            SchedulerHandle { tx },
        )
    }

    pub async fn run(self) {
        let Scheduler {
            transport,
            store,
            pulse,
            config,
            mut rx,
        } = self;

        let mut ticker = interval_at(Instant::now() + config.tick, config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let idle = pulse.idle_for();
                    if idle < config.idle_threshold {
                        debug!(
                            event = "refresh_suppressed",
                            reason = "operator_active",
                            idle_ms = idle.as_millis() as u64
                        );
                        continue;
                    }
                    refresh_once(&transport, &store).await;
                }
                command = rx.recv() => match command {
                    Some(SchedulerCommand::RefreshNow) => refresh_once(&transport, &store).await,
                    Some(SchedulerCommand::Shutdown) | None => break,
                },
            }
        }
        debug!(event = "scheduler_stopped");
    }
}

impl<T> Scheduler<T>
where
    T: RunnerTransport + Send + Sync + 'static,
{
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

/// One refresh cycle. Failures are swallowed here: the store is left
/// untouched and the next tick retries. A snapshot that raced a targeted
/// mutation is discarded by the store's version guard.
async fn refresh_once<T: RunnerTransport>(transport: &T, store: &SharedFleetStore) {
    let observed = store.lock().await.version();
    match transport.list().await {
        Ok(instances) => {
            let count = instances.len();
            let mut store = store.lock().await;
            if store.replace_if_unchanged(instances, observed) {
                debug!(event = "fleet_refreshed", runners = count);
            } else {
                debug!(
                    event = "refresh_discarded",
                    reason = "store_changed",
                    observed_version = observed
                );
            }
        }
        Err(err) => {
            warn!(event = "refresh_failed", error = %err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_instance, FakeTransport};
    use crate::FleetStore;
    use fleetdeck_core::RunnerStatus;

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            tick: Duration::from_secs(5),
            idle_threshold: Duration::from_secs(60),
        }
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_while_operator_active_do_not_refresh() {
        let transport = FakeTransport::default();
        let store = FleetStore::shared();
        let pulse = ActivityPulse::new();
        let (scheduler, _handle) = Scheduler::new(
            transport.clone(),
            Arc::clone(&store),
            pulse.clone(),
            test_config(),
        );
        scheduler.spawn();
        settle().await;

        tokio::time::advance(Duration::from_secs(59)).await;
        settle().await;
        assert_eq!(transport.list_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_past_idle_threshold_refreshes_once() {
        let transport = FakeTransport::default();
        transport.push_list(Ok(vec![sample_instance(1, RunnerStatus::Offline)]));
        let store = FleetStore::shared();
        let pulse = ActivityPulse::new();
        let (scheduler, _handle) = Scheduler::new(
            transport.clone(),
            Arc::clone(&store),
            pulse.clone(),
            test_config(),
        );
        scheduler.spawn();
        settle().await;

        tokio::time::advance(Duration::from_secs(59)).await;
        settle().await;
        assert_eq!(transport.list_calls(), 0);

        // the tick at t+60 sees 60s of idleness
        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(transport.list_calls(), 1);
        assert_eq!(store.lock().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recorded_activity_suppresses_the_background_refresh_again() {
        let transport = FakeTransport::default();
        let store = FleetStore::shared();
        let pulse = ActivityPulse::new();
        let (scheduler, _handle) = Scheduler::new(
            transport.clone(),
            Arc::clone(&store),
            pulse.clone(),
            test_config(),
        );
        scheduler.spawn();
        settle().await;

        tokio::time::advance(Duration::from_secs(61)).await;
        settle().await;
        let after_idle = transport.list_calls();
        assert!(after_idle >= 1);

        pulse.record();
        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(transport.list_calls(), after_idle);
    }

    #[tokio::test(start_paused = true)]
    async fn refreshes_never_overlap_even_when_slow() {
        let transport = FakeTransport::default();
        transport.set_delay(Duration::from_secs(12));
        let store = FleetStore::shared();
        let pulse = ActivityPulse::new();
        let (scheduler, _handle) = Scheduler::new(
            transport.clone(),
            Arc::clone(&store),
            pulse.clone(),
            test_config(),
        );
        scheduler.spawn();
        settle().await;

        // the refresh picked up at t+61 holds the loop until t+73; the ticks
        // due at t+65 and t+70 must not start another one
        tokio::time::advance(Duration::from_secs(61)).await;
        settle().await;
        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(transport.list_calls(), 1);

        tokio::time::advance(Duration::from_secs(20)).await;
        settle().await;
        assert_eq!(transport.max_in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_is_swallowed_and_retried() {
        let transport = FakeTransport::default();
        transport.push_list(Err(crate::testing::status_error(500, "backend down")));
        transport.push_list(Ok(vec![sample_instance(4, RunnerStatus::Online)]));
        let store = FleetStore::shared();
        let pulse = ActivityPulse::new();
        let (scheduler, _handle) = Scheduler::new(
            transport.clone(),
            Arc::clone(&store),
            pulse.clone(),
            test_config(),
        );
        scheduler.spawn();
        settle().await;

        tokio::time::advance(Duration::from_secs(61)).await;
        settle().await;
        assert_eq!(transport.list_calls(), 1);
        assert!(store.lock().await.is_empty());
        assert!(store.lock().await.last_synced().is_none());

        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(transport.list_calls(), 2);
        assert!(store.lock().await.contains(4));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_refresh_result_is_discarded() {
        let transport = FakeTransport::default();
        transport.set_delay(Duration::from_secs(10));
        transport.push_list(Ok(vec![sample_instance(1, RunnerStatus::Offline)]));
        let store = FleetStore::shared();
        let pulse = ActivityPulse::new();
        let (scheduler, _handle) = Scheduler::new(
            transport.clone(),
            Arc::clone(&store),
            pulse.clone(),
            test_config(),
        );
        scheduler.spawn();
        settle().await;

        tokio::time::advance(Duration::from_secs(61)).await;
        settle().await;
        assert_eq!(transport.list_calls(), 1);

        // a command result lands while the list response is still in flight
        store
            .lock()
            .await
            .upsert(sample_instance(1, RunnerStatus::Starting));
        pulse.record();

        tokio::time::advance(Duration::from_secs(12)).await;
        settle().await;
        assert_eq!(
            store.lock().await.get(1).map(|instance| instance.status),
            Some(RunnerStatus::Starting)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_now_bypasses_the_idle_threshold() {
        let transport = FakeTransport::default();
        transport.push_list(Ok(vec![sample_instance(2, RunnerStatus::Online)]));
        let store = FleetStore::shared();
        let pulse = ActivityPulse::new();
        let (scheduler, handle) = Scheduler::new(
            transport.clone(),
            Arc::clone(&store),
            pulse.clone(),
            test_config(),
        );
        scheduler.spawn();
        settle().await;

        handle.refresh_now();
        settle().await;
        assert_eq!(transport.list_calls(), 1);
        assert!(store.lock().await.contains(2));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_the_loop() {
        let transport = FakeTransport::default();
        let store = FleetStore::shared();
        let pulse = ActivityPulse::new();
        let (scheduler, handle) = Scheduler::new(
            transport.clone(),
            Arc::clone(&store),
            pulse.clone(),
            test_config(),
        );
        let task = scheduler.spawn();
        settle().await;

        handle.shutdown();
        settle().await;
        assert!(task.is_finished());

        tokio::time::advance(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(transport.list_calls(), 0);
    }
}
