use crate::services::cycle::{CycleReport, Engine, Trigger};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Running,
    Stopped,
}

/// Result of asking for a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Requested {
    /// No cycle was running or queued; one will start.
    Queued,
    /// Folded into a cycle that is already queued.
    Coalesced,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub phase: Phase,
    pub pending: Option<Trigger>,
    pub last_cycle: Option<CycleReport>,
}

struct ControlState {
    phase: Phase,
    pending: Option<Trigger>,
    current: Option<CancellationToken>,
    last_cycle: Option<CycleReport>,
}

/// Shared handle for starting, cancelling and observing cycles.
///
/// At most one cycle runs at a time; requests that arrive while one is
/// running collapse into a single follow-up cycle.
pub struct CycleControl {
    state: Mutex<ControlState>,
    wake: Notify,
    shutdown: CancellationToken,
}

impl CycleControl {
    pub fn new(shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ControlState {
                phase: Phase::Idle,
                pending: None,
                current: None,
                last_cycle: None,
            }),
            wake: Notify::new(),
            shutdown,
        })
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn request(&self, trigger: Trigger) -> Requested {
        let outcome = {
            let mut state = self.lock();
            if state.phase == Phase::Stopped || self.shutdown.is_cancelled() {
                return Requested::Stopped;
            }
            match state.pending {
                Some(_) => Requested::Coalesced,
                None => {
                    state.pending = Some(trigger);
                    Requested::Queued
                }
            }
        };
        self.wake.notify_one();
        outcome
    }

    /// Cancels the running cycle, if any. Actions already under way finish.
    pub fn cancel_current(&self) -> bool {
        let state = self.lock();
        match &state.current {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    pub fn status(&self) -> SchedulerStatus {
        let state = self.lock();
        SchedulerStatus {
            phase: state.phase,
            pending: state.pending,
            last_cycle: state.last_cycle.clone(),
        }
    }

    pub fn last_cycle(&self) -> Option<CycleReport> {
        self.lock().last_cycle.clone()
    }

    fn begin(&self) -> Option<(Trigger, CancellationToken)> {
        let mut state = self.lock();
        let trigger = state.pending.take()?;
        let token = self.shutdown.child_token();
        state.phase = Phase::Running;
        state.current = Some(token.clone());
        Some((trigger, token))
    }

    fn end(&self, report: CycleReport) {
        let mut state = self.lock();
        state.phase = Phase::Idle;
        state.current = None;
        state.last_cycle = Some(report);
    }

    fn stop(&self) {
        let mut state = self.lock();
        state.phase = Phase::Stopped;
        state.pending = None;
    }

    /// Queues a timer cycle unless something else is already queued.
    fn tick(&self) {
        let mut state = self.lock();
        if state.pending.is_none() {
            state.pending = Some(Trigger::Timer);
        }
    }
}

pub struct SyncScheduler {
    control: Arc<CycleControl>,
    handle: JoinHandle<()>,
}

impl SyncScheduler {
    /// Spawns the scheduling loop and queues the startup cycle.
    pub fn start(engine: Engine, control: Arc<CycleControl>) -> Self {
        control.request(Trigger::Startup);
        let handle = tokio::spawn(run_loop(engine, control.clone()));
        tracing::info!("Sync scheduler started");
        Self { control, handle }
    }

    pub fn control(&self) -> &Arc<CycleControl> {
        &self.control
    }

    /// Stops scheduling and waits for the running cycle to reach a safe point.
    pub async fn shutdown(self) {
        self.control.shutdown.cancel();
        if let Err(e) = self.handle.await {
            tracing::error!("Sync scheduler task failed: {e}");
        }
        tracing::info!("Sync scheduler stopped");
    }
}

async fn interval(engine: &Engine) -> Duration {
    match engine.store.load_settings().await {
        Ok(settings) => settings.sync_interval(),
        Err(e) => {
            tracing::warn!("[DB] Failed to load settings, using default interval: {e:#}");
            crate::config::EngineSettings::default().sync_interval()
        }
    }
}

async fn run_loop(engine: Engine, control: Arc<CycleControl>) {
    let mut last_finished: Option<Instant> = None;

    loop {
        if control.shutdown.is_cancelled() {
            break;
        }

        if let Some((trigger, token)) = control.begin() {
            let report = engine.run_cycle(trigger, &token).await;
            last_finished = Some(Instant::now());
            control.end(report);
            continue;
        }

        // The next timer cycle counts from when the last one finished.
        let next_due = match last_finished {
            Some(t) => t + interval(&engine).await,
            None => Instant::now() + interval(&engine).await,
        };
        tokio::select! {
            _ = control.shutdown.cancelled() => break,
            _ = tokio::time::sleep_until(next_due) => {
                tracing::debug!("Sync interval elapsed");
                control.tick();
            }
            _ = control.wake.notified() => {}
        }
    }

    control.stop();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryAdapter;
    use crate::db::StateStore;
    use crate::services::executor::Adapters;
    use crate::ws::events::EventBus;

    fn engine(delay: Duration) -> (tempfile::TempDir, Engine) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(&dir.path().join("state.db")).unwrap();
        let local = Arc::new(MemoryAdapter::local());
        local.set_delay(delay);
        let remote = Arc::new(MemoryAdapter::remote());
        (
            dir,
            Engine::new(Adapters::new(local, remote), store, EventBus::new()),
        )
    }

    async fn wait_idle(control: &CycleControl) {
        for _ in 0..200 {
            if control.phase() == Phase::Idle && control.status().pending.is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("scheduler never went idle");
    }

    #[test]
    fn test_requests_coalesce_while_queued() {
        let control = CycleControl::new(CancellationToken::new());
        assert_eq!(control.request(Trigger::Manual), Requested::Queued);
        assert_eq!(control.request(Trigger::Manual), Requested::Coalesced);
        assert_eq!(control.status().pending, Some(Trigger::Manual));
    }

    #[tokio::test]
    async fn test_startup_cycle_runs_and_is_recorded() {
        let (_dir, engine) = engine(Duration::ZERO);
        let store = engine.store.clone();
        let control = CycleControl::new(CancellationToken::new());
        let scheduler = SyncScheduler::start(engine, control.clone());

        wait_idle(&control).await;
        let last = control.last_cycle().unwrap();
        assert_eq!(last.trigger, Trigger::Startup);
        assert_eq!(store.recent_cycles(10).await.unwrap().len(), 1);

        scheduler.shutdown().await;
        assert_eq!(control.phase(), Phase::Stopped);
        assert_eq!(control.request(Trigger::Manual), Requested::Stopped);
    }

    #[tokio::test]
    async fn test_cancel_current_cycle() {
        let (_dir, engine) = engine(Duration::from_millis(300));
        let control = CycleControl::new(CancellationToken::new());
        let scheduler = SyncScheduler::start(engine, control.clone());

        for _ in 0..100 {
            if control.phase() == Phase::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(control.cancel_current());
        wait_idle(&control).await;
        assert_eq!(
            control.last_cycle().unwrap().status,
            crate::services::cycle::CycleStatus::Cancelled
        );
        scheduler.shutdown().await;
    }
}
