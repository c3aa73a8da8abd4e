//! Background runtime
//!
//! Runs the timers of a workspace as tokio tasks:
//!
//! - a short tick that runs the debounced regeneration pass once its quiet
//!   period has elapsed
//! - the periodic push/refresh against the remote, with exponential backoff
//!   after transient failures
//! - the maintenance sweeper
//!
//! Every task locks the shared workspace only for local work. The runtime is
//! an explicit object: `start` spawns the tasks, `stop` shuts them down.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::queue::{SweepReport, Sweeper};
use crate::sync::{RemoteAuthority, SharedWorkspace, SyncEngine, SyncRound};
use crate::views::PassReport;

/// Timer settings for the background tasks
#[derive(Debug, Clone)]
pub struct BackgroundSettings {
    /// How often the debounce deadline is checked
    pub tick: Duration,
    /// Period between sync rounds when healthy
    pub sync_interval: Duration,
    /// First retry delay after a transient failure
    pub initial_backoff: Duration,
    /// Upper bound of the retry delay
    pub max_backoff: Duration,
    pub sweep_interval: Duration,
    pub sweeper: Sweeper,
}

impl BackgroundSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tick: Duration::from_millis(100),
            sync_interval: Duration::from_secs(config.sync.interval_secs),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(config.sync.max_backoff_secs),
            sweep_interval: Duration::from_secs(config.sweeper.interval_secs.max(1)),
            sweeper: Sweeper::from_config(config),
        }
    }
}

/// Events emitted by the background tasks
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RuntimeEvent {
    Regenerated { report: PassReport },
    Synced { round: SyncRound },
    SyncFailed { error: String, retry_in_secs: u64 },
    Swept { report: SweepReport },
}

/// Handle to the running background tasks
pub struct Background {
    workspace: Arc<SharedWorkspace>,
    settings: BackgroundSettings,
    shutdown: watch::Sender<bool>,
    sync_now: Arc<Notify>,
    event_tx: mpsc::Sender<RuntimeEvent>,
    tasks: Vec<JoinHandle<()>>,
    /// Receive events from the tasks; events are dropped when this is full
    pub events: mpsc::Receiver<RuntimeEvent>,
}

impl Background {
    /// Spawn the regeneration and sweeper tasks
    pub fn start(workspace: Arc<SharedWorkspace>, settings: BackgroundSettings) -> Self {
        let (shutdown, _) = watch::channel(false);
        let (event_tx, events) = mpsc::channel(64);

        let mut background = Self {
            workspace,
            settings,
            shutdown,
            sync_now: Arc::new(Notify::new()),
            event_tx,
            tasks: Vec::new(),
            events,
        };

        background.tasks.push(tokio::spawn(regeneration_loop(
            Arc::clone(&background.workspace),
            background.settings.tick,
            background.event_tx.clone(),
            background.shutdown.subscribe(),
        )));
        background.tasks.push(tokio::spawn(sweep_loop(
            Arc::clone(&background.workspace),
            background.settings.clone(),
            background.event_tx.clone(),
            background.shutdown.subscribe(),
        )));
        background
    }

    /// Add the periodic sync task
    pub fn spawn_sync<R>(&mut self, engine: Arc<SyncEngine<R>>)
    where
        R: RemoteAuthority + 'static,
    {
        self.tasks.push(tokio::spawn(sync_loop(
            Arc::clone(&self.workspace),
            engine,
            self.settings.clone(),
            self.event_tx.clone(),
            self.shutdown.subscribe(),
            Arc::clone(&self.sync_now),
        )));
    }

    /// Run a sync round without waiting for the timer
    pub fn sync_now(&self) {
        self.sync_now.notify_one();
    }

    /// Signal every task and wait for them to finish
    ///
    /// A pass already running completes first.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        debug!("Background runtime stopped");
    }
}

/// Delay before the next retry after a transient failure
pub fn next_backoff(current: Option<Duration>, initial: Duration, max: Duration) -> Duration {
    match current {
        None => initial.min(max),
        Some(delay) => (delay * 2).min(max),
    }
}

fn emit(events: &mpsc::Sender<RuntimeEvent>, event: RuntimeEvent) {
    if events.try_send(event).is_err() {
        debug!("Runtime event dropped; receiver full or gone");
    }
}

async fn regeneration_loop(
    workspace: Arc<SharedWorkspace>,
    tick: Duration,
    events: mpsc::Sender<RuntimeEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let result = workspace.lock().await.run_due_regeneration(Instant::now());
                match result {
                    Ok(Some(report)) => emit(&events, RuntimeEvent::Regenerated { report }),
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "Debounced regeneration failed"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn sync_loop<R: RemoteAuthority>(
    workspace: Arc<SharedWorkspace>,
    engine: Arc<SyncEngine<R>>,
    settings: BackgroundSettings,
    events: mpsc::Sender<RuntimeEvent>,
    mut shutdown: watch::Receiver<bool>,
    sync_now: Arc<Notify>,
) {
    let mut backoff: Option<Duration> = None;
    let mut delay = settings.sync_interval;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = sync_now.notified() => {}
            _ = shutdown.changed() => break,
        }

        match engine.sync_once(&workspace).await {
            Ok(round) if round.push.is_clean() => {
                backoff = None;
                delay = settings.sync_interval;
                emit(&events, RuntimeEvent::Synced { round });
            }
            Ok(round) => {
                // Some ops hit transient failures and are still queued
                let retry = next_backoff(backoff, settings.initial_backoff, settings.max_backoff);
                backoff = Some(retry);
                delay = retry;
                debug!(retry_in_secs = retry.as_secs(), "Ops left queued; retrying sooner");
                emit(&events, RuntimeEvent::Synced { round });
            }
            Err(e) if e.is_transient() => {
                let retry = next_backoff(backoff, settings.initial_backoff, settings.max_backoff);
                backoff = Some(retry);
                delay = retry;
                warn!(error = %e, retry_in_secs = retry.as_secs(), "Sync failed; backing off");
                emit(
                    &events,
                    RuntimeEvent::SyncFailed {
                        error: e.to_string(),
                        retry_in_secs: retry.as_secs(),
                    },
                );
            }
            Err(e) => {
                backoff = None;
                delay = settings.sync_interval;
                warn!(error = %e, "Sync failed");
                emit(
                    &events,
                    RuntimeEvent::SyncFailed {
                        error: e.to_string(),
                        retry_in_secs: delay.as_secs(),
                    },
                );
            }
        }
    }
}

async fn sweep_loop(
    workspace: Arc<SharedWorkspace>,
    settings: BackgroundSettings,
    events: mpsc::Sender<RuntimeEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(settings.sweep_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let result = workspace.lock().await.sweep(&settings.sweeper);
                match result {
                    Ok(report) if !report.is_empty() => {
                        info!(purged = report.purged, "Background sweep");
                        emit(&events, RuntimeEvent::Swept { report });
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Sweep failed"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
