use crate::config::MailerConfig;
use crate::detect::detect_changes;
use crate::notify::{format_mode, format_prior, Notifier};
use crate::source::{Connector, StatusSource};
use crate::store::StatusStore;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Disconnected,
    Connecting,
    Syncing,
    Polling,
    Sleeping,
    CoolingDown,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Start,
    Connected,
    ConnectFailed,
    Synced,
    CycleFinished,
    ConnectionLost,
    CycleFailed,
    Woke,
    StopRequested,
}

impl PollState {
    pub fn on(self, t: Transition) -> PollState {
        use PollState::*;
        use Transition::*;

        match (self, t) {
            (_, StopRequested) => Stopped,
            (Stopped, _) => Stopped,
            (Disconnected, Start) => Connecting,
            (Connecting, Connected) => Syncing,
            (Connecting, ConnectFailed) => Connecting,
            (Syncing | Polling | Sleeping | CoolingDown, ConnectionLost) => Connecting,
            (Syncing, Synced) => Polling,
            (Polling, CycleFinished) => Sleeping,
            (Polling, CycleFailed) => CoolingDown,
            (Sleeping | CoolingDown, Woke) => Polling,
            (state, _) => state,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub poll_interval: Duration,
    pub reconnect_backoff: Duration,
    pub error_cooldown: Duration,
}

impl From<&MailerConfig> for Timing {
    fn from(cfg: &MailerConfig) -> Self {
        Self {
            poll_interval: cfg.poll_interval(),
            reconnect_backoff: cfg.reconnect_backoff(),
            error_cooldown: cfg.error_cooldown(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    QueryFailed,
    NoStatuses,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed {
        changes: usize,
        notify_failures: usize,
        persisted: bool,
    },
    Skipped(SkipReason),
    ConnectionLost,
}

/// One poll cycle: load previous, fetch current, diff, notify, persist.
/// Notifications always go out before the snapshot is saved.
pub async fn run_cycle<S>(
    source: &S,
    store: &StatusStore,
    notifier: &dyn Notifier,
) -> CycleOutcome
where
    S: StatusSource + ?Sized,
{
    info!("Checking for pm_mode changes...");

    let previous = store.load();
    let current = match source.fetch_latest_statuses().await {
        Ok(current) => current,
        Err(e) if e.is_connection() => {
            warn!(error = %e, "Database connection lost while fetching statuses");
            return CycleOutcome::ConnectionLost;
        }
        Err(e) => {
            error!(error = %e, "Failed to fetch latest statuses");
            return CycleOutcome::Skipped(SkipReason::QueryFailed);
        }
    };

    if current.is_empty() {
        warn!("Could not fetch current statuses. Skipping this cycle.");
        return CycleOutcome::Skipped(SkipReason::NoStatuses);
    }

    let events = detect_changes(&previous, &current);
    let mut notify_failures = 0;
    for event in &events {
        warn!(
            eqp_id = %event.equipment_id,
            "Change detected for {}: from '{}' to '{}'",
            event.equipment_id,
            format_prior(event.previous_mode),
            format_mode(event.current_mode)
        );
        if let Err(e) = notifier.notify(event).await {
            notify_failures += 1;
            error!(eqp_id = %event.equipment_id, error = %e, "Failed to deliver notification");
        }
    }

    let persisted = match store.save(&current) {
        Ok(()) => true,
        Err(e) => {
            error!(path = %store.path().display(), error = %e, "Failed to save statuses to file");
            false
        }
    };

    CycleOutcome::Completed {
        changes: events.len(),
        notify_failures,
        persisted,
    }
}

/// Drives the poll loop state machine until a stop is requested.
pub struct Mailer<C: Connector> {
    connector: C,
    store: StatusStore,
    notifier: Box<dyn Notifier>,
    timing: Timing,
}

impl<C: Connector> Mailer<C> {
    pub fn new(
        connector: C,
        store: StatusStore,
        notifier: Box<dyn Notifier>,
        timing: Timing,
    ) -> Self {
        Self {
            connector,
            store,
            notifier,
            timing,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut source: Option<C::Source> = None;
        let mut state = PollState::Disconnected.on(Transition::Start);

        while state != PollState::Stopped {
            if *shutdown.borrow() {
                state = state.on(Transition::StopRequested);
                continue;
            }

            let transition = match state {
                PollState::Connecting => self.connect(&mut source, &mut shutdown).await,
                PollState::Syncing => self.sync(),
                PollState::Polling => self.poll(&mut source).await,
                PollState::Sleeping => {
                    info!(
                        "Check complete. Waiting for {} seconds.",
                        self.timing.poll_interval.as_secs()
                    );
                    pause(self.timing.poll_interval, &mut shutdown).await
                }
                PollState::CoolingDown => pause(self.timing.error_cooldown, &mut shutdown).await,
                PollState::Disconnected | PollState::Stopped => Transition::StopRequested,
            };

            let next = state.on(transition);
            debug!(from = ?state, via = ?transition, to = ?next, "poll state transition");
            state = next;
        }

        warn!("Process stopped by user.");
        if let Some(source) = source.take() {
            source.close().await;
        }
    }

    async fn connect(
        &self,
        source: &mut Option<C::Source>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Transition {
        match self.connector.connect().await {
            Ok(connected) => {
                *source = Some(connected);
                Transition::Connected
            }
            Err(e) => {
                error!(error = %e, "Database connection failed");
                info!(
                    "Retrying in {} seconds...",
                    self.timing.reconnect_backoff.as_secs()
                );
                match pause(self.timing.reconnect_backoff, shutdown).await {
                    Transition::StopRequested => Transition::StopRequested,
                    _ => Transition::ConnectFailed,
                }
            }
        }
    }

    fn sync(&self) -> Transition {
        let known = self.store.load();
        info!(
            status_file = %self.store.path().display(),
            known_equipments = known.len(),
            "Mailer process started."
        );
        Transition::Synced
    }

    async fn poll(&self, source: &mut Option<C::Source>) -> Transition {
        let Some(live) = source.as_ref() else {
            return Transition::ConnectionLost;
        };

        if !live.is_alive().await {
            warn!("Database connection lost. Reconnecting...");
            if let Some(dead) = source.take() {
                dead.close().await;
            }
            return Transition::ConnectionLost;
        }

        let cycle = run_cycle(live, &self.store, self.notifier.as_ref());
        let outcome = AssertUnwindSafe(cycle).catch_unwind().await;
        match outcome {
            Ok(CycleOutcome::ConnectionLost) => {
                if let Some(dead) = source.take() {
                    dead.close().await;
                }
                Transition::ConnectionLost
            }
            Ok(outcome) => {
                debug!(?outcome, "poll cycle finished");
                Transition::CycleFinished
            }
            Err(panic) => {
                error!(
                    "An unexpected error occurred: {}",
                    panic_message(panic.as_ref())
                );
                Transition::CycleFailed
            }
        }
    }
}

/// Sleeps for `period` unless a stop is requested first.
async fn pause(period: Duration, shutdown: &mut watch::Receiver<bool>) -> Transition {
    tokio::select! {
        _ = tokio::time::sleep(period) => Transition::Woke,
        _ = wait_for_stop(shutdown) => Transition::StopRequested,
    }
}

async fn wait_for_stop(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            // sender gone: nobody can ask us to stop any more
            futures::future::pending::<()>().await;
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
