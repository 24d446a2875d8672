#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use pm_mode_mailer::error::{NotifyError, SourceError};
use pm_mode_mailer::{
    ChangeEvent, Connector, EquipmentStatus, Notifier, StatusSnapshot, StatusSource, StatusStore,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub fn tm(hour: u32, minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 5, 12)
        .unwrap()
        .and_hms_opt(hour, minute, 0)
        .unwrap()
}

pub fn snapshot(entries: &[(&str, Option<i64>, NaiveDateTime)]) -> StatusSnapshot {
    entries
        .iter()
        .map(|(id, mode, at)| EquipmentStatus::new(*id, *mode, *at))
        .collect()
}

/// What the next fetch returns.
pub enum FetchPlan {
    Statuses(StatusSnapshot),
    QueryError,
    ConnectionError,
    Panic,
}

#[derive(Default)]
struct BackendState {
    connect_failures_left: usize,
    connect_attempts: usize,
    alive: bool,
    closed: usize,
    fetches: usize,
    planned: VecDeque<FetchPlan>,
    steady: StatusSnapshot,
}

/// Shared, inspectable stand-in for the equipment database.
#[derive(Clone, Default)]
pub struct FakeBackend {
    state: Arc<Mutex<BackendState>>,
}

impl FakeBackend {
    pub fn with_statuses(steady: StatusSnapshot) -> Self {
        let backend = Self::default();
        backend.set_statuses(steady);
        backend
    }

    pub fn fail_connects(&self, n: usize) {
        self.state.lock().unwrap().connect_failures_left = n;
    }

    pub fn set_statuses(&self, steady: StatusSnapshot) {
        self.state.lock().unwrap().steady = steady;
    }

    pub fn plan(&self, plan: FetchPlan) {
        self.state.lock().unwrap().planned.push_back(plan);
    }

    pub fn kill_connection(&self) {
        self.state.lock().unwrap().alive = false;
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.lock().unwrap().connect_attempts
    }

    pub fn closed(&self) -> usize {
        self.state.lock().unwrap().closed
    }

    pub fn fetches(&self) -> usize {
        self.state.lock().unwrap().fetches
    }

    pub fn connector(&self) -> FakeConnector {
        FakeConnector {
            backend: self.clone(),
        }
    }

    pub fn source(&self) -> FakeSource {
        self.state.lock().unwrap().alive = true;
        FakeSource {
            backend: self.clone(),
        }
    }
}

pub struct FakeConnector {
    backend: FakeBackend,
}

#[async_trait]
impl Connector for FakeConnector {
    type Source = FakeSource;

    async fn connect(&self) -> Result<FakeSource, SourceError> {
        {
            let mut state = self.backend.state.lock().unwrap();
            state.connect_attempts += 1;
            if state.connect_failures_left > 0 {
                state.connect_failures_left -= 1;
                return Err(SourceError::Connection("connection refused".into()));
            }
        }
        Ok(self.backend.source())
    }
}

pub struct FakeSource {
    backend: FakeBackend,
}

#[async_trait]
impl StatusSource for FakeSource {
    async fn is_alive(&self) -> bool {
        self.backend.state.lock().unwrap().alive
    }

    async fn fetch_latest_statuses(&self) -> Result<StatusSnapshot, SourceError> {
        let plan = {
            let mut state = self.backend.state.lock().unwrap();
            state.fetches += 1;
            state
                .planned
                .pop_front()
                .unwrap_or_else(|| FetchPlan::Statuses(state.steady.clone()))
        };

        match plan {
            FetchPlan::Statuses(s) => Ok(s),
            FetchPlan::QueryError => Err(SourceError::Query("Unknown column 'pm_mode'".into())),
            FetchPlan::ConnectionError => Err(SourceError::Connection("broken pipe".into())),
            FetchPlan::Panic => panic!("simulated driver bug"),
        }
    }

    async fn close(&self) {
        let mut state = self.backend.state.lock().unwrap();
        state.alive = false;
        state.closed += 1;
    }
}

/// Records every event; fails delivery for the listed equipment.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    delivered: Arc<Mutex<Vec<ChangeEvent>>>,
    attempted: Arc<Mutex<Vec<String>>>,
    fail_for: Vec<String>,
}

impl RecordingNotifier {
    pub fn failing_for(ids: &[&str]) -> Self {
        Self {
            fail_for: ids.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn delivered(&self) -> Vec<ChangeEvent> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn attempted(&self) -> Vec<String> {
        self.attempted.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: &ChangeEvent) -> Result<(), NotifyError> {
        self.attempted
            .lock()
            .unwrap()
            .push(event.equipment_id.clone());
        if self.fail_for.contains(&event.equipment_id) {
            return Err(NotifyError::Transport("smtp unavailable".into()));
        }
        self.delivered.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Reads the persisted snapshot while each notification is delivered, to
/// observe which generation is on disk at that moment.
#[derive(Clone)]
pub struct StoreReadingNotifier {
    store: StatusStore,
    seen: Arc<Mutex<Vec<(String, Option<Option<i64>>)>>>,
}

impl StoreReadingNotifier {
    pub fn new(store: StatusStore) -> Self {
        Self {
            store,
            seen: Arc::default(),
        }
    }

    /// Per notification: equipment id and its mode in the file at that time.
    pub fn seen(&self) -> Vec<(String, Option<Option<i64>>)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for StoreReadingNotifier {
    async fn notify(&self, event: &ChangeEvent) -> Result<(), NotifyError> {
        let on_disk = self
            .store
            .load()
            .get(&event.equipment_id)
            .map(|status| status.mode);
        self.seen
            .lock()
            .unwrap()
            .push((event.equipment_id.clone(), on_disk));
        Ok(())
    }
}
