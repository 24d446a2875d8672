pub mod config;
pub mod db;
pub mod detect;
pub mod error;
pub mod logging;
pub mod notify;
pub mod poll;
pub mod source;
pub mod status;
pub mod store;

pub use config::Config;
pub use detect::{detect_changes, ChangeEvent, PriorMode};
pub use error::{AppError, Result};
pub use notify::{format_mode, Notifier};
pub use poll::{run_cycle, CycleOutcome, Mailer, PollState, Timing};
pub use source::{Connector, StatusSource};
pub use status::{EquipmentStatus, ObservedAt, StatusSnapshot};
pub use store::StatusStore;
