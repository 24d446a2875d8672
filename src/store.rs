use crate::error::StoreError;
use crate::status::StatusSnapshot;
use serde::Serialize;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{error, info, warn};

/// Single-generation snapshot file, overwritten wholesale on every save.
#[derive(Debug, Clone)]
pub struct StatusStore {
    path: PathBuf,
}

impl StatusStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the last saved snapshot. A missing or malformed file yields an
    /// empty snapshot.
    pub fn load(&self) -> StatusSnapshot {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(path = %self.path.display(), "Status file not found. Starting with an empty state.");
                return StatusSnapshot::new();
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Failed to read status file. Starting with an empty state.");
                return StatusSnapshot::new();
            }
        };

        match serde_json::from_slice(&raw) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to decode status file. Starting with an empty state.");
                StatusSnapshot::new()
            }
        }
    }

    /// Writes the snapshot to a temporary file next to the target and renames
    /// it into place, so a crash mid-write leaves the previous generation
    /// intact. A failed save leaves no temporary file behind.
    pub fn save(&self, snapshot: &StatusSnapshot) -> Result<(), StoreError> {
        let dir = match self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                dir
            }
            None => Path::new("."),
        };

        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        snapshot.serialize(&mut ser)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&buf)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;

        info!(
            path = %self.path.display(),
            equipments = snapshot.len(),
            "Successfully saved current statuses"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{EquipmentStatus, ObservedAt};
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    fn sample() -> StatusSnapshot {
        let tm = NaiveDate::from_ymd_opt(2025, 6, 1)
            .unwrap()
            .and_hms_milli_opt(7, 45, 12, 500)
            .unwrap();
        [
            EquipmentStatus::new("EQP-001", Some(1), tm),
            EquipmentStatus::new("EQP-002", Some(0), tm),
            EquipmentStatus::new("EQP-003", None, ObservedAt::Text("unknown".into())),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatusStore::new(dir.path().join("equipment_status.json"));

        let snapshot = sample();
        store.save(&snapshot).unwrap();
        assert_eq!(store.load(), snapshot);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatusStore::new(dir.path().join("absent.json"));
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_corrupt_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("equipment_status.json");
        std::fs::write(&path, b"{\"EQP-001\": {\"pm_mode\": 1, ").unwrap();

        let store = StatusStore::new(&path);
        assert!(store.load().is_empty());

        std::fs::write(&path, b"[1, 2, 3]").unwrap();
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_save_creates_directory_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("data").join("status.json");
        let store = StatusStore::new(&path);

        store.save(&sample()).unwrap();
        let smaller: StatusSnapshot = sample().iter().take(1).cloned().collect();
        store.save(&smaller).unwrap();

        assert_eq!(store.load(), smaller);
        assert_eq!(std::fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\n    \"EQP-001\": {"));
    }

    #[test]
    fn test_failed_save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("equipment_status.json");
        // a non-empty directory at the target path makes the final rename fail
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("keep"), b"x").unwrap();

        let store = StatusStore::new(&path);
        assert!(matches!(store.save(&sample()), Err(StoreError::Io(_))));

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["equipment_status.json".to_string()]);
    }

    #[test]
    fn test_save_failure_keeps_previous_generation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("equipment_status.json");
        let store = StatusStore::new(&path);
        store.save(&sample()).unwrap();

        let unwritable = StatusStore::new(path.join("child.json"));
        assert!(unwritable.save(&sample()).is_err());
        assert_eq!(store.load(), sample());
    }

    #[test]
    fn test_malformed_file_is_reported_as_warning() {
        use crate::logging::DbLogLayer;
        use tracing_subscriber::layer::SubscriberExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("equipment_status.json");
        std::fs::write(&path, b"not json").unwrap();
        let store = StatusStore::new(&path);

        let (layer, mut rx) = DbLogLayer::new(8);
        let loaded = tracing::subscriber::with_default(
            tracing_subscriber::registry().with(layer),
            || store.load(),
        );

        assert!(loaded.is_empty());
        let record = rx.try_recv().unwrap();
        assert_eq!(record.level, "WARNING");
        assert!(record
            .message
            .starts_with("Failed to decode status file. Starting with an empty state."));
    }
}
