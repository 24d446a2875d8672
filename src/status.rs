use chrono::NaiveDateTime;
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

const STORE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";
const DISPLAY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const PARSE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// When a status was observed. Timestamps read back from the status file stay
/// comparable; anything unparseable is carried through verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservedAt {
    Timestamp(NaiveDateTime),
    Text(String),
}

impl ObservedAt {
    pub fn parse(raw: &str) -> Self {
        PARSE_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
            .map(ObservedAt::Timestamp)
            .unwrap_or_else(|| ObservedAt::Text(raw.to_string()))
    }

    /// `YYYY-MM-DD HH:MM:SS` for timestamps, the raw text otherwise.
    pub fn render(&self) -> String {
        match self {
            ObservedAt::Timestamp(ts) => ts.format(DISPLAY_FORMAT).to_string(),
            ObservedAt::Text(raw) => raw.clone(),
        }
    }
}

impl From<NaiveDateTime> for ObservedAt {
    fn from(ts: NaiveDateTime) -> Self {
        ObservedAt::Timestamp(ts)
    }
}

impl fmt::Display for ObservedAt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl Serialize for ObservedAt {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ObservedAt::Timestamp(ts) => serializer.collect_str(&ts.format(STORE_FORMAT)),
            ObservedAt::Text(raw) => serializer.serialize_str(raw),
        }
    }
}

impl<'de> Deserialize<'de> for ObservedAt {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(ObservedAt::parse(&raw))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EquipmentStatus {
    pub equipment_id: String,
    /// `None` means the PM flag was released.
    pub mode: Option<i64>,
    pub observed_at: ObservedAt,
}

impl EquipmentStatus {
    pub fn new(
        equipment_id: impl Into<String>,
        mode: Option<i64>,
        observed_at: impl Into<ObservedAt>,
    ) -> Self {
        Self {
            equipment_id: equipment_id.into(),
            mode,
            observed_at: observed_at.into(),
        }
    }
}

/// On-disk value of one equipment entry.
#[derive(Debug, Serialize, Deserialize)]
struct StoredStatus {
    pm_mode: Option<i64>,
    tm: ObservedAt,
}

/// Latest known status per equipment, in fetch order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    entries: IndexMap<String, EquipmentStatus>,
}

impl StatusSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any existing entry for the same id, keeping its position.
    pub fn insert(&mut self, status: EquipmentStatus) {
        self.entries.insert(status.equipment_id.clone(), status);
    }

    pub fn get(&self, equipment_id: &str) -> Option<&EquipmentStatus> {
        self.entries.get(equipment_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EquipmentStatus> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<EquipmentStatus> for StatusSnapshot {
    fn from_iter<T: IntoIterator<Item = EquipmentStatus>>(iter: T) -> Self {
        let mut snapshot = StatusSnapshot::new();
        for status in iter {
            snapshot.insert(status);
        }
        snapshot
    }
}

impl Serialize for StatusSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;

        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (id, status) in &self.entries {
            map.serialize_entry(
                id,
                &StoredStatus {
                    pm_mode: status.mode,
                    tm: status.observed_at.clone(),
                },
            )?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for StatusSnapshot {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let stored = IndexMap::<String, StoredStatus>::deserialize(deserializer)?;
        Ok(stored
            .into_iter()
            .map(|(id, s)| EquipmentStatus {
                equipment_id: id,
                mode: s.pm_mode,
                observed_at: s.tm,
            })
            .collect())
    }
}
