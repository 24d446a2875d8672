use crate::status::{ObservedAt, StatusSnapshot};

/// Mode recorded for an equipment in the previous snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorMode {
    /// Never seen before. Distinct from every real mode, including `None`.
    Unknown,
    Known(Option<i64>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub equipment_id: String,
    pub previous_mode: PriorMode,
    pub current_mode: Option<i64>,
    pub observed_at: ObservedAt,
}

/// One event per equipment in `current` whose mode differs from `previous`,
/// in `current`'s order. Equipment missing from `current` is never reported,
/// while equipment missing from `previous` always is.
pub fn detect_changes(previous: &StatusSnapshot, current: &StatusSnapshot) -> Vec<ChangeEvent> {
    current
        .iter()
        .filter_map(|status| {
            let prior = previous
                .get(&status.equipment_id)
                .map_or(PriorMode::Unknown, |p| PriorMode::Known(p.mode));
            (prior != PriorMode::Known(status.mode)).then(|| ChangeEvent {
                equipment_id: status.equipment_id.clone(),
                previous_mode: prior,
                current_mode: status.mode,
                observed_at: status.observed_at.clone(),
            })
        })
        .collect()
}
