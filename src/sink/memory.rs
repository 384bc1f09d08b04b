use super::{
    fold_events, ConnectivityRecord, DedupKey, DiagnosticEvent, EventTransition, TransitionState,
};
use crate::error::PersistenceError;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct MemoryLog {
    rows: Vec<EventTransition>,
    keys: HashSet<DedupKey>,
    failures_remaining: usize,
}

/// In-process event log with the same append/dedup semantics as the Postgres table.
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    inner: Mutex<MemoryLog>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryLog>, PersistenceError> {
        self.inner
            .lock()
            .map_err(|_| PersistenceError::Unavailable("memory log lock poisoned".to_string()))
    }

    pub fn append(&self, batch: &[EventTransition]) -> Result<u64, PersistenceError> {
        let mut log = self.lock()?;
        if log.failures_remaining > 0 {
            log.failures_remaining -= 1;
            return Err(PersistenceError::Unavailable(
                "injected write failure".to_string(),
            ));
        }
        let mut inserted = 0;
        for transition in batch {
            if log.keys.insert(transition.dedup_key()) {
                log.rows.push(transition.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    pub fn active_events(&self, device_id: &str) -> Result<Vec<DiagnosticEvent>, PersistenceError> {
        let log = self.lock()?;
        let mut events: Vec<DiagnosticEvent> =
            fold_events(log.rows.iter().filter(|row| row.device_id == device_id))
                .into_iter()
                .filter(|event| event.closed_at.is_none())
                .collect();
        events.sort_by_key(|event| event.opened_at);
        Ok(events)
    }

    pub fn history(
        &self,
        device_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DiagnosticEvent>, PersistenceError> {
        let log = self.lock()?;
        let mut events: Vec<DiagnosticEvent> =
            fold_events(log.rows.iter().filter(|row| row.device_id == device_id))
                .into_iter()
                .filter(|event| event.opened_at >= from && event.opened_at < to)
                .collect();
        events.sort_by_key(|event| event.opened_at);
        Ok(events)
    }

    pub fn latest_connectivity(
        &self,
        device_id: &str,
    ) -> Result<Option<ConnectivityRecord>, PersistenceError> {
        let log = self.lock()?;
        let latest = log
            .rows
            .iter()
            .filter(|row| row.device_id == device_id)
            .filter_map(|row| match row.state {
                TransitionState::Connectivity(state) => Some((row.at, state)),
                _ => None,
            })
            .max_by_key(|(at, _)| *at);
        Ok(latest.map(|(at, connectivity)| ConnectivityRecord {
            device_id: device_id.to_string(),
            connectivity,
            at,
        }))
    }

    pub fn rows(&self) -> Vec<EventTransition> {
        self.inner
            .lock()
            .map(|log| log.rows.clone())
            .unwrap_or_default()
    }

    pub fn fail_next_appends(&self, count: usize) {
        if let Ok(mut log) = self.inner.lock() {
            log.failures_remaining = count;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::types::Severity;
    use crate::session::Connectivity;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use uuid::Uuid;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap() + ChronoDuration::seconds(secs)
    }

    fn rule_row(event_id: Uuid, state: TransitionState, opened: i64, when: i64) -> EventTransition {
        EventTransition {
            event_id: Some(event_id),
            device_id: "RO-2025-0001".to_string(),
            tenant_id: "T1".to_string(),
            rule_id: "pressure_in_low".to_string(),
            state,
            severity: Some(Severity::Fault),
            opened_at: at(opened),
            closed_at: (state == TransitionState::Closed).then(|| at(when)),
            at: at(when),
            trigger: None,
        }
    }

    fn connectivity_row(state: Connectivity, when: i64) -> EventTransition {
        EventTransition {
            event_id: None,
            device_id: "RO-2025-0001".to_string(),
            tenant_id: "T1".to_string(),
            rule_id: "connectivity".to_string(),
            state: TransitionState::Connectivity(state),
            severity: None,
            opened_at: at(when),
            closed_at: None,
            at: at(when),
            trigger: None,
        }
    }

    #[test]
    fn duplicate_transitions_are_no_ops() {
        let log = MemoryEventLog::new();
        let id = Uuid::new_v4();
        let open = rule_row(id, TransitionState::Open, 0, 0);
        assert_eq!(log.append(&[open.clone()]).unwrap(), 1);
        assert_eq!(log.append(&[open.clone(), open]).unwrap(), 0);
        assert_eq!(log.rows().len(), 1);
    }

    #[test]
    fn closing_row_supersedes_the_open_row() {
        let log = MemoryEventLog::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        log.append(&[
            rule_row(first, TransitionState::Open, 0, 0),
            rule_row(first, TransitionState::Closed, 0, 90),
            rule_row(second, TransitionState::Open, 200, 200),
        ])
        .unwrap();

        let active = log.active_events("RO-2025-0001").unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].event_id, second);

        let history = log.history("RO-2025-0001", at(0), at(200)).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].closed_at, Some(at(90)));

        assert!(log.active_events("RO-2025-0002").unwrap().is_empty());
    }

    #[test]
    fn latest_connectivity_wins() {
        let log = MemoryEventLog::new();
        log.append(&[
            connectivity_row(Connectivity::Online, 0),
            connectivity_row(Connectivity::Stale, 150),
            connectivity_row(Connectivity::Offline, 150),
        ])
        .unwrap();
        let latest = log.latest_connectivity("RO-2025-0001").unwrap().expect("record");
        assert_eq!(latest.at, at(150));
        assert_eq!(latest.connectivity, Connectivity::Offline);
        assert!(log.latest_connectivity("RO-2025-0002").unwrap().is_none());
    }

    #[test]
    fn injected_failures_reject_whole_batches() {
        let log = MemoryEventLog::new();
        log.fail_next_appends(1);
        let row = connectivity_row(Connectivity::Online, 0);
        assert!(log.append(&[row.clone()]).is_err());
        assert_eq!(log.append(&[row]).unwrap(), 1);
    }
}
