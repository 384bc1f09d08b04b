#[cfg(test)]
mod memory;
mod postgres;
mod writer;

#[cfg(test)]
pub use memory::MemoryEventLog;
pub use postgres::PgEventLog;
pub use writer::{spawn_writer, EventSink, SinkSettings};

use crate::error::PersistenceError;
use crate::rules::types::{Severity, CONNECTIVITY_RULE_ID};
use crate::rules::{OutcomeKind, RuleOutcome};
use crate::session::{Connectivity, ConnectivityTransition};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Tracing target for transitions dropped after exhausting write retries.
pub const PERSISTENCE_ERROR_TARGET: &str = "ro_diagnostics_sidecar::persistence_errors";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransitionState {
    Open,
    Closed,
    Connectivity(Connectivity),
}

impl TransitionState {
    pub fn as_str(self) -> &'static str {
        match self {
            TransitionState::Open => "OPEN",
            TransitionState::Closed => "CLOSED",
            TransitionState::Connectivity(state) => state.as_str(),
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "OPEN" => Some(TransitionState::Open),
            "CLOSED" => Some(TransitionState::Closed),
            other => Connectivity::parse(other).map(TransitionState::Connectivity),
        }
    }
}

/// One append-only row of the event log.
#[derive(Debug, Clone, PartialEq)]
pub struct EventTransition {
    pub event_id: Option<Uuid>,
    pub device_id: String,
    pub tenant_id: String,
    pub rule_id: String,
    pub state: TransitionState,
    pub severity: Option<Severity>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub at: DateTime<Utc>,
    pub trigger: Option<JsonValue>,
}

/// Rows with the same key are the same transition replayed.
pub type DedupKey = (String, String, &'static str, DateTime<Utc>);

impl EventTransition {
    /// `None` for outcomes that only change in-memory state (clearing, reasserted).
    pub fn from_outcome(outcome: &RuleOutcome) -> Option<Self> {
        let (state, closed_at) = match outcome.kind {
            OutcomeKind::Opened => (TransitionState::Open, None),
            OutcomeKind::Closed => (TransitionState::Closed, Some(outcome.at)),
            OutcomeKind::Clearing | OutcomeKind::Reasserted => return None,
        };
        Some(Self {
            event_id: Some(outcome.event.event_id),
            device_id: outcome.device_id.clone(),
            tenant_id: outcome.tenant_id.clone(),
            rule_id: outcome.rule_id.clone(),
            state,
            severity: Some(outcome.severity),
            opened_at: outcome.event.opened_at,
            closed_at,
            at: outcome.at,
            trigger: Some(outcome.event.trigger.clone()),
        })
    }

    pub fn from_connectivity(transition: &ConnectivityTransition) -> Self {
        Self {
            event_id: None,
            device_id: transition.device_id.clone(),
            tenant_id: transition.tenant_id.clone(),
            rule_id: CONNECTIVITY_RULE_ID.to_string(),
            state: TransitionState::Connectivity(transition.to),
            severity: None,
            opened_at: transition.at,
            closed_at: None,
            at: transition.at,
            trigger: Some(serde_json::json!({
                "from": transition.from.map(Connectivity::as_str),
            })),
        }
    }

    /// Close row for an event known only from the log.
    pub fn closing(event: &DiagnosticEvent, at: DateTime<Utc>) -> Self {
        Self {
            event_id: Some(event.event_id),
            device_id: event.device_id.clone(),
            tenant_id: event.tenant_id.clone(),
            rule_id: event.rule_id.clone(),
            state: TransitionState::Closed,
            severity: event.severity,
            opened_at: event.opened_at,
            closed_at: Some(at),
            at,
            trigger: event.trigger.clone(),
        }
    }

    pub fn dedup_key(&self) -> DedupKey {
        (
            self.device_id.clone(),
            self.rule_id.clone(),
            self.state.as_str(),
            self.at,
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticEvent {
    pub event_id: Uuid,
    pub device_id: String,
    pub tenant_id: String,
    pub rule_id: String,
    pub severity: Option<Severity>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub trigger: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectivityRecord {
    pub device_id: String,
    pub connectivity: Connectivity,
    pub at: DateTime<Utc>,
}

/// Durable side of the event sink. Writes only ever append.
#[derive(Debug, Clone)]
pub enum EventStore {
    Postgres(PgEventLog),
    #[cfg(test)]
    Memory(std::sync::Arc<MemoryEventLog>),
}

impl EventStore {
    pub async fn ensure_schema(&self) -> Result<(), PersistenceError> {
        match self {
            EventStore::Postgres(log) => log.ensure_schema().await,
            #[cfg(test)]
            EventStore::Memory(_) => Ok(()),
        }
    }

    /// Returns how many rows were new; replays are skipped silently.
    pub async fn append(&self, batch: &[EventTransition]) -> Result<u64, PersistenceError> {
        match self {
            EventStore::Postgres(log) => log.append(batch).await,
            #[cfg(test)]
            EventStore::Memory(log) => log.append(batch),
        }
    }

    pub async fn active_events(
        &self,
        device_id: &str,
    ) -> Result<Vec<DiagnosticEvent>, PersistenceError> {
        match self {
            EventStore::Postgres(log) => log.active_events(device_id).await,
            #[cfg(test)]
            EventStore::Memory(log) => log.active_events(device_id),
        }
    }

    /// Events opened in `[from, to)`, oldest first.
    pub async fn history(
        &self,
        device_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DiagnosticEvent>, PersistenceError> {
        match self {
            EventStore::Postgres(log) => log.history(device_id, from, to).await,
            #[cfg(test)]
            EventStore::Memory(log) => log.history(device_id, from, to),
        }
    }

    pub async fn latest_connectivity(
        &self,
        device_id: &str,
    ) -> Result<Option<ConnectivityRecord>, PersistenceError> {
        match self {
            EventStore::Postgres(log) => log.latest_connectivity(device_id).await,
            #[cfg(test)]
            EventStore::Memory(log) => log.latest_connectivity(device_id),
        }
    }
}

/// Rebuilds events from OPEN/CLOSED rows given in append order.
#[cfg(test)]
fn fold_events<'a>(rows: impl Iterator<Item = &'a EventTransition>) -> Vec<DiagnosticEvent> {
    let mut events: Vec<DiagnosticEvent> = Vec::new();
    let mut index: std::collections::HashMap<Uuid, usize> = std::collections::HashMap::new();
    for row in rows {
        let Some(event_id) = row.event_id else {
            continue;
        };
        match row.state {
            TransitionState::Open => {
                if index.contains_key(&event_id) {
                    continue;
                }
                index.insert(event_id, events.len());
                events.push(DiagnosticEvent {
                    event_id,
                    device_id: row.device_id.clone(),
                    tenant_id: row.tenant_id.clone(),
                    rule_id: row.rule_id.clone(),
                    severity: row.severity,
                    opened_at: row.opened_at,
                    closed_at: None,
                    trigger: row.trigger.clone(),
                });
            }
            TransitionState::Closed => {
                if let Some(&idx) = index.get(&event_id) {
                    events[idx].closed_at = row.closed_at.or(Some(row.at));
                }
            }
            TransitionState::Connectivity(_) => {}
        }
    }
    events
}
