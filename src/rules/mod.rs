pub mod eval;
pub mod types;


use crate::session::DeviceSession;
use crate::sink::DiagnosticEvent;
use crate::telemetry::Channel;
use chrono::{DateTime, Utc};
use eval::{EvalContext, Evaluate, Verdict};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;
use types::{DiagnosticRule, Severity};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct OpenEvent {
    pub event_id: Uuid,
    pub opened_at: DateTime<Utc>,
    pub trigger: JsonValue,
}

#[derive(Debug, Clone, PartialEq)]
enum RuleState {
    Clear,
    /// Condition holds but has not yet held for the debounce window.
    Pending { since: DateTime<Utc> },
    Active { event: OpenEvent },
    /// Condition cleared; the event stays open until the hysteresis window elapses.
    Clearing { event: OpenEvent, since: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Opened,
    Clearing,
    Reasserted,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleOutcome {
    pub device_id: String,
    pub tenant_id: String,
    pub rule_id: String,
    pub severity: Severity,
    pub kind: OutcomeKind,
    pub event: OpenEvent,
    pub at: DateTime<Utc>,
}

/// Per-device rule state, owned by the same shard as the device session.
#[derive(Debug, Default)]
pub struct DeviceRuleState {
    states: HashMap<usize, RuleState>,
}

/// Rule state rebuilt from events still open in the durable log.
#[derive(Debug, Default)]
pub struct RestoredRules {
    pub state: DeviceRuleState,
    /// Open events that no longer map onto a rule slot: the rule left the
    /// policy, or an older duplicate of an event already adopted.
    pub orphaned: Vec<DiagnosticEvent>,
}

impl DeviceRuleState {
    pub fn active_count(&self) -> usize {
        self.states
            .values()
            .filter(|state| matches!(state, RuleState::Active { .. } | RuleState::Clearing { .. }))
            .count()
    }
}

impl RuleState {
    fn step(
        &mut self,
        rule: &DiagnosticRule,
        holds: bool,
        now: DateTime<Utc>,
        trigger: impl FnOnce() -> JsonValue,
    ) -> Option<(OutcomeKind, OpenEvent)> {
        let open = |trigger: JsonValue| {
            let event = OpenEvent {
                event_id: Uuid::new_v4(),
                opened_at: now,
                trigger,
            };
            (
                RuleState::Active {
                    event: event.clone(),
                },
                Some((OutcomeKind::Opened, event)),
            )
        };

        let (next, outcome) = match (std::mem::replace(self, RuleState::Clear), holds) {
            (RuleState::Clear, false) => (RuleState::Clear, None),
            (RuleState::Clear, true) if rule.debounce <= chrono::Duration::zero() => open(trigger()),
            (RuleState::Clear, true) => (RuleState::Pending { since: now }, None),
            (RuleState::Pending { since }, true) if now - since >= rule.debounce => open(trigger()),
            (state @ RuleState::Pending { .. }, true) => (state, None),
            (RuleState::Pending { .. }, false) => (RuleState::Clear, None),
            (state @ RuleState::Active { .. }, true) => (state, None),
            (RuleState::Active { event }, false) if rule.hysteresis <= chrono::Duration::zero() => {
                (RuleState::Clear, Some((OutcomeKind::Closed, event)))
            }
            (RuleState::Active { event }, false) => (
                RuleState::Clearing {
                    event: event.clone(),
                    since: now,
                },
                Some((OutcomeKind::Clearing, event)),
            ),
            (RuleState::Clearing { event, .. }, true) => (
                RuleState::Active {
                    event: event.clone(),
                },
                Some((OutcomeKind::Reasserted, event)),
            ),
            (RuleState::Clearing { event, since }, false) if now - since >= rule.hysteresis => {
                (RuleState::Clear, Some((OutcomeKind::Closed, event)))
            }
            (state @ RuleState::Clearing { .. }, false) => (state, None),
        };
        *self = next;
        outcome
    }

    fn is_waiting(&self) -> bool {
        matches!(self, RuleState::Pending { .. } | RuleState::Clearing { .. })
    }
}

/// Evaluates the immutable rule set against device sessions.
#[derive(Debug, Clone)]
pub struct RuleEngine {
    rules: Arc<Vec<DiagnosticRule>>,
    by_channel: HashMap<Channel, Vec<usize>>,
}

impl RuleEngine {
    pub fn new(rules: Arc<Vec<DiagnosticRule>>) -> Self {
        let mut by_channel: HashMap<Channel, Vec<usize>> = HashMap::new();
        for (idx, rule) in rules.iter().enumerate() {
            if rule.is_sweep_driven() {
                continue;
            }
            for channel in &rule.channels {
                by_channel.entry(*channel).or_default().push(idx);
            }
        }
        Self { rules, by_channel }
    }

    /// Runs every sample-driven rule bound to `channel` after the session took the new sample.
    pub fn evaluate(
        &self,
        session: &DeviceSession,
        channel: Channel,
        state: &mut DeviceRuleState,
        now: DateTime<Utc>,
    ) -> Vec<RuleOutcome> {
        let Some(indexes) = self.by_channel.get(&channel) else {
            return Vec::new();
        };
        let ctx = EvalContext { session, now };
        let mut outcomes = Vec::new();
        for &idx in indexes {
            let rule = &self.rules[idx];
            let verdict = rule.condition.evaluate(&ctx);
            let rule_state = state.states.entry(idx).or_insert(RuleState::Clear);
            if let Some(outcome) = apply(rule, rule_state, &ctx, verdict, Some(channel)) {
                outcomes.push(outcome);
            }
        }
        outcomes
    }

    /// Adopts open events from the log so a restarted shard continues them
    /// instead of opening duplicates. The oldest open event per rule wins.
    pub fn restore(&self, open_events: Vec<DiagnosticEvent>) -> RestoredRules {
        let by_id: HashMap<&str, usize> = self
            .rules
            .iter()
            .enumerate()
            .map(|(idx, rule)| (rule.id.as_str(), idx))
            .collect();

        let mut events = open_events;
        events.sort_by_key(|event| event.opened_at);

        let mut restored = RestoredRules::default();
        for event in events {
            let slot = by_id
                .get(event.rule_id.as_str())
                .copied()
                .filter(|idx| !restored.state.states.contains_key(idx));
            let Some(idx) = slot else {
                restored.orphaned.push(event);
                continue;
            };
            restored.state.states.insert(
                idx,
                RuleState::Active {
                    event: OpenEvent {
                        event_id: event.event_id,
                        opened_at: event.opened_at,
                        trigger: event.trigger.unwrap_or(JsonValue::Null),
                    },
                },
            );
        }
        restored
    }

    /// Closes every open event of a device that is going away.
    pub fn close_all(
        &self,
        session: &DeviceSession,
        state: &mut DeviceRuleState,
        now: DateTime<Utc>,
    ) -> Vec<RuleOutcome> {
        let mut open: Vec<(usize, OpenEvent)> = state
            .states
            .drain()
            .filter_map(|(idx, rule_state)| match rule_state {
                RuleState::Active { event } | RuleState::Clearing { event, .. } => Some((idx, event)),
                RuleState::Clear | RuleState::Pending { .. } => None,
            })
            .collect();
        open.sort_by_key(|(_, event)| event.opened_at);

        open.into_iter()
            .filter_map(|(idx, event)| {
                let rule = self.rules.get(idx)?;
                Some(RuleOutcome {
                    device_id: session.device_id().to_string(),
                    tenant_id: session.tenant_id().to_string(),
                    rule_id: rule.id.clone(),
                    severity: rule.severity,
                    kind: OutcomeKind::Closed,
                    event,
                    at: now,
                })
            })
            .collect()
    }

    /// Periodic pass: evaluates missing-data rules and lets pending debounce
    /// and clearing windows elapse for devices that stopped reporting.
    pub fn sweep(
        &self,
        session: &DeviceSession,
        state: &mut DeviceRuleState,
        now: DateTime<Utc>,
    ) -> Vec<RuleOutcome> {
        let ctx = EvalContext { session, now };
        let mut outcomes = Vec::new();
        for (idx, rule) in self.rules.iter().enumerate() {
            let rule_state = state.states.entry(idx).or_insert(RuleState::Clear);
            if !rule.is_sweep_driven() && !rule_state.is_waiting() {
                continue;
            }
            let verdict = rule.condition.evaluate(&ctx);
            let channel = rule.channels.iter().next().copied();
            if let Some(outcome) = apply(rule, rule_state, &ctx, verdict, channel) {
                outcomes.push(outcome);
            }
        }
        outcomes
    }
}

fn apply(
    rule: &DiagnosticRule,
    rule_state: &mut RuleState,
    ctx: &EvalContext<'_>,
    verdict: Verdict,
    channel: Option<Channel>,
) -> Option<RuleOutcome> {
    let (kind, event) = rule_state.step(rule, verdict.holds, ctx.now, || {
        trigger_payload(rule, ctx.session, channel, verdict)
    })?;
    tracing::debug!(
        device = %ctx.session.device_id(),
        rule = %rule.id,
        ?kind,
        observed = ?verdict.observed,
        "rule transition"
    );
    Some(RuleOutcome {
        device_id: ctx.session.device_id().to_string(),
        tenant_id: ctx.session.tenant_id().to_string(),
        rule_id: rule.id.clone(),
        severity: rule.severity,
        kind,
        event,
        at: ctx.now,
    })
}

fn trigger_payload(
    rule: &DiagnosticRule,
    session: &DeviceSession,
    channel: Option<Channel>,
    verdict: Verdict,
) -> JsonValue {
    let sample = channel.and_then(|channel| session.last_sample(channel));
    json!({
        "channel": channel.map(Channel::as_str),
        "observed": verdict.observed,
        "sample_observed_at": sample.map(|s| s.observed_at),
        "sample_received_at": sample.map(|s| s.received_at),
        "title": rule.title,
        "detail": rule.detail,
        "recommendation": rule.recommendation,
    })
}
