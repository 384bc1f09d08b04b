use crate::policy::ChannelSpec;
use crate::telemetry::Channel;
use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Rule id reserved for connectivity rows in the event log.
pub const CONNECTIVITY_RULE_ID: &str = "connectivity";
const MAX_DEPTH: usize = 4;
/// Longest window any policy field may name. Keeps every derived timestamp in range.
pub const MAX_POLICY_SECONDS: i64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Warning,
    Fault,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Warning => "WARNING",
            Severity::Fault => "FAULT",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "WARNING" => Some(Severity::Warning),
            "FAULT" => Some(Severity::Fault),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
    Neq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeMode {
    Inside,
    Outside,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub channel: Channel,
    pub op: CompareOp,
    pub value: f64,
    #[serde(default)]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeRule {
    pub channel: Channel,
    pub mode: RangeMode,
    pub low: f64,
    pub high: f64,
    #[serde(default)]
    pub unit: Option<String>,
}

/// Slope between the oldest and newest sample inside the window, in units per second.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateOfChangeRule {
    pub channel: Channel,
    pub window_seconds: i64,
    #[serde(skip, default = "ChronoDuration::zero")]
    pub window: ChronoDuration,
    pub op: CompareOp,
    pub per_second: f64,
    #[serde(default)]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissingDataRule {
    pub channel: Channel,
    pub missing_for_seconds: i64,
    #[serde(skip, default = "ChronoDuration::zero")]
    pub missing_for: ChronoDuration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    Threshold(ThresholdRule),
    Range(RangeRule),
    RateOfChange(RateOfChangeRule),
    MissingData(MissingDataRule),
    All { children: Vec<Condition> },
    Any { children: Vec<Condition> },
}

impl Condition {
    fn collect_channels(&self, out: &mut BTreeSet<Channel>) {
        match self {
            Condition::Threshold(rule) => {
                out.insert(rule.channel);
            }
            Condition::Range(rule) => {
                out.insert(rule.channel);
            }
            Condition::RateOfChange(rule) => {
                out.insert(rule.channel);
            }
            Condition::MissingData(rule) => {
                out.insert(rule.channel);
            }
            Condition::All { children } | Condition::Any { children } => {
                for child in children {
                    child.collect_channels(out);
                }
            }
        }
    }
}

/// Operator-facing advice attached to a rule, carried on every event it opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub code: String,
    pub title: String,
    #[serde(default)]
    pub detail: Option<String>,
}

/// Rule as written in the policy file.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleSpec {
    pub id: String,
    pub severity: Severity,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub recommendation: Option<Recommendation>,
    #[serde(default)]
    pub hysteresis_seconds: Option<i64>,
    #[serde(default)]
    pub debounce_seconds: i64,
    pub condition: Condition,
}

/// Validated rule, immutable once loaded.
#[derive(Debug, Clone)]
pub struct DiagnosticRule {
    pub id: String,
    pub severity: Severity,
    pub title: Option<String>,
    pub detail: Option<String>,
    pub recommendation: Option<Recommendation>,
    pub hysteresis: ChronoDuration,
    pub debounce: ChronoDuration,
    pub condition: Condition,
    pub channels: BTreeSet<Channel>,
}

impl DiagnosticRule {
    /// Missing-data rules fire on absence, so only the sweep can evaluate them.
    pub fn is_sweep_driven(&self) -> bool {
        matches!(self.condition, Condition::MissingData(_))
    }
}

pub fn validate_rules(
    specs: Vec<RuleSpec>,
    channels: &HashMap<Channel, ChannelSpec>,
) -> Result<Vec<DiagnosticRule>, String> {
    let mut seen = HashSet::new();
    let mut rules = Vec::with_capacity(specs.len());

    for mut spec in specs {
        let id = spec.id.trim().to_string();
        if id.is_empty() {
            return Err("rule id must not be blank".to_string());
        }
        if id == CONNECTIVITY_RULE_ID {
            return Err(format!("rule id `{CONNECTIVITY_RULE_ID}` is reserved"));
        }
        if !seen.insert(id.clone()) {
            return Err(format!("duplicate rule id `{id}`"));
        }

        let hysteresis_seconds = spec
            .hysteresis_seconds
            .ok_or_else(|| format!("rule `{id}`: hysteresis_seconds is required"))?;
        let hysteresis = policy_seconds(hysteresis_seconds, 0, "hysteresis_seconds")
            .map_err(|err| format!("rule `{id}`: {err}"))?;
        let debounce = policy_seconds(spec.debounce_seconds, 0, "debounce_seconds")
            .map_err(|err| format!("rule `{id}`: {err}"))?;

        let recommendation = match spec.recommendation {
            Some(rec) => {
                let code = rec.code.trim().to_string();
                let title = rec.title.trim().to_string();
                if code.is_empty() || title.is_empty() {
                    return Err(format!("rule `{id}`: recommendation needs a code and a title"));
                }
                Some(Recommendation {
                    code,
                    title,
                    detail: non_blank(rec.detail),
                })
            }
            None => None,
        };

        validate_condition_recursive(&mut spec.condition, 1, channels)
            .map_err(|err| format!("rule `{id}`: {err}"))?;

        let mut rule_channels = BTreeSet::new();
        spec.condition.collect_channels(&mut rule_channels);

        rules.push(DiagnosticRule {
            id,
            severity: spec.severity,
            title: non_blank(spec.title),
            detail: non_blank(spec.detail),
            recommendation,
            hysteresis,
            debounce,
            condition: spec.condition,
            channels: rule_channels,
        });
    }

    Ok(rules)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

/// Converts a policy seconds field, rejecting values below `min` or above [`MAX_POLICY_SECONDS`].
pub fn policy_seconds(value: i64, min: i64, key: &str) -> Result<ChronoDuration, String> {
    if value < min {
        return Err(format!("{key} must be >= {min}"));
    }
    if value > MAX_POLICY_SECONDS {
        return Err(format!("{key} must be <= {MAX_POLICY_SECONDS}"));
    }
    ChronoDuration::try_seconds(value).ok_or_else(|| format!("{key} is out of range"))
}

fn validate_condition_recursive(
    node: &mut Condition,
    depth: usize,
    channels: &HashMap<Channel, ChannelSpec>,
) -> Result<(), String> {
    if depth > MAX_DEPTH {
        return Err(format!("condition depth exceeds max {MAX_DEPTH}"));
    }

    match node {
        Condition::Threshold(rule) => {
            if !rule.value.is_finite() {
                return Err("threshold.value must be finite".to_string());
            }
            if rule.channel.is_boolean() {
                if !matches!(rule.op, CompareOp::Eq | CompareOp::Neq) {
                    return Err(format!("{} only supports eq/neq", rule.channel));
                }
                if rule.value != 0.0 && rule.value != 1.0 {
                    return Err(format!("{} compares against 0 or 1", rule.channel));
                }
            }
            check_unit(rule.channel, rule.unit.as_deref(), channels)?;
        }
        Condition::Range(rule) => {
            require_numeric(rule.channel, "range")?;
            if !rule.low.is_finite() || !rule.high.is_finite() {
                return Err("range bounds must be finite".to_string());
            }
            if rule.low >= rule.high {
                return Err("range.low must be < range.high".to_string());
            }
            check_unit(rule.channel, rule.unit.as_deref(), channels)?;
        }
        Condition::RateOfChange(rule) => {
            require_numeric(rule.channel, "rate_of_change")?;
            rule.window = policy_seconds(rule.window_seconds, 1, "rate_of_change.window_seconds")?;
            if !rule.per_second.is_finite() {
                return Err("rate_of_change.per_second must be finite".to_string());
            }
            check_unit(rule.channel, rule.unit.as_deref(), channels)?;
        }
        Condition::MissingData(rule) => {
            if depth > 1 {
                return Err("missing_data cannot be combined with other conditions".to_string());
            }
            rule.missing_for =
                policy_seconds(rule.missing_for_seconds, 1, "missing_data.missing_for_seconds")?;
        }
        Condition::All { children } | Condition::Any { children } => {
            if children.is_empty() {
                return Err("all/any requires at least one child".to_string());
            }
            for child in children {
                validate_condition_recursive(child, depth + 1, channels)?;
            }
        }
    }

    Ok(())
}

fn require_numeric(channel: Channel, kind: &str) -> Result<(), String> {
    if channel.is_boolean() {
        return Err(format!("{kind} is not supported on boolean channel {channel}"));
    }
    Ok(())
}

fn check_unit(
    channel: Channel,
    unit: Option<&str>,
    channels: &HashMap<Channel, ChannelSpec>,
) -> Result<(), String> {
    let Some(unit) = unit else {
        return Ok(());
    };
    if channel.is_boolean() {
        return Err(format!("{channel} is boolean and takes no unit"));
    }
    let expected = channels
        .get(&channel)
        .and_then(|spec| spec.unit.as_deref())
        .ok_or_else(|| format!("{channel} has no configured unit"))?;
    if !unit.trim().eq_ignore_ascii_case(expected) {
        return Err(format!(
            "unit `{unit}` does not match {channel} unit `{expected}`"
        ));
    }
    Ok(())
}

pub fn compare(value: f64, op: CompareOp, threshold: f64) -> bool {
    match op {
        CompareOp::Lt => value < threshold,
        CompareOp::Lte => value <= threshold,
        CompareOp::Gt => value > threshold,
        CompareOp::Gte => value >= threshold,
        CompareOp::Eq => (value - threshold).abs() <= f64::EPSILON,
        CompareOp::Neq => (value - threshold).abs() > f64::EPSILON,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channels() -> HashMap<Channel, ChannelSpec> {
        let mut map = HashMap::new();
        map.insert(
            Channel::PressureIn,
            ChannelSpec {
                unit: Some("bar".to_string()),
                min: 0.0,
                max: 25.0,
            },
        );
        map
    }

    fn parse(raw: serde_json::Value) -> Vec<RuleSpec> {
        serde_json::from_value(raw).expect("rule specs")
    }

    #[test]
    fn accepts_threshold_and_combination() {
        let specs = parse(serde_json::json!([
            {
                "id": "low_inlet",
                "severity": "FAULT",
                "hysteresis_seconds": 60,
                "condition": {"kind": "threshold", "channel": "PRESSURE_IN", "op": "lt", "value": 1.0, "unit": "bar"}
            },
            {
                "id": "dry_run",
                "severity": "WARNING",
                "hysteresis_seconds": 30,
                "debounce_seconds": 10,
                "condition": {"kind": "all", "children": [
                    {"kind": "threshold", "channel": "FLOAT_CALL", "op": "eq", "value": 1},
                    {"kind": "range", "channel": "PRESSURE_IN", "mode": "outside", "low": 1.0, "high": 6.0}
                ]}
            }
        ]));
        let rules = validate_rules(specs, &channels()).expect("valid");
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[1].debounce, ChronoDuration::seconds(10));
        assert!(rules[1].channels.contains(&Channel::FloatCall));
        assert!(rules[1].channels.contains(&Channel::PressureIn));
    }

    #[test]
    fn rejects_broken_definitions() {
        let cases = [
            serde_json::json!([{"id": "a", "severity": "FAULT",
                "condition": {"kind": "threshold", "channel": "PRESSURE_IN", "op": "lt", "value": 1.0}}]),
            serde_json::json!([{"id": "a", "severity": "FAULT", "hysteresis_seconds": 5,
                "condition": {"kind": "threshold", "channel": "PRESSURE_IN", "op": "lt", "value": 1.0, "unit": "psi"}}]),
            serde_json::json!([{"id": "connectivity", "severity": "FAULT", "hysteresis_seconds": 5,
                "condition": {"kind": "missing_data", "channel": "FLOW", "missing_for_seconds": 60}}]),
            serde_json::json!([{"id": "a", "severity": "FAULT", "hysteresis_seconds": 5,
                "condition": {"kind": "range", "channel": "PRESSURE_IN", "mode": "inside", "low": 4.0, "high": 2.0}}]),
            serde_json::json!([{"id": "a", "severity": "FAULT", "hysteresis_seconds": 5,
                "condition": {"kind": "threshold", "channel": "PRESSURE_SWITCH", "op": "gt", "value": 0}}]),
            serde_json::json!([{"id": "a", "severity": "FAULT", "hysteresis_seconds": 5,
                "condition": {"kind": "any", "children": [
                    {"kind": "missing_data", "channel": "FLOW", "missing_for_seconds": 60}
                ]}}]),
            serde_json::json!([
                {"id": "a", "severity": "FAULT", "hysteresis_seconds": 5,
                    "condition": {"kind": "missing_data", "channel": "FLOW", "missing_for_seconds": 60}},
                {"id": "a", "severity": "WARNING", "hysteresis_seconds": 5,
                    "condition": {"kind": "missing_data", "channel": "TEMP", "missing_for_seconds": 60}}
            ]),
        ];
        for case in cases {
            let specs = parse(case.clone());
            assert!(validate_rules(specs, &channels()).is_err(), "accepted {case}");
        }
    }

    #[test]
    fn oversized_windows_are_rejected_at_load() {
        let huge = i64::MAX;
        let cases = [
            serde_json::json!([{"id": "a", "severity": "WARNING", "hysteresis_seconds": 0,
                "condition": {"kind": "missing_data", "channel": "FLOW", "missing_for_seconds": huge}}]),
            serde_json::json!([{"id": "a", "severity": "WARNING", "hysteresis_seconds": 0,
                "condition": {"kind": "rate_of_change", "channel": "PRESSURE_IN", "window_seconds": huge, "op": "gt", "per_second": 1.0}}]),
            serde_json::json!([{"id": "a", "severity": "FAULT", "hysteresis_seconds": huge,
                "condition": {"kind": "threshold", "channel": "PRESSURE_IN", "op": "lt", "value": 1.0}}]),
            serde_json::json!([{"id": "a", "severity": "FAULT", "hysteresis_seconds": 5, "debounce_seconds": MAX_POLICY_SECONDS + 1,
                "condition": {"kind": "threshold", "channel": "PRESSURE_IN", "op": "lt", "value": 1.0}}]),
        ];
        for case in cases {
            let err = validate_rules(parse(case.clone()), &channels()).unwrap_err();
            assert!(err.contains("must be <="), "{case}: {err}");
        }
    }

    #[test]
    fn validated_windows_are_stored_on_the_condition() {
        let specs = parse(serde_json::json!([
            {"id": "flow_missing", "severity": "WARNING", "hysteresis_seconds": 0,
                "condition": {"kind": "missing_data", "channel": "FLOW", "missing_for_seconds": 300}},
            {"id": "spike", "severity": "WARNING", "hysteresis_seconds": 30,
                "condition": {"kind": "any", "children": [
                    {"kind": "rate_of_change", "channel": "PRESSURE_IN", "window_seconds": 10, "op": "gt", "per_second": 2.0}
                ]}}
        ]));
        let rules = validate_rules(specs, &channels()).expect("valid");
        match &rules[0].condition {
            Condition::MissingData(rule) => assert_eq!(rule.missing_for, ChronoDuration::seconds(300)),
            other => panic!("unexpected condition {other:?}"),
        }
        match &rules[1].condition {
            Condition::Any { children } => match &children[0] {
                Condition::RateOfChange(rule) => assert_eq!(rule.window, ChronoDuration::seconds(10)),
                other => panic!("unexpected child {other:?}"),
            },
            other => panic!("unexpected condition {other:?}"),
        }
    }

    #[test]
    fn titles_and_recommendations_are_carried() {
        let specs = parse(serde_json::json!([
            {
                "id": "flush_bypass",
                "severity": "WARNING",
                "title": " Flush open or bypass ",
                "detail": "",
                "hysteresis_seconds": 60,
                "recommendation": {"code": "A_REC", "title": "Check flush valve and restrictor"},
                "condition": {"kind": "threshold", "channel": "PRESSURE_IN", "op": "lt", "value": 1.0}
            }
        ]));
        let rules = validate_rules(specs, &channels()).expect("valid");
        assert_eq!(rules[0].title.as_deref(), Some("Flush open or bypass"));
        assert_eq!(rules[0].detail, None);
        assert_eq!(
            rules[0].recommendation,
            Some(Recommendation {
                code: "A_REC".to_string(),
                title: "Check flush valve and restrictor".to_string(),
                detail: None,
            })
        );

        let blank_code = parse(serde_json::json!([
            {
                "id": "flush_bypass",
                "severity": "WARNING",
                "hysteresis_seconds": 60,
                "recommendation": {"code": " ", "title": "Check flush valve"},
                "condition": {"kind": "threshold", "channel": "PRESSURE_IN", "op": "lt", "value": 1.0}
            }
        ]));
        assert!(validate_rules(blank_code, &channels()).is_err());
    }

    #[test]
    fn compare_honours_operator() {
        assert!(compare(0.2, CompareOp::Lt, 1.0));
        assert!(!compare(1.0, CompareOp::Lt, 1.0));
        assert!(compare(1.0, CompareOp::Lte, 1.0));
        assert!(compare(1.0, CompareOp::Eq, 1.0));
        assert!(compare(0.0, CompareOp::Neq, 1.0));
    }
}
