use super::types::{
    compare, Condition, MissingDataRule, RangeMode, RangeRule, RateOfChangeRule, ThresholdRule,
};
use crate::session::DeviceSession;
use chrono::{DateTime, Utc};

pub struct EvalContext<'a> {
    pub session: &'a DeviceSession,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Verdict {
    pub holds: bool,
    pub observed: Option<f64>,
}

/// One contract for every rule kind: does the condition hold on this session right now.
pub trait Evaluate {
    fn evaluate(&self, ctx: &EvalContext<'_>) -> Verdict;
}

impl Evaluate for ThresholdRule {
    fn evaluate(&self, ctx: &EvalContext<'_>) -> Verdict {
        let Some(sample) = ctx.session.last_sample(self.channel) else {
            return Verdict::default();
        };
        let value = sample.value.as_f64();
        Verdict {
            holds: compare(value, self.op, self.value),
            observed: Some(value),
        }
    }
}

impl Evaluate for RangeRule {
    fn evaluate(&self, ctx: &EvalContext<'_>) -> Verdict {
        let Some(sample) = ctx.session.last_sample(self.channel) else {
            return Verdict::default();
        };
        let value = sample.value.as_f64();
        let inside = value >= self.low && value <= self.high;
        Verdict {
            holds: match self.mode {
                RangeMode::Inside => inside,
                RangeMode::Outside => !inside,
            },
            observed: Some(value),
        }
    }
}

impl Evaluate for RateOfChangeRule {
    fn evaluate(&self, ctx: &EvalContext<'_>) -> Verdict {
        let Some(window) = ctx.session.window(self.channel) else {
            return Verdict::default();
        };
        let Some(newest) = window.iter().max_by_key(|sample| sample.observed_at) else {
            return Verdict::default();
        };
        let Some(since) = newest.observed_at.checked_sub_signed(self.window) else {
            return Verdict::default();
        };
        let Some(oldest) = window
            .observed_between(since, newest.observed_at)
            .min_by_key(|sample| sample.observed_at)
        else {
            return Verdict::default();
        };

        let elapsed = (newest.observed_at - oldest.observed_at).num_milliseconds() as f64 / 1000.0;
        if elapsed <= 0.0 {
            return Verdict::default();
        }
        let rate = (newest.value.as_f64() - oldest.value.as_f64()) / elapsed;
        Verdict {
            holds: compare(rate, self.op, self.per_second),
            observed: Some(rate),
        }
    }
}

impl Evaluate for MissingDataRule {
    fn evaluate(&self, ctx: &EvalContext<'_>) -> Verdict {
        // a channel never reported counts as silent since the device was first seen
        let reference = ctx
            .session
            .last_received(self.channel)
            .unwrap_or_else(|| ctx.session.first_seen_at());
        let silent = ctx.now - reference;
        Verdict {
            holds: silent >= self.missing_for,
            observed: Some(silent.num_seconds() as f64),
        }
    }
}

impl Evaluate for Condition {
    fn evaluate(&self, ctx: &EvalContext<'_>) -> Verdict {
        match self {
            Condition::Threshold(rule) => rule.evaluate(ctx),
            Condition::Range(rule) => rule.evaluate(ctx),
            Condition::RateOfChange(rule) => rule.evaluate(ctx),
            Condition::MissingData(rule) => rule.evaluate(ctx),
            Condition::All { children } => {
                let mut observed = None;
                for child in children {
                    let verdict = child.evaluate(ctx);
                    observed = observed.or(verdict.observed);
                    if !verdict.holds {
                        return Verdict {
                            holds: false,
                            observed,
                        };
                    }
                }
                Verdict {
                    holds: true,
                    observed,
                }
            }
            Condition::Any { children } => {
                let mut observed = None;
                for child in children {
                    let verdict = child.evaluate(ctx);
                    if verdict.holds {
                        return verdict;
                    }
                    observed = observed.or(verdict.observed);
                }
                Verdict {
                    holds: false,
                    observed,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::types::CompareOp;
    use crate::session::SessionRegistry;
    use crate::telemetry::{Channel, SampleValue, TelemetrySample};
    use chrono::{Duration as ChronoDuration, TimeZone};

    const DEVICE: &str = "RO-2025-0001";

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        base() + ChronoDuration::seconds(secs)
    }

    fn feed(registry: &mut SessionRegistry, channel: Channel, value: SampleValue, secs: i64) {
        registry.update(TelemetrySample {
            device_id: DEVICE.to_string(),
            tenant_id: "1".to_string(),
            channel,
            value,
            unit: None,
            observed_at: at(secs),
            received_at: at(secs),
        });
    }

    fn registry() -> SessionRegistry {
        SessionRegistry::new(16, ChronoDuration::seconds(60), ChronoDuration::seconds(300))
    }

    fn check(registry: &SessionRegistry, condition: &Condition, now: i64) -> Verdict {
        let session = registry.session(DEVICE).expect("session");
        condition.evaluate(&EvalContext {
            session,
            now: at(now),
        })
    }

    #[test]
    fn threshold_uses_latest_sample() {
        let mut reg = registry();
        let low = Condition::Threshold(ThresholdRule {
            channel: Channel::PressureIn,
            op: CompareOp::Lt,
            value: 1.0,
            unit: None,
        });
        feed(&mut reg, Channel::PressureIn, SampleValue::Number(0.2), 0);
        assert_eq!(
            check(&reg, &low, 0),
            Verdict {
                holds: true,
                observed: Some(0.2)
            }
        );
        feed(&mut reg, Channel::PressureIn, SampleValue::Number(1.5), 1);
        assert!(!check(&reg, &low, 1).holds);
    }

    #[test]
    fn threshold_without_data_does_not_hold() {
        let mut reg = registry();
        feed(&mut reg, Channel::Flow, SampleValue::Number(3.0), 0);
        let rule = Condition::Threshold(ThresholdRule {
            channel: Channel::PressureIn,
            op: CompareOp::Lt,
            value: 1.0,
            unit: None,
        });
        assert_eq!(check(&reg, &rule, 0), Verdict::default());
    }

    #[test]
    fn range_inside_and_outside() {
        let mut reg = registry();
        feed(&mut reg, Channel::Temp, SampleValue::Number(41.0), 0);
        let outside = Condition::Range(RangeRule {
            channel: Channel::Temp,
            mode: RangeMode::Outside,
            low: 5.0,
            high: 35.0,
            unit: None,
        });
        let inside = Condition::Range(RangeRule {
            channel: Channel::Temp,
            mode: RangeMode::Inside,
            low: 5.0,
            high: 35.0,
            unit: None,
        });
        assert!(check(&reg, &outside, 0).holds);
        assert!(!check(&reg, &inside, 0).holds);
    }

    #[test]
    fn rate_of_change_over_observed_window() {
        let mut reg = registry();
        let spike = Condition::RateOfChange(RateOfChangeRule {
            channel: Channel::PressureOut,
            window_seconds: 10,
            window: ChronoDuration::seconds(10),
            op: CompareOp::Gt,
            per_second: 2.0,
            unit: None,
        });
        feed(&mut reg, Channel::PressureOut, SampleValue::Number(10.0), 0);
        assert!(!check(&reg, &spike, 0).holds);

        feed(&mut reg, Channel::PressureOut, SampleValue::Number(12.0), 5);
        let verdict = check(&reg, &spike, 5);
        assert!(!verdict.holds);
        assert_eq!(verdict.observed, Some(0.4));

        feed(&mut reg, Channel::PressureOut, SampleValue::Number(40.0), 10);
        let verdict = check(&reg, &spike, 10);
        assert!(verdict.holds);
        assert_eq!(verdict.observed, Some(3.0));

        // samples older than the window drop out of the slope
        feed(&mut reg, Channel::PressureOut, SampleValue::Number(40.0), 30);
        assert!(!check(&reg, &spike, 30).holds);
    }

    #[test]
    fn missing_data_counts_from_last_receipt() {
        let mut reg = registry();
        let missing = Condition::MissingData(MissingDataRule {
            channel: Channel::Flow,
            missing_for_seconds: 120,
            missing_for: ChronoDuration::seconds(120),
        });
        feed(&mut reg, Channel::Temp, SampleValue::Number(20.0), 0);
        assert!(!check(&reg, &missing, 60).holds);
        assert!(check(&reg, &missing, 120).holds);

        feed(&mut reg, Channel::Flow, SampleValue::Number(3.0), 130);
        assert!(!check(&reg, &missing, 200).holds);
        assert!(check(&reg, &missing, 251).holds);
    }

    #[test]
    fn combinations_require_all_or_any() {
        let mut reg = registry();
        feed(&mut reg, Channel::FloatCall, SampleValue::Bool(true), 0);
        feed(&mut reg, Channel::PressureIn, SampleValue::Number(3.0), 0);
        let calling = Condition::Threshold(ThresholdRule {
            channel: Channel::FloatCall,
            op: CompareOp::Eq,
            value: 1.0,
            unit: None,
        });
        let starved = Condition::Threshold(ThresholdRule {
            channel: Channel::PressureIn,
            op: CompareOp::Lt,
            value: 1.0,
            unit: None,
        });
        let all = Condition::All {
            children: vec![calling.clone(), starved.clone()],
        };
        let any = Condition::Any {
            children: vec![calling, starved],
        };
        assert!(!check(&reg, &all, 0).holds);
        assert!(check(&reg, &any, 0).holds);

        feed(&mut reg, Channel::PressureIn, SampleValue::Number(0.5), 1);
        assert!(check(&reg, &all, 1).holds);
    }
}
