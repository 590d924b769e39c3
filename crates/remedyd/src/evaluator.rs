//! Rule evaluation over a target's sample window.
//!
//! Evaluation is a pure function of `(rule, window, now)`: no state is kept
//! between calls. Missing ticks count as unknown, never as false, so a
//! collection gap can delay a judgement but cannot clear an issue.

use chrono::{DateTime, Utc};
use remedy_common::{CheckStatus, Rule, RuleCondition, Sample};
use std::time::Duration;

/// Converts a std duration into a chrono one, saturating on overflow
pub fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(duration.as_millis().min(i64::MAX as u128) as i64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Holds,
    Clear,
    /// Not enough data to judge either way
    Unknown,
}

impl Verdict {
    pub fn holds(&self) -> bool {
        matches!(self, Verdict::Holds)
    }

    pub fn status(&self) -> CheckStatus {
        match self {
            Verdict::Holds => CheckStatus::Holds,
            Verdict::Clear => CheckStatus::Clear,
            Verdict::Unknown => CheckStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub verdict: Verdict,
    /// Latest value for threshold rules, restart count for restart loops
    pub observed: Option<f64>,
}

impl Evaluation {
    fn new(verdict: Verdict, observed: Option<f64>) -> Self {
        Self { verdict, observed }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationPhase {
    /// Right after the action finished
    Immediate,
    /// After the monitoring window elapsed
    Deferred,
}

/// Post-action check result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    Cleared,
    StillHolds,
    /// The condition depends on data that has not arrived yet
    Ambiguous,
}

/// Upper bound on ticks a sustained window is split into
pub const MAX_SLOTS: usize = 86_400;

/// `now - span`, clamped to the earliest representable instant
fn window_start(now: DateTime<Utc>, span: chrono::Duration) -> DateTime<Utc> {
    now.checked_sub_signed(span).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[derive(Debug, Clone)]
pub struct Evaluator {
    poll_interval: Duration,
}

impl Evaluator {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn evaluate(&self, rule: &Rule, window: &[Sample], now: DateTime<Utc>) -> Evaluation {
        match &rule.condition {
            RuleCondition::Threshold {
                comparator,
                threshold,
                sustained_for,
            } => {
                let slots = self.slots(*sustained_for);
                let interval_ms = to_chrono(self.poll_interval).num_milliseconds().max(1);
                let span_ms = interval_ms.saturating_mul(slots as i64);
                let start = window_start(now, chrono::Duration::milliseconds(span_ms));

                let in_window: Vec<&Sample> = relevant(rule, window)
                    .filter(|s| s.timestamp > start && s.timestamp <= now)
                    .collect();

                let latest = match in_window.iter().max_by_key(|s| s.timestamp) {
                    Some(latest) => *latest,
                    None => return Evaluation::new(Verdict::Unknown, None),
                };
                let observed = Some(latest.value);

                if in_window
                    .iter()
                    .any(|s| !comparator.holds(s.value, *threshold))
                {
                    return Evaluation::new(Verdict::Clear, observed);
                }

                let mut occupied = vec![false; slots];
                for sample in &in_window {
                    let age_ms = (now - sample.timestamp).num_milliseconds().max(0);
                    let slot = ((age_ms / interval_ms) as usize).min(slots - 1);
                    occupied[slot] = true;
                }
                let gaps = occupied.iter().filter(|o| !**o).count();

                if gaps <= 1 {
                    Evaluation::new(Verdict::Holds, observed)
                } else {
                    Evaluation::new(Verdict::Unknown, observed)
                }
            }
            RuleCondition::RestartLoop {
                max_restarts,
                window: lookback,
            } => {
                let start = window_start(now, to_chrono(*lookback));
                let restarts: f64 = relevant(rule, window)
                    .filter(|s| s.timestamp > start && s.timestamp <= now)
                    .map(|s| s.value.max(0.0))
                    .sum();

                let verdict = if restarts > f64::from(*max_restarts) {
                    Verdict::Holds
                } else {
                    Verdict::Clear
                };
                Evaluation::new(verdict, Some(restarts))
            }
        }
    }

    /// Judge whether an action fixed the condition, looking only at samples
    /// collected after `since`.
    pub fn validate(
        &self,
        rule: &Rule,
        window: &[Sample],
        since: DateTime<Utc>,
        now: DateTime<Utc>,
        phase: ValidationPhase,
    ) -> Validation {
        let after: Vec<&Sample> = relevant(rule, window)
            .filter(|s| s.timestamp > since && s.timestamp <= now)
            .collect();

        match &rule.condition {
            RuleCondition::Threshold {
                comparator,
                threshold,
                sustained_for,
            } => {
                let latest = match after.iter().max_by_key(|s| s.timestamp) {
                    Some(latest) => latest,
                    None => return Validation::Ambiguous,
                };
                if !comparator.holds(latest.value, *threshold) {
                    Validation::Cleared
                } else if sustained_for.is_zero() || phase == ValidationPhase::Deferred {
                    Validation::StillHolds
                } else {
                    Validation::Ambiguous
                }
            }
            RuleCondition::RestartLoop { .. } => {
                let new_restarts: f64 = after.iter().map(|s| s.value.max(0.0)).sum();
                if new_restarts > 0.0 {
                    Validation::StillHolds
                } else if phase == ValidationPhase::Deferred {
                    Validation::Cleared
                } else {
                    Validation::Ambiguous
                }
            }
        }
    }

    /// Number of poll ticks a sustained window spans
    fn slots(&self, sustained_for: Duration) -> usize {
        if sustained_for.is_zero() {
            return 1;
        }
        let ratio = sustained_for.as_secs_f64() / self.poll_interval.as_secs_f64();
        (ratio.round().min(MAX_SLOTS as f64) as usize).max(1)
    }
}

fn relevant<'a>(rule: &'a Rule, window: &'a [Sample]) -> impl Iterator<Item = &'a Sample> + 'a {
    window
        .iter()
        .filter(move |s| s.metric_name == rule.metric_name && rule.applies_to(s.target_type))
}

#[cfg(test)]
mod tests {
    use super::*;
    use remedy_common::{Comparator, Severity, Target, TargetType};

    const TICK: u64 = 30;

    fn cpu_rule() -> Rule {
        Rule::threshold(
            "cpu_sustained_80",
            Some(TargetType::Container),
            "cpu_percent",
            Comparator::Gt,
            80.0,
            Duration::from_secs(4 * TICK),
            Severity::High,
        )
    }

    fn restart_rule() -> Rule {
        Rule::restart_loop(
            "restart_loop",
            Some(TargetType::Container),
            5,
            Duration::from_secs(600),
            Severity::Critical,
        )
    }

    /// Samples for consecutive ticks ending at `now`; `None` is a missed tick
    fn ticks(values: &[Option<f64>], now: DateTime<Utc>) -> Vec<Sample> {
        let target = Target::container("c1");
        let n = values.len() as i64;
        values
            .iter()
            .enumerate()
            .filter_map(|(i, v)| {
                v.map(|value| {
                    let age = (n - 1 - i as i64) * TICK as i64;
                    Sample::new(&target, "cpu_percent", value, now - chrono::Duration::seconds(age))
                })
            })
            .collect()
    }

    fn evaluator() -> Evaluator {
        Evaluator::new(Duration::from_secs(TICK))
    }

    #[test]
    fn test_sustained_rule_holds_when_every_tick_satisfies() {
        let now = Utc::now();
        let window = ticks(&[Some(95.0), Some(92.0), Some(88.0), Some(85.0)], now);
        let eval = evaluator().evaluate(&cpu_rule(), &window, now);
        assert_eq!(eval.verdict, Verdict::Holds);
        assert_eq!(eval.observed, Some(85.0));
    }

    #[test]
    fn test_one_missing_tick_is_tolerated() {
        let now = Utc::now();
        let window = ticks(&[Some(95.0), None, Some(88.0), Some(85.0)], now);
        assert!(evaluator().evaluate(&cpu_rule(), &window, now).verdict.holds());
    }

    #[test]
    fn test_two_missing_ticks_are_unknown_not_clear() {
        let now = Utc::now();
        let window = ticks(&[Some(95.0), None, None, Some(85.0)], now);
        assert_eq!(
            evaluator().evaluate(&cpu_rule(), &window, now).verdict,
            Verdict::Unknown
        );
    }

    #[test]
    fn test_single_low_sample_breaks_sustained_window() {
        let now = Utc::now();
        let window = ticks(&[Some(95.0), Some(40.0), Some(88.0), Some(85.0)], now);
        assert_eq!(
            evaluator().evaluate(&cpu_rule(), &window, now).verdict,
            Verdict::Clear
        );
    }

    #[test]
    fn test_latest_sample_below_threshold_clears() {
        let now = Utc::now();
        let window = ticks(&[Some(95.0), Some(92.0), Some(88.0), Some(85.0), Some(40.0)], now);
        let eval = evaluator().evaluate(&cpu_rule(), &window, now);
        assert_eq!(eval.verdict, Verdict::Clear);
        assert_eq!(eval.observed, Some(40.0));
    }

    #[test]
    fn test_samples_outside_window_are_ignored() {
        let now = Utc::now();
        // A low reading five ticks back sits outside the four-tick window
        let window = ticks(&[Some(10.0), Some(95.0), Some(92.0), Some(88.0), Some(85.0)], now);
        assert!(evaluator().evaluate(&cpu_rule(), &window, now).verdict.holds());
    }

    #[test]
    fn test_empty_window_is_unknown() {
        let now = Utc::now();
        assert_eq!(
            evaluator().evaluate(&cpu_rule(), &[], now).verdict,
            Verdict::Unknown
        );
    }

    #[test]
    fn test_other_metrics_do_not_count() {
        let now = Utc::now();
        let target = Target::container("c1");
        let window = vec![Sample::new(&target, "memory_percent", 99.0, now)];
        assert_eq!(
            evaluator().evaluate(&cpu_rule(), &window, now).verdict,
            Verdict::Unknown
        );
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let now = Utc::now();
        let window = ticks(&[Some(95.0), None, Some(88.0), Some(85.0)], now);
        let first = evaluator().evaluate(&cpu_rule(), &window, now);
        let second = evaluator().evaluate(&cpu_rule(), &window, now);
        assert_eq!(first, second);
    }

    #[test]
    fn test_exhaustive_four_tick_patterns() {
        // Every combination of satisfying / violating / missing over four
        // ticks: holds iff nothing violates, the latest present sample
        // satisfies and at most one tick is missing.
        let now = Utc::now();
        let choices = [Some(90.0), Some(50.0), None];
        for a in choices {
            for b in choices {
                for c in choices {
                    for d in choices {
                        let values = [a, b, c, d];
                        let window = ticks(&values, now);
                        let missing = values.iter().filter(|v| v.is_none()).count();
                        let violating = values.iter().flatten().any(|v| *v <= 80.0);
                        let expected = !window.is_empty() && !violating && missing <= 1;
                        let verdict = evaluator().evaluate(&cpu_rule(), &window, now).verdict;
                        assert_eq!(verdict.holds(), expected, "{:?}", values);
                    }
                }
            }
        }
    }

    #[test]
    fn test_restart_loop_strictly_exceeds() {
        let now = Utc::now();
        let target = Target::container("c2");
        let mut window: Vec<Sample> = (0..5)
            .map(|i| Sample::new(&target, "restarts", 1.0, now - chrono::Duration::minutes(i)))
            .collect();
        assert_eq!(
            evaluator().evaluate(&restart_rule(), &window, now).verdict,
            Verdict::Clear
        );

        window.push(Sample::new(&target, "restarts", 1.0, now - chrono::Duration::minutes(9)));
        let eval = evaluator().evaluate(&restart_rule(), &window, now);
        assert_eq!(eval.verdict, Verdict::Holds);
        assert_eq!(eval.observed, Some(6.0));
    }

    #[test]
    fn test_restart_loop_ignores_old_events() {
        let now = Utc::now();
        let target = Target::container("c2");
        let window: Vec<Sample> = (0..6)
            .map(|i| {
                Sample::new(&target, "restarts", 1.0, now - chrono::Duration::minutes(8 + i))
            })
            .collect();
        // Only the events at 8 and 9 minutes ago are inside the 10 minute window
        let eval = evaluator().evaluate(&restart_rule(), &window, now);
        assert_eq!(eval.verdict, Verdict::Clear);
        assert_eq!(eval.observed, Some(2.0));
    }

    #[test]
    fn test_huge_windows_are_capped() {
        let now = Utc::now();
        let e = Evaluator::new(Duration::from_millis(1));
        let target = Target::container("c1");
        let hot = vec![Sample::new(&target, "cpu_percent", 95.0, now)];

        let forever = Rule::threshold(
            "cpu_forever",
            Some(TargetType::Container),
            "cpu_percent",
            Comparator::Gt,
            80.0,
            Duration::from_secs(u64::MAX / 4),
            Severity::Low,
        );
        assert_eq!(e.slots(Duration::from_secs(u64::MAX / 4)), MAX_SLOTS);
        // One sample out of the capped slot count is far from sustained
        assert_eq!(e.evaluate(&forever, &hot, now).verdict, Verdict::Unknown);

        let restarts = vec![Sample::new(&target, "restarts", 9.0, now)];
        let ancient = Rule::restart_loop(
            "restart_forever",
            Some(TargetType::Container),
            5,
            Duration::MAX,
            Severity::Low,
        );
        assert!(e.evaluate(&ancient, &restarts, now).verdict.holds());
    }

    #[test]
    fn test_validate_threshold() {
        let now = Utc::now();
        let since = now - chrono::Duration::seconds(45);
        let window = ticks(&[Some(95.0), Some(92.0), Some(88.0), Some(85.0)], now);
        let e = evaluator();

        // Post-action samples still hot: wait for the sustained window
        assert_eq!(
            e.validate(&cpu_rule(), &window, since, now, ValidationPhase::Immediate),
            Validation::Ambiguous
        );
        assert_eq!(
            e.validate(&cpu_rule(), &window, since, now, ValidationPhase::Deferred),
            Validation::StillHolds
        );

        let cooled = ticks(&[Some(95.0), Some(92.0), Some(88.0), Some(30.0)], now);
        assert_eq!(
            e.validate(&cpu_rule(), &cooled, since, now, ValidationPhase::Immediate),
            Validation::Cleared
        );

        assert_eq!(
            e.validate(&cpu_rule(), &window, now, now, ValidationPhase::Deferred),
            Validation::Ambiguous
        );
    }

    #[test]
    fn test_validate_restart_loop() {
        let now = Utc::now();
        let since = now - chrono::Duration::minutes(5);
        let target = Target::container("c2");
        let before: Vec<Sample> = (6..12)
            .map(|i| Sample::new(&target, "restarts", 1.0, now - chrono::Duration::minutes(i)))
            .collect();
        let e = evaluator();

        assert_eq!(
            e.validate(&restart_rule(), &before, since, now, ValidationPhase::Immediate),
            Validation::Ambiguous
        );
        assert_eq!(
            e.validate(&restart_rule(), &before, since, now, ValidationPhase::Deferred),
            Validation::Cleared
        );

        let mut after = before.clone();
        after.push(Sample::new(&target, "restarts", 1.0, now - chrono::Duration::minutes(1)));
        assert_eq!(
            e.validate(&restart_rule(), &after, since, now, ValidationPhase::Deferred),
            Validation::StillHolds
        );
    }
}
