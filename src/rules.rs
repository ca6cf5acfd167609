//! Automation rules: compare a reading against thresholds on every scanning
//! cycle and drive a digital output when the condition holds.
use crate::config::{AutomationRule, Comparator, Threshold};
use crate::readings::{as_number, Readings};
use crate::scheduler::{Scheduler, TimerKey};
use log::*;
use std::collections::BTreeMap;

/// Output change requested by a satisfied rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actuation {
    pub rule: String,
    pub output: String,
    pub high: bool,
}

/// Evaluates one rule against the current readings.
pub fn evaluate(rule: &AutomationRule, readings: &Readings) -> Option<Actuation> {
    let Some(reading) = readings.resolve(&rule.trigger_point) else {
        warn!(
            "Rule {}: trigger point {} has no reading",
            rule.name, rule.trigger_point
        );
        return None;
    };
    let Some(value) = as_number(&reading) else {
        warn!(
            "Rule {}: reading {reading} of {} is not numeric",
            rule.name, rule.trigger_point
        );
        return None;
    };
    let lower = rule
        .lower_threshold
        .as_ref()
        .and_then(Threshold::as_integer)
        .map(|v| v as f64);
    let upper = rule
        .upper_threshold
        .as_ref()
        .and_then(Threshold::as_integer)
        .map(|v| v as f64);

    let satisfied = match rule.condition {
        Comparator::Greater => lower.map(|lower| value > lower),
        Comparator::GreaterOrEqual => lower.map(|lower| value >= lower),
        Comparator::Less => upper.map(|upper| value < upper),
        Comparator::LessOrEqual => upper.map(|upper| value <= upper),
        Comparator::Within => lower
            .zip(upper)
            .map(|(lower, upper)| lower <= value && value <= upper),
        Comparator::Outside => lower
            .zip(upper)
            .map(|(lower, upper)| value < lower || value > upper),
    };
    match satisfied {
        Some(true) => {
            debug!(
                "Rule {} satisfied by {} = {value}",
                rule.name, rule.trigger_point
            );
            Some(Actuation {
                rule: rule.name.clone(),
                output: rule.output.clone(),
                high: rule.action.level(),
            })
        }
        Some(false) => None,
        None => {
            warn!(
                "Rule {}: missing threshold for {:?}",
                rule.name, rule.condition
            );
            None
        }
    }
}

/// Enabled rules, each with exactly one scanning timer.
#[derive(Debug, Default)]
pub struct RuleEngine {
    rules: BTreeMap<String, AutomationRule>,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables every rule flagged as enabled, disabling all others.
    pub fn schedule(&mut self, rules: &[AutomationRule], scheduler: &mut Scheduler) -> usize {
        scheduler.cancel_where(|key| matches!(key, TimerKey::Rule(..)));
        self.rules.clear();
        for rule in rules.iter().filter(|rule| rule.enabled) {
            self.enable(rule, scheduler);
        }
        self.rules.len()
    }

    /// Starts scanning `rule`, replacing its previous timer.
    pub fn enable(&mut self, rule: &AutomationRule, scheduler: &mut Scheduler) {
        scheduler.arm(TimerKey::Rule(rule.name.clone()), rule.scanning_cycle);
        if self.rules.insert(rule.name.clone(), rule.clone()).is_some() {
            debug!("Rule {} restarted", rule.name);
        } else {
            info!(
                "Rule {} enabled, scanning every {:?}",
                rule.name, rule.scanning_cycle
            );
        }
    }

    pub fn disable(&mut self, name: &str, scheduler: &mut Scheduler) -> bool {
        scheduler.cancel(&TimerKey::Rule(name.to_string()));
        let removed = self.rules.remove(name).is_some();
        if removed {
            info!("Rule {name} disabled");
        }
        removed
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.rules.contains_key(name)
    }

    /// Evaluates the rule behind a timer tick.
    pub fn tick(&self, name: &str, readings: &Readings) -> Option<Actuation> {
        evaluate(self.rules.get(name)?, readings)
    }
}
