use crate::constants::{LABEL_OPERATION, LABEL_PROFILE_NAME};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_plain::{derive_display_from_serialize, derive_fromstr_from_deserialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

/// A reconciliation the controller performs on a single profile.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Modify,
    Delete,
}

derive_display_from_serialize!(Operation);
derive_fromstr_from_deserialize!(Operation);

impl Operation {
    /// How the managed profiles gauge must move for this operation.
    pub fn gauge_expectation(&self) -> GaugeExpectation {
        match self {
            Operation::Create => GaugeExpectation::Increase,
            Operation::Modify => GaugeExpectation::NonDecrease,
            Operation::Delete => GaugeExpectation::Decrease,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum GaugeExpectation {
    Increase,
    NonDecrease,
    Decrease,
}

impl GaugeExpectation {
    pub fn holds(&self, before: f64, after: f64) -> bool {
        match self {
            GaugeExpectation::Increase => after > before,
            GaugeExpectation::NonDecrease => after >= before,
            GaugeExpectation::Decrease => after < before,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            GaugeExpectation::Increase => ">",
            GaugeExpectation::NonDecrease => ">=",
            GaugeExpectation::Decrease => "<",
        }
    }
}

/// An ordered set of label name/value pairs identifying one metric series.
#[derive(Debug, Clone, Default, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<S1, S2>(mut self, name: S1, value: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        self.0.insert(name.into(), value.into());
        self
    }

    /// The labels of the per-profile operations counter.
    pub fn operation(operation: Operation, profile: &str) -> Self {
        Self::new()
            .with(LABEL_OPERATION, operation.to_string())
            .with(LABEL_PROFILE_NAME, profile)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Serializes a series selector such as `metric{a="x",b="y"}`. Labels are emitted in name
    /// order and values are escaped.
    pub fn selector(&self, metric: &str) -> String {
        if self.0.is_empty() {
            return metric.to_string();
        }
        let matchers: Vec<String> = self
            .0
            .iter()
            .map(|(name, value)| format!("{}=\"{}\"", name, escape(value)))
            .collect();
        format!("{}{{{}}}", metric, matchers.join(","))
    }

    /// Returns `true` when every label of this set is present in `labels` with an identical
    /// value. Extra labels in `labels` are allowed.
    pub fn matches<'a, I>(&self, labels: I) -> bool
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let found: BTreeMap<&str, &str> = labels.into_iter().collect();
        self.0
            .iter()
            .all(|(name, value)| found.get(name.as_str()) == Some(&value.as_str()))
    }
}

impl<K, V> FromIterator<(K, V)> for LabelSet
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl Display for LabelSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.selector(""))
    }
}

fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// A scalar metric value and the time it was observed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricSample {
    pub value: f64,
    pub observed_at: DateTime<Utc>,
}

impl MetricSample {
    pub fn now(value: f64) -> Self {
        Self {
            value,
            observed_at: Utc::now(),
        }
    }
}

impl Display for MetricSample {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value)
    }
}

/// The operations counter of one `(operation, profile)` pair together with the managed profiles
/// gauge, read from a single source at one point in time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub counter: MetricSample,
    pub gauge: MetricSample,
}

impl Observation {
    pub fn new(counter: f64, gauge: f64) -> Self {
        Self {
            counter: MetricSample::now(counter),
            gauge: MetricSample::now(gauge),
        }
    }

    /// The counter must have strictly increased and the gauge must have moved the way
    /// `operation` requires, both relative to `baseline`.
    pub fn satisfies(&self, operation: Operation, baseline: &Observation) -> bool {
        self.counter.value > baseline.counter.value
            && operation
                .gauge_expectation()
                .holds(baseline.gauge.value, self.gauge.value)
    }
}

impl Display for Observation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "counter={}, gauge={}", self.counter, self.gauge)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn operation_strings() {
        assert_eq!(Operation::Modify.to_string(), "modify");
        assert_eq!(Operation::from_str("delete").unwrap(), Operation::Delete);
        assert!(Operation::from_str("rename").is_err());
    }

    #[test]
    fn selector_is_ordered_and_escaped() {
        let labels = LabelSet::new()
            .with("profile_name", "custom.\"odd\"\\name")
            .with("operation", "create");
        assert_eq!(
            labels.selector("kapparmor_profile_operations_total"),
            r#"kapparmor_profile_operations_total{operation="create",profile_name="custom.\"odd\"\\name"}"#
        );
        assert_eq!(LabelSet::new().selector("up"), "up");
    }

    #[test]
    fn matching_requires_exact_values() {
        let labels = LabelSet::operation(Operation::Create, "custom.p");
        assert!(labels.matches(vec![
            ("operation", "create"),
            ("profile_name", "custom.p"),
            ("pod", "kapparmor-x"),
        ]));
        assert!(!labels.matches(vec![("operation", "create"), ("profile_name", "custom.p2")]));
        assert!(!labels.matches(vec![("operation", "create")]));
        assert!(LabelSet::new().matches(Vec::<(&str, &str)>::new()));
    }

    #[test]
    fn counter_must_strictly_increase() {
        let baseline = Observation::new(3.0, 1.0);
        assert!(!Observation::new(3.0, 2.0).satisfies(Operation::Create, &baseline));
        assert!(Observation::new(4.0, 2.0).satisfies(Operation::Create, &baseline));
    }

    #[test]
    fn gauge_rules_per_operation() {
        let baseline = Observation::new(0.0, 2.0);
        assert!(!Observation::new(1.0, 2.0).satisfies(Operation::Create, &baseline));
        assert!(Observation::new(1.0, 2.0).satisfies(Operation::Modify, &baseline));
        assert!(Observation::new(1.0, 3.0).satisfies(Operation::Modify, &baseline));
        assert!(!Observation::new(1.0, 1.0).satisfies(Operation::Modify, &baseline));
        assert!(Observation::new(1.0, 1.0).satisfies(Operation::Delete, &baseline));
        assert!(!Observation::new(1.0, 2.0).satisfies(Operation::Delete, &baseline));
    }
}
