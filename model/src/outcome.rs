use crate::metrics::{Observation, Operation};
use serde::{Deserialize, Serialize};
use serde_plain::derive_display_from_serialize;
use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Where the evidence behind a verification came from.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceSource {
    /// The Prometheus aggregator.
    Primary,
    /// A direct scrape of the controller pod.
    Fallback,
}

derive_display_from_serialize!(EvidenceSource);

/// The verdict on one metric delta together with the raw values it was based on.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationOutcome {
    passed: bool,
    message: String,
    elapsed: Duration,
    source: EvidenceSource,
    operation: Operation,
    baseline: Observation,
    observed: Vec<(EvidenceSource, Observation)>,
}

impl VerificationOutcome {
    pub fn pass(
        operation: Operation,
        source: EvidenceSource,
        elapsed: Duration,
        baseline: Observation,
        observed: Observation,
    ) -> Self {
        Self {
            passed: true,
            message: format!(
                "{} metrics verified via {} in {:.1}s: counter {} -> {}, gauge {} -> {} (expected {})",
                operation,
                source,
                elapsed.as_secs_f64(),
                baseline.counter,
                observed.counter,
                baseline.gauge,
                observed.gauge,
                operation.gauge_expectation().symbol(),
            ),
            elapsed,
            source,
            operation,
            baseline,
            observed: vec![(source, observed)],
        }
    }

    /// A failed verification. `observed` holds the last value seen from every source that was
    /// consulted, `reason` says what went wrong.
    pub fn fail<S>(
        operation: Operation,
        source: EvidenceSource,
        elapsed: Duration,
        baseline: Observation,
        observed: Vec<(EvidenceSource, Observation)>,
        reason: S,
    ) -> Self
    where
        S: Into<String>,
    {
        let mut message = format!(
            "{} metrics not verified after {:.1}s ({}): baseline {}",
            operation,
            elapsed.as_secs_f64(),
            reason.into(),
            baseline,
        );
        for (source, observation) in &observed {
            message.push_str(&format!("; {} {}", source, observation));
        }
        Self {
            passed: false,
            message,
            elapsed,
            source,
            operation,
            baseline,
            observed,
        }
    }

    pub fn passed(&self) -> bool {
        self.passed
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn source(&self) -> EvidenceSource {
        self.source
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn baseline(&self) -> &Observation {
        &self.baseline
    }

    pub fn observed(&self) -> &[(EvidenceSource, Observation)] {
        &self.observed
    }
}

impl Display for VerificationOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn failure_embeds_raw_values() {
        let outcome = VerificationOutcome::fail(
            Operation::Delete,
            EvidenceSource::Fallback,
            Duration::from_secs(61),
            Observation::new(2.0, 3.0),
            vec![
                (EvidenceSource::Primary, Observation::new(2.0, 3.0)),
                (EvidenceSource::Fallback, Observation::new(2.0, 3.0)),
            ],
            "counter did not increase",
        );
        assert!(!outcome.passed());
        assert_eq!(outcome.source(), EvidenceSource::Fallback);
        assert_eq!(
            outcome.message(),
            "delete metrics not verified after 61.0s (counter did not increase): baseline \
             counter=2, gauge=3; primary counter=2, gauge=3; fallback counter=2, gauge=3"
        );
    }

    #[test]
    fn pass_names_source() {
        let outcome = VerificationOutcome::pass(
            Operation::Create,
            EvidenceSource::Primary,
            Duration::from_millis(3500),
            Observation::new(0.0, 1.0),
            Observation::new(1.0, 2.0),
        );
        assert!(outcome.passed());
        assert_eq!(outcome.observed().len(), 1);
        assert!(outcome
            .to_string()
            .starts_with("create metrics verified via primary in 3.5s"));
    }
}
