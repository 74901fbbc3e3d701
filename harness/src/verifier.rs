use crate::error::Result;
use crate::poll::{poll_until, Exhausted};
use async_trait::async_trait;
use e2e_model::{EvidenceSource, Observation, Operation, PollPolicy, VerificationOutcome};
use log::{info, warn};
use std::ops::ControlFlow;
use tokio::time::Instant;

/// Somewhere the controller metrics can be read from.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    fn source(&self) -> EvidenceSource;

    /// Reads the operations counter of `(operation, profile)` and the managed profiles gauge.
    async fn observe(&self, operation: Operation, profile: &str) -> Result<Observation>;
}

/// Checks that a profile mutation shows up in the controller metrics. The primary source is
/// polled until the expected delta appears or the policy runs out, then the fallback gets one
/// last look. Without a primary the fallback is polled instead.
pub struct MetricsVerifier<'a> {
    policy: PollPolicy,
    primary: Option<&'a dyn MetricsSource>,
    fallback: &'a dyn MetricsSource,
}

impl<'a> MetricsVerifier<'a> {
    pub fn new(
        policy: PollPolicy,
        primary: Option<&'a dyn MetricsSource>,
        fallback: &'a dyn MetricsSource,
    ) -> Self {
        Self {
            policy,
            primary,
            fallback,
        }
    }

    fn active(&self) -> &'a dyn MetricsSource {
        self.primary.unwrap_or(self.fallback)
    }

    /// Reads the values a later delta is measured against. Must be called right before the
    /// mutation.
    pub async fn baseline(&self, operation: Operation, profile: &str) -> Result<Observation> {
        let baseline = self.active().observe(operation, profile).await?;
        info!(
            "Baseline for {} of '{}' via {}: {}",
            operation,
            profile,
            self.active().source(),
            baseline
        );
        Ok(baseline)
    }

    pub async fn verify_delta(
        &self,
        operation: Operation,
        profile: &str,
        baseline: &Observation,
    ) -> VerificationOutcome {
        let start = Instant::now();
        let active = self.active();
        let polled = poll_source(&self.policy, active, operation, profile, *baseline).await;
        let exhausted = match polled {
            Ok((observation, _)) => {
                return VerificationOutcome::pass(
                    operation,
                    active.source(),
                    start.elapsed(),
                    *baseline,
                    observation,
                )
            }
            Err(exhausted) => exhausted,
        };
        let mut observed = Vec::new();
        if let Some(last) = exhausted.last.flatten() {
            observed.push((active.source(), last));
        }
        if self.primary.is_none() {
            return VerificationOutcome::fail(
                operation,
                active.source(),
                start.elapsed(),
                *baseline,
                observed,
                format!("no expected delta in {} attempts", exhausted.attempts),
            );
        }

        warn!(
            "Prometheus did not report {} within {:?}; checking pod /metrics directly",
            operation, self.policy.deadline
        );
        match self.fallback.observe(operation, profile).await {
            Ok(observation) if observation.satisfies(operation, baseline) => {
                info!("{} observed on pod /metrics (Prometheus lag)", operation);
                VerificationOutcome::pass(
                    operation,
                    self.fallback.source(),
                    start.elapsed(),
                    *baseline,
                    observation,
                )
            }
            Ok(observation) => {
                observed.push((self.fallback.source(), observation));
                VerificationOutcome::fail(
                    operation,
                    self.fallback.source(),
                    start.elapsed(),
                    *baseline,
                    observed,
                    "no expected delta from either source",
                )
            }
            Err(e) => VerificationOutcome::fail(
                operation,
                self.fallback.source(),
                start.elapsed(),
                *baseline,
                observed,
                format!("pod check failed: {}", e),
            ),
        }
    }
}

// Polls `source` until an observation satisfies `operation` against `baseline`. Each failed
// attempt reports the observation it saw, if the read worked.
async fn poll_source(
    policy: &PollPolicy,
    source: &dyn MetricsSource,
    operation: Operation,
    profile: &str,
    baseline: Observation,
) -> std::result::Result<(Observation, std::time::Duration), Exhausted<Option<Observation>>> {
    poll_until(policy, move || async move {
        match source.observe(operation, profile).await {
            Ok(observation) => {
                info!(
                    "After {} (poll, {}): {}",
                    operation,
                    source.source(),
                    observation
                );
                if observation.satisfies(operation, &baseline) {
                    ControlFlow::Break(observation)
                } else {
                    ControlFlow::Continue(Some(observation))
                }
            }
            Err(e) => {
                warn!("Metrics query via {} failed: {}", source.source(), e);
                ControlFlow::Continue(None)
            }
        }
    })
    .await
}
