/*!

This library provides the data model of the kapparmor end-to-end verifier: the run settings, the
MicroK8s network configuration, kubelet certificate requests, the profile configuration that is fed
to the controller and the metric observations used to verify it.

!*/

#![deny(
    clippy::expect_used,
    clippy::get_unwrap,
    clippy::panic,
    clippy::panic_in_result_fn,
    clippy::panicking_unwrap,
    clippy::unwrap_in_result,
    clippy::unwrap_used
)]

pub use csr::CertificateRequest;
pub use error::{Error, Result};
pub use metrics::{GaugeExpectation, LabelSet, MetricSample, Observation, Operation};
pub use network::NetworkConfig;
pub use outcome::{EvidenceSource, VerificationOutcome};
pub use profile::{read_manifest, ProfileConfig};
pub use settings::{EnvSettings, Fixtures, MetricNames, PollPolicy, Settings, Timeouts};

pub mod constants;
pub mod csr;
mod error;
pub mod metrics;
pub mod network;
mod outcome;
pub mod profile;
pub mod settings;
