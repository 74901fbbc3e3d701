/*!

The end-to-end harness for the kapparmor controller. It prepares a MicroK8s host, deploys the
controller with Helm, changes the profiles ConfigMap the controller watches and checks the effect
through the controller logs and its Prometheus metrics.

Every interaction with the host goes through [`exec::CommandRunner`] and every interaction with the
Kubernetes API through [`cluster::ClusterApi`], so the scenarios can be exercised against mocks.

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

pub use error::{Error, Result, Severity};

pub mod address;
pub mod cluster;
pub mod deploy;
pub mod discovery;
pub mod error;
pub mod exec;
pub mod exposition;
pub mod logwait;
pub mod mutator;
pub mod poll;
pub mod prepare;
pub mod promql;
pub mod run_log;
pub mod scrape;
pub mod suite;
pub mod tunnel;
pub mod verifier;
