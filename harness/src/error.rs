use snafu::Snafu;
use std::path::PathBuf;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("'{}' was not found: {}", program, source))]
    CommandNotFound {
        program: String,
        source: std::io::Error,
    },

    #[snafu(display("Failed to run '{}': {}", command, source))]
    CommandSpawn {
        command: String,
        source: std::io::Error,
    },

    #[snafu(display(
        "'{}' failed with exit status '{}'\n\n{}\n\n{}",
        command,
        code.map(|code| code.to_string()).unwrap_or_else(|| "signal".to_string()),
        stdout,
        stderr
    ))]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[snafu(display("'{}' did not finish within {:?}", command, timeout))]
    CommandTimeout { command: String, timeout: Duration },

    #[snafu(display("The cluster is not ready: {}", reason))]
    ClusterNotReady { reason: String },

    #[snafu(display("Unable to determine the node IP address"))]
    AddressUnresolvable,

    #[snafu(display("'{}' was not rolled out within {:?}", workload, timeout))]
    RolloutTimeout { workload: String, timeout: Duration },

    #[snafu(display(
        "Port forward to '{}' did not accept connections within {:?}:\n{}",
        target,
        timeout,
        diagnostics
    ))]
    ConnectFailed {
        target: String,
        timeout: Duration,
        diagnostics: String,
    },

    #[snafu(display("No local port available: {}", source))]
    LocalPort { source: std::io::Error },

    #[snafu(display("No usable Prometheus in namespace '{}': {}", namespace, reason))]
    AggregatorUnavailable { namespace: String, reason: String },

    #[snafu(display("Unable to load kubeconfig: {}", source))]
    Kubeconfig {
        source: kube::config::KubeconfigError,
    },

    #[snafu(display("Unable to create client: {}", source))]
    ClientCreate { source: kube::Error },

    #[snafu(display("Unable to {}: {}", action, source))]
    Kube { action: String, source: kube::Error },

    #[snafu(display("No pods match '{}' in namespace '{}'", selector, namespace))]
    NoPods { namespace: String, selector: String },

    #[snafu(display("Unable to build HTTP client: {}", source))]
    HttpClient { source: reqwest::Error },

    #[snafu(display("Request to '{}' failed: {}", url, source))]
    Http { url: String, source: reqwest::Error },

    #[snafu(display("Unable to parse the response of '{}': {}", url, source))]
    ResponseParse {
        url: String,
        source: serde_json::Error,
    },

    #[snafu(display("Unable to {}: {}", action, source))]
    Json {
        action: String,
        source: serde_json::Error,
    },

    #[snafu(display("Invalid manifest: {}", reason))]
    Manifest { reason: String },

    #[snafu(display("Unable to {}: {}", action, source))]
    SerdeYaml {
        action: String,
        source: serde_yaml::Error,
    },

    #[snafu(display("Unable to {}: {}", action, source))]
    Io {
        action: String,
        source: std::io::Error,
    },

    #[snafu(display("Unable to open log file '{}': {}", path.display(), source))]
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Unable to initialize the logger: {}", source))]
    Logger { source: log::SetLoggerError },

    #[snafu(display("{}", source))]
    Model { source: e2e_model::Error },
}

/// How a run reacts to an error.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Severity {
    /// The run cannot continue.
    Fatal,
    /// Only the current scenario is affected.
    Scenario,
    /// The primary observability path is unusable and the fallback takes over.
    Degraded,
}

impl Error {
    pub fn severity(&self) -> Severity {
        match self {
            Error::ClusterNotReady { .. }
            | Error::AddressUnresolvable
            | Error::RolloutTimeout { .. }
            | Error::Kubeconfig { .. }
            | Error::ClientCreate { .. }
            | Error::LogFile { .. }
            | Error::Logger { .. } => Severity::Fatal,
            Error::AggregatorUnavailable { .. } => Severity::Degraded,
            _ => Severity::Scenario,
        }
    }
}
