use crate::constants::{
    APP_LABEL_SELECTOR, CONTROLLER_METRICS_PORT, DAEMONSET_NAME, DEFAULT_APP_VERSION,
    DEFAULT_CHART_PATH, DEFAULT_POLL_TIME, DEFAULT_PROM_NS, DEFAULT_TARGET_NS, DEFAULT_TEST_NS,
    EXPECTED_PROFILE, FIXTURE_EDITED, FIXTURE_EMPTY, FIXTURE_ONE_PROFILE, IMAGE_REPOSITORY,
    KUBE_CONTEXT, LOG_TAIL_LINES, METRIC_PROFILES_MANAGED, METRIC_PROFILE_OPERATIONS,
    PROFILES_CONFIG_MAP, PROM_PORT, RELEASE_NAME,
};
use crate::error::{self, Result};
use serde::Deserialize;
use snafu::ResultExt;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The settings that can be provided through environment variables or the shell style config
/// files. Every field is optional and falls back to a built in default.
///
/// # Example
///
/// ```text
/// export TARGET_NS=security
/// K8S_NODE_IP="192.168.1.20"
/// ```
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct EnvSettings {
    /// Seconds the controller waits between two reconciliations.
    pub poll_time: Option<u64>,
    /// The version of the controller under test. The image tag is `<version>-dev`.
    pub app_version: Option<String>,
    pub target_ns: Option<String>,
    pub test_ns: Option<String>,
    pub prom_ns: Option<String>,
    /// Overrides the detection of the node address.
    pub k8s_node_ip: Option<String>,
    pub kube_context: Option<String>,
}

impl EnvSettings {
    /// Deserializes the settings from `KEY=VALUE` pairs. Later pairs win over earlier ones, empty
    /// values are treated as unset and keys that are not settings are ignored.
    pub fn from_vars<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: BTreeMap<String, String> = vars
            .into_iter()
            .filter(|(_, value)| !value.is_empty())
            .collect();
        Ok(envy::from_iter(vars).context(error::EnvSettingsSnafu)?)
    }
}

/// Parses a shell style config file. Blank lines and comments are skipped, an `export ` prefix is
/// accepted and matching single or double quotes around values are removed.
pub fn parse_shell_config(text: &str) -> Vec<(String, String)> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let line = line.strip_prefix("export ").unwrap_or(line).trim_start();
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            if key.is_empty() || key.contains(char::is_whitespace) {
                return None;
            }
            Some((key.to_string(), unquote(value.trim()).to_string()))
        })
        .collect()
}

/// Reads and parses a shell style config file. A missing file yields no settings.
pub fn read_shell_config(path: &Path) -> Result<Vec<(String, String)>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(parse_shell_config(&text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e)
            .context(error::ShellConfigReadSnafu { path })
            .map_err(Into::into),
    }
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// A fixed interval poll bounded by an absolute deadline measured from its start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub deadline: Duration,
}

impl PollPolicy {
    pub fn new(interval: Duration, deadline: Duration) -> Self {
        Self { interval, deadline }
    }
}

/// Every time budget used by a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    /// Bound for commands that have no budget of their own.
    pub command: Duration,
    /// Passed to `microk8s status --wait-ready --timeout`.
    pub cluster_ready: Duration,
    pub tunnel_connect: Duration,
    /// Time a relay gets to exit after SIGTERM before it is killed.
    pub tunnel_grace: Duration,
    pub image_build: Duration,
    pub helm: Duration,
    pub rollout: PollPolicy,
    pub metrics: PollPolicy,
    pub log_interval: Duration,
    pub empty_profiles_log: Duration,
    pub profile_log: Duration,
    pub http: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            command: Duration::from_secs(120),
            cluster_ready: Duration::from_secs(30),
            tunnel_connect: Duration::from_secs(5),
            tunnel_grace: Duration::from_secs(2),
            image_build: Duration::from_secs(1800),
            helm: Duration::from_secs(180),
            rollout: PollPolicy::new(Duration::from_secs(2), Duration::from_secs(120)),
            metrics: PollPolicy::new(Duration::from_secs(3), Duration::from_secs(60)),
            log_interval: Duration::from_secs(3),
            empty_profiles_log: Duration::from_secs(30),
            profile_log: Duration::from_secs(45),
            http: Duration::from_secs(10),
        }
    }
}

/// The ConfigMap manifests applied by the profile management scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fixtures {
    pub empty: PathBuf,
    pub one_profile: PathBuf,
    pub edited: PathBuf,
}

impl Default for Fixtures {
    fn default() -> Self {
        Self {
            empty: PathBuf::from(FIXTURE_EMPTY),
            one_profile: PathBuf::from(FIXTURE_ONE_PROFILE),
            edited: PathBuf::from(FIXTURE_EDITED),
        }
    }
}

/// Where the controller metrics are found and what they are called.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricNames {
    pub operations_counter: String,
    pub managed_gauge: String,
    pub prometheus_port: u16,
    pub controller_port: u16,
}

impl Default for MetricNames {
    fn default() -> Self {
        Self {
            operations_counter: METRIC_PROFILE_OPERATIONS.to_string(),
            managed_gauge: METRIC_PROFILES_MANAGED.to_string(),
            prometheus_port: PROM_PORT,
            controller_port: CONTROLLER_METRICS_PORT,
        }
    }
}

/// The settings of one run. Built once at startup and shared by reference afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub target_namespace: String,
    pub test_namespace: String,
    pub prometheus_namespace: String,
    pub app_version: String,
    /// The controller reconciliation period.
    pub poll_time: Duration,
    pub node_ip: Option<IpAddr>,
    pub kube_context: String,
    pub kubeconfig: Option<PathBuf>,
    /// The command line prefix used to run kubectl, e.g. `microk8s kubectl`.
    pub kubectl: Vec<String>,
    pub microk8s: String,
    pub chart: PathBuf,
    pub release_name: String,
    pub daemonset_name: String,
    pub label_selector: String,
    pub profiles_config_map: String,
    pub image_repository: String,
    pub expected_profile: String,
    pub log_tail_lines: i64,
    pub fixtures: Fixtures,
    pub metrics: MetricNames,
    pub timeouts: Timeouts,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            target_namespace: DEFAULT_TARGET_NS.to_string(),
            test_namespace: DEFAULT_TEST_NS.to_string(),
            prometheus_namespace: DEFAULT_PROM_NS.to_string(),
            app_version: DEFAULT_APP_VERSION.to_string(),
            poll_time: Duration::from_secs(DEFAULT_POLL_TIME),
            node_ip: None,
            kube_context: KUBE_CONTEXT.to_string(),
            kubeconfig: None,
            kubectl: vec!["microk8s".to_string(), "kubectl".to_string()],
            microk8s: "microk8s".to_string(),
            chart: PathBuf::from(DEFAULT_CHART_PATH),
            release_name: RELEASE_NAME.to_string(),
            daemonset_name: DAEMONSET_NAME.to_string(),
            label_selector: APP_LABEL_SELECTOR.to_string(),
            profiles_config_map: PROFILES_CONFIG_MAP.to_string(),
            image_repository: IMAGE_REPOSITORY.to_string(),
            expected_profile: EXPECTED_PROFILE.to_string(),
            log_tail_lines: LOG_TAIL_LINES,
            fixtures: Fixtures::default(),
            metrics: MetricNames::default(),
            timeouts: Timeouts::default(),
        }
    }
}

impl Settings {
    /// Applies the environment settings on top of the defaults.
    pub fn from_env_settings(env: EnvSettings) -> Result<Self> {
        let defaults = Self::default();
        let node_ip = match env.k8s_node_ip {
            Some(value) => Some(
                value
                    .parse::<IpAddr>()
                    .context(error::InvalidNodeIpSnafu { value: &value })?,
            ),
            None => None,
        };
        Ok(Self {
            target_namespace: env.target_ns.unwrap_or(defaults.target_namespace),
            test_namespace: env.test_ns.unwrap_or(defaults.test_namespace),
            prometheus_namespace: env.prom_ns.unwrap_or(defaults.prometheus_namespace),
            app_version: env.app_version.unwrap_or(defaults.app_version),
            poll_time: env
                .poll_time
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_time),
            node_ip,
            kube_context: env.kube_context.unwrap_or(defaults.kube_context),
            ..defaults
        })
    }

    /// The pause between a mutation and the first assertion on it: one controller period and a
    /// second of slack.
    pub fn reconcile_delay(&self) -> Duration {
        self.poll_time + Duration::from_secs(1)
    }

    /// The controller image built and sideloaded for this run.
    pub fn image(&self) -> String {
        format!("{}:{}", self.image_repository, self.image_tag())
    }

    pub fn image_tag(&self) -> String {
        format!("{}-dev", self.app_version)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;
    use std::net::Ipv4Addr;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_without_environment() {
        let env = EnvSettings::from_vars(vars(&[("PATH", "/usr/bin")])).unwrap();
        assert_eq!(env, EnvSettings::default());
        let settings = Settings::from_env_settings(env).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.target_namespace, "security");
        assert_eq!(settings.reconcile_delay(), Duration::from_secs(6));
        assert_eq!(settings.image(), "ghcr.io/tuxerrante/kapparmor:dev-dev");
    }

    #[test]
    fn later_values_win() {
        let env = EnvSettings::from_vars(vars(&[
            ("TARGET_NS", "from-env"),
            ("POLL_TIME", "2"),
            ("TARGET_NS", "from-config"),
            ("K8S_NODE_IP", "10.1.2.3"),
            ("APP_VERSION", "0.3.0"),
        ]))
        .unwrap();
        let settings = Settings::from_env_settings(env).unwrap();
        assert_eq!(settings.target_namespace, "from-config");
        assert_eq!(settings.poll_time, Duration::from_secs(2));
        assert_eq!(settings.node_ip, Some(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))));
        assert_eq!(settings.image_tag(), "0.3.0-dev");
    }

    #[test]
    fn invalid_node_ip() {
        let env = EnvSettings::from_vars(vars(&[("K8S_NODE_IP", "not-an-ip")])).unwrap();
        assert!(Settings::from_env_settings(env).is_err());
        assert!(EnvSettings::from_vars(vars(&[("POLL_TIME", "soon")])).is_err());
    }

    #[test]
    fn shell_config() {
        let parsed = parse_shell_config(
            r#"
# comment
export TARGET_NS="security"
TEST_NS='kapparmor-test'
  PROM_NS = observability
not a setting
EMPTY=
"#,
        );
        assert_eq!(
            parsed,
            vars(&[
                ("TARGET_NS", "security"),
                ("TEST_NS", "kapparmor-test"),
                ("PROM_NS", "observability"),
                ("EMPTY", ""),
            ])
        );
    }

    #[test]
    fn shell_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "export APP_VERSION=1.2.3").unwrap();
        assert_eq!(
            read_shell_config(file.path()).unwrap(),
            vars(&[("APP_VERSION", "1.2.3")])
        );
        let missing = file.path().with_extension("missing");
        assert!(read_shell_config(&missing).unwrap().is_empty());
    }
}
