/// Helper macro to avoid retyping the prefix shared by every metric the controller exports. When
/// given no parameters, this returns the prefix. When given a string literal parameter it adds
/// `_parameter` to the end.
macro_rules! kapparmor {
    () => {
        "kapparmor"
    };
    ($s:literal) => {
        concat!(kapparmor!(), "_", $s)
    };
}

// Controller identifiers
pub const DAEMONSET_NAME: &str = "kapparmor";
pub const RELEASE_NAME: &str = "kapparmor";
pub const PROFILES_CONFIG_MAP: &str = "kapparmor-profiles";
pub const IMAGE_REPOSITORY: &str = "ghcr.io/tuxerrante/kapparmor";
pub const FIELD_MANAGER: &str = "kapparmor-e2e";

// Namespaces
pub const DEFAULT_TARGET_NS: &str = "security";
pub const DEFAULT_TEST_NS: &str = "kapparmor-test";
pub const DEFAULT_PROM_NS: &str = "observability";

// Standard tags https://kubernetes.io/docs/concepts/overview/working-with-objects/common-labels/
pub const APP_NAME: &str = "app.kubernetes.io/name";
pub const APP_PART_OF: &str = "app.kubernetes.io/part-of";
pub const LABEL_RELEASE: &str = "release";
pub const APP_LABEL_SELECTOR: &str = "app.kubernetes.io/name=kapparmor";

// Prometheus discovery
pub const PROM_STACK: &str = "kube-prometheus-stack";
pub const PROM_RELEASE: &str = "kube-prom-stack";
pub const PROM_NAMES: [&str; 2] = ["prometheus", "prometheus-operated"];
pub const PROM_PORT: u16 = 9090;

// Controller metrics
pub const CONTROLLER_METRICS_PORT: u16 = 8080;
pub const METRICS_PATH: &str = "/metrics";
pub const METRIC_PROFILE_OPERATIONS: &str = kapparmor!("profile_operations_total");
pub const METRIC_PROFILES_MANAGED: &str = kapparmor!("profiles_managed");
pub const LABEL_OPERATION: &str = "operation";
pub const LABEL_PROFILE_NAME: &str = "profile_name";

// Profiles
pub const PROFILE_PREFIX: &str = "custom.";
pub const EXPECTED_PROFILE: &str = "custom.deny-write-outside-home";
pub const METRIC_PROFILE_STEM: &str = "custom.test-metric-profile";

// Controller log lines
pub const LOG_MARKER: &str = "retrieving profiles";
pub const EMPTY_PROFILES_MARKER: &str = "profiles=[]";
pub const LOG_TAIL_LINES: i64 = 200;

// Fixtures and paths
pub const FIXTURE_EMPTY: &str = "test/cm-kapparmor-empty.yml";
pub const FIXTURE_ONE_PROFILE: &str = "test/cm-kapparmor-home-profile.yml";
pub const FIXTURE_EDITED: &str = "test/cm-kapparmor-home-profile-edited.yml";
pub const DEFAULT_CHART_PATH: &str = "charts/kapparmor";
pub const CONFIG_FILE: &str = "config/config";
pub const SECRETS_FILE: &str = ".config/secrets";
pub const LOG_DIR: &str = "output";

// Cluster
pub const KUBE_CONTEXT: &str = "microk8s";
pub const KUBELET_SERVING_SIGNER: &str = "kubernetes.io/kubelet-serving";
pub const NODE_IP_PROBE_TARGET: &str = "1.1.1.1";
pub const HELM_KUBE_VERSION: &str = "1.30";
pub const VIRTUAL_INTERFACE_PREFIXES: [&str; 7] =
    ["lo", "docker", "br-", "cni", "flannel", "vxlan", "calico"];

// Defaults for environment settings
pub const DEFAULT_POLL_TIME: u64 = 5;
pub const DEFAULT_APP_VERSION: &str = "dev";

#[test]
fn kapparmor_constants_macro_test() {
    assert_eq!("kapparmor", kapparmor!());
    assert_eq!("kapparmor_profiles_managed", METRIC_PROFILES_MANAGED);
    assert_eq!("kapparmor_foo", kapparmor!("foo"));
}
