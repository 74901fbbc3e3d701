use crate::error::{self, Result};
use crate::exec::{Cmd, CommandRunner};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use e2e_model::constants::FIELD_MANAGER;
use e2e_model::{CertificateRequest, Settings};
use http::StatusCode;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use log::{debug, info};
use serde_json::json;
use snafu::{OptionExt, ResultExt};

/// The Kubernetes operations the verifier performs.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn certificate_requests(&self) -> Result<Vec<CertificateRequest>>;

    async fn approve_certificate_request(&self, name: &str) -> Result<()>;

    /// Server side applies `config_map` into its namespace, taking ownership of every field.
    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<()>;

    /// Removes all data from a ConfigMap. Returns `false` if the ConfigMap does not exist.
    async fn clear_config_map(&self, namespace: &str, name: &str) -> Result<bool>;

    async fn remove_config_map_key(&self, namespace: &str, name: &str, key: &str) -> Result<()>;

    async fn config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;

    async fn services(&self, namespace: &str) -> Result<Vec<Service>>;

    async fn pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>>;

    /// The last `tail_lines` log lines of every pod matching `selector`, each line prefixed with
    /// `[pod/<name>]`.
    async fn logs(&self, namespace: &str, selector: &str, tail_lines: i64) -> Result<String>;

    async fn daemon_set(&self, namespace: &str, name: &str) -> Result<Option<DaemonSet>>;

    async fn ensure_namespace(&self, name: &str) -> Result<()>;
}

pub trait HttpStatusCode {
    fn status_code(&self) -> Option<StatusCode>;

    fn is_status_code(&self, status_code: StatusCode) -> bool {
        self.status_code()
            .map(|some| some == status_code)
            .unwrap_or_default()
    }
}

impl HttpStatusCode for kube::Error {
    fn status_code(&self) -> Option<StatusCode> {
        if let kube::Error::Api(error_response) = self {
            StatusCode::from_u16(error_response.code).ok()
        } else {
            None
        }
    }
}

impl<T, E> HttpStatusCode for std::result::Result<T, E>
where
    E: HttpStatusCode,
{
    fn status_code(&self) -> Option<StatusCode> {
        self.as_ref().err().and_then(|e| e.status_code())
    }
}

/// `ClusterApi` backed by a kube client.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Creates a client from `--kubeconfig`, else from the default kubeconfig, else from the
    /// output of `microk8s config`. The configured context is used when the kubeconfig has it.
    pub async fn from_settings<R>(settings: &Settings, runner: &R) -> Result<Self>
    where
        R: CommandRunner,
    {
        let kubeconfig = match &settings.kubeconfig {
            Some(path) => Kubeconfig::read_from(path).context(error::KubeconfigSnafu)?,
            None => match Kubeconfig::read() {
                Ok(kubeconfig) => kubeconfig,
                Err(e) => {
                    debug!("No default kubeconfig ({}), asking microk8s", e);
                    let output = runner
                        .run(&Cmd::new(&settings.microk8s).arg("config"))
                        .await?;
                    Kubeconfig::from_yaml(&output.stdout).context(error::KubeconfigSnafu)?
                }
            },
        };
        let context = kubeconfig
            .contexts
            .iter()
            .any(|context| context.name == settings.kube_context)
            .then(|| settings.kube_context.clone());
        let config = Config::from_custom_kubeconfig(
            kubeconfig,
            &KubeConfigOptions {
                context,
                ..Default::default()
            },
        )
        .await
        .context(error::KubeconfigSnafu)?;
        Ok(Self::new(
            Client::try_from(config).context(error::ClientCreateSnafu)?,
        ))
    }

    fn config_maps(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn certificate_requests(&self) -> Result<Vec<CertificateRequest>> {
        let api: Api<CertificateSigningRequest> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .context(error::KubeSnafu {
                action: "list certificate signing requests",
            })?;
        Ok(list.items.iter().map(CertificateRequest::from_k8s).collect())
    }

    async fn approve_certificate_request(&self, name: &str) -> Result<()> {
        let api: Api<CertificateSigningRequest> = Api::all(self.client.clone());
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let approval = json!({
            "status": {
                "conditions": [{
                    "type": "Approved",
                    "status": "True",
                    "reason": "KapparmorE2EApprove",
                    "message": "Approved for the node address used by the end-to-end tests",
                    "lastUpdateTime": now,
                }]
            }
        });
        api.patch_subresource(
            "approval",
            name,
            &PatchParams::default(),
            &Patch::Merge(&approval),
        )
        .await
        .context(error::KubeSnafu {
            action: format!("approve certificate signing request '{}'", name),
        })?;
        Ok(())
    }

    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<()> {
        let name = config_map
            .metadata
            .name
            .as_deref()
            .context(error::ManifestSnafu {
                reason: "the ConfigMap has no name",
            })?;
        let namespace = config_map
            .metadata
            .namespace
            .as_deref()
            .context(error::ManifestSnafu {
                reason: "the ConfigMap has no namespace",
            })?;
        let mut config_map = config_map.clone();
        config_map.metadata.managed_fields = None;
        config_map.metadata.resource_version = None;
        let mut body = serde_json::to_value(&config_map).context(error::JsonSnafu {
            action: "serialize ConfigMap",
        })?;
        // Apply patches must carry the type information.
        body["apiVersion"] = json!("v1");
        body["kind"] = json!("ConfigMap");
        self.config_maps(namespace)
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&body),
            )
            .await
            .context(error::KubeSnafu {
                action: format!("apply ConfigMap '{}/{}'", namespace, name),
            })?;
        Ok(())
    }

    async fn clear_config_map(&self, namespace: &str, name: &str) -> Result<bool> {
        let result = self
            .config_maps(namespace)
            .patch(
                name,
                &PatchParams::default(),
                &Patch::Merge(json!({ "data": null })),
            )
            .await;
        if result.is_status_code(StatusCode::NOT_FOUND) {
            info!("ConfigMap '{}/{}' does not exist, nothing to clear", namespace, name);
            return Ok(false);
        }
        result.context(error::KubeSnafu {
            action: format!("clear ConfigMap '{}/{}'", namespace, name),
        })?;
        Ok(true)
    }

    async fn remove_config_map_key(&self, namespace: &str, name: &str, key: &str) -> Result<()> {
        let patch: json_patch::Patch = serde_json::from_value(json!([
            { "op": "remove", "path": format!("/data/{}", escape_json_pointer(key)) }
        ]))
        .context(error::JsonSnafu {
            action: "build JSON patch",
        })?;
        self.config_maps(namespace)
            .patch(name, &PatchParams::default(), &Patch::Json::<()>(patch))
            .await
            .context(error::KubeSnafu {
                action: format!("remove '{}' from ConfigMap '{}/{}'", key, namespace, name),
            })?;
        Ok(())
    }

    async fn config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        self.config_maps(namespace)
            .get_opt(name)
            .await
            .context(error::KubeSnafu {
                action: format!("get ConfigMap '{}/{}'", namespace, name),
            })
    }

    async fn services(&self, namespace: &str) -> Result<Vec<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .list(&ListParams::default())
            .await
            .context(error::KubeSnafu {
                action: format!("list services in '{}'", namespace),
            })?
            .items)
    }

    async fn pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .list(&ListParams::default().labels(selector))
            .await
            .context(error::KubeSnafu {
                action: format!("list pods '{}' in '{}'", selector, namespace),
            })?
            .items)
    }

    async fn logs(&self, namespace: &str, selector: &str, tail_lines: i64) -> Result<String> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut combined = String::new();
        for pod in self.pods(namespace, selector).await? {
            let name = pod.metadata.name.unwrap_or_default();
            let params = LogParams {
                tail_lines: Some(tail_lines),
                ..Default::default()
            };
            let logs = api.logs(&name, &params).await.context(error::KubeSnafu {
                action: format!("get logs of pod '{}/{}'", namespace, name),
            })?;
            for line in logs.lines() {
                combined.push_str(&format!("[pod/{}] {}\n", name, line));
            }
        }
        Ok(combined)
    }

    async fn daemon_set(&self, namespace: &str, name: &str) -> Result<Option<DaemonSet>> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await.context(error::KubeSnafu {
            action: format!("get DaemonSet '{}/{}'", namespace, name),
        })
    }

    async fn ensure_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let result = api.create(&PostParams::default(), &namespace).await;
        if result.is_status_code(StatusCode::CONFLICT) {
            debug!("Namespace '{}' already exists", name);
            return Ok(());
        }
        result.context(error::KubeSnafu {
            action: format!("create namespace '{}'", name),
        })?;
        Ok(())
    }
}

/// Escapes a ConfigMap key for use as a JSON pointer segment (RFC 6901).
pub fn escape_json_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

/// `true` once every desired pod of the DaemonSet runs the current template and is available,
/// mirroring `kubectl rollout status`.
pub fn daemonset_rolled_out(daemon_set: &DaemonSet) -> bool {
    let status = match &daemon_set.status {
        Some(status) => status,
        None => return false,
    };
    let generation = daemon_set.metadata.generation.unwrap_or_default();
    if status.observed_generation.unwrap_or_default() < generation {
        return false;
    }
    let desired = status.desired_number_scheduled;
    status.updated_number_scheduled.unwrap_or_default() >= desired
        && status.number_available.unwrap_or_default() >= desired
}

/// The name and phase of each pod, for log output.
pub fn pod_summaries(pods: &[Pod]) -> Vec<String> {
    pods.iter()
        .map(|pod| {
            let status = pod.status.as_ref();
            format!(
                "{} phase={} node={} ip={}",
                pod.metadata.name.as_deref().unwrap_or("<unnamed>"),
                status.and_then(|s| s.phase.as_deref()).unwrap_or("Unknown"),
                pod.spec
                    .as_ref()
                    .and_then(|spec| spec.node_name.as_deref())
                    .unwrap_or("-"),
                status.and_then(|s| s.pod_ip.as_deref()).unwrap_or("-"),
            )
        })
        .collect()
}

/// The name of the first running pod, else of the first pod.
pub fn pick_pod(pods: &[Pod]) -> Option<String> {
    pods.iter()
        .find(|pod| {
            pod.status.as_ref().and_then(|status| status.phase.as_deref()) == Some("Running")
        })
        .or_else(|| pods.first())
        .and_then(|pod| pod.metadata.name.clone())
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use e2e_model::constants::{LOG_MARKER, PROFILES_CONFIG_MAP};
    use e2e_model::Operation;
    use k8s_openapi::api::apps::v1::DaemonSetStatus;
    use k8s_openapi::api::core::v1::PodStatus;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    /// The cluster as seen through the mock. Profile ConfigMap changes are reconciled the way the
    /// controller does it: counters per operation and profile, a log line per reconciliation.
    #[derive(Default)]
    pub(crate) struct FakeState {
        pub(crate) certificate_requests: Vec<CertificateRequest>,
        pub(crate) approved: Vec<String>,
        pub(crate) config_maps: BTreeMap<(String, String), ConfigMap>,
        pub(crate) services: Vec<Service>,
        pub(crate) pods: Vec<Pod>,
        pub(crate) log_lines: Vec<String>,
        pub(crate) daemon_set: Option<DaemonSet>,
        pub(crate) namespaces: Vec<String>,
        pub(crate) counters: BTreeMap<(Operation, String), f64>,
        /// When set, profile changes are not reconciled.
        pub(crate) controller_stalled: bool,
        pub(crate) fail_applies: bool,
    }

    impl FakeState {
        pub(crate) fn managed_profiles(&self) -> usize {
            self.config_maps
                .iter()
                .filter(|((_, name), _)| name == PROFILES_CONFIG_MAP)
                .map(|(_, config_map)| config_map.data.as_ref().map(|d| d.len()).unwrap_or(0))
                .sum()
        }

        fn reconcile(&mut self, before: BTreeMap<String, String>, after: &BTreeMap<String, String>) {
            if self.controller_stalled {
                return;
            }
            for (name, body) in after {
                match before.get(name) {
                    None => *self.counters.entry((Operation::Create, name.clone())).or_default() += 1.0,
                    Some(old) if old != body => {
                        *self.counters.entry((Operation::Modify, name.clone())).or_default() += 1.0
                    }
                    Some(_) => {}
                }
            }
            for name in before.keys().filter(|name| !after.contains_key(*name)) {
                *self.counters.entry((Operation::Delete, name.clone())).or_default() += 1.0;
            }
            let names: Vec<&str> = after.keys().map(String::as_str).collect();
            self.log_lines.push(format!(
                "level=INFO msg=\"{}\" profiles=[{}]",
                LOG_MARKER,
                names.join(" ")
            ));
        }

        pub(crate) fn replace_data(
            &mut self,
            namespace: &str,
            name: &str,
            data: Option<BTreeMap<String, String>>,
        ) {
            let key = (namespace.to_string(), name.to_string());
            let before = self
                .config_maps
                .get(&key)
                .and_then(|config_map| config_map.data.clone())
                .unwrap_or_default();
            let after = data.clone().unwrap_or_default();
            let config_map = self.config_maps.entry(key).or_insert_with(|| ConfigMap {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            });
            config_map.data = data;
            if name == PROFILES_CONFIG_MAP {
                self.reconcile(before, &after);
            }
        }
    }

    #[derive(Default, Clone)]
    pub(crate) struct MockCluster {
        pub(crate) state: Arc<Mutex<FakeState>>,
    }

    fn not_found() -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        })
    }

    #[async_trait]
    impl ClusterApi for MockCluster {
        async fn certificate_requests(&self) -> Result<Vec<CertificateRequest>> {
            Ok(self.state.lock().unwrap().certificate_requests.clone())
        }

        async fn approve_certificate_request(&self, name: &str) -> Result<()> {
            self.state.lock().unwrap().approved.push(name.to_string());
            Ok(())
        }

        async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.fail_applies {
                return Err(not_found()).context(error::KubeSnafu {
                    action: "apply ConfigMap",
                });
            }
            state.replace_data(
                config_map.metadata.namespace.as_deref().unwrap_or_default(),
                config_map.metadata.name.as_deref().unwrap_or_default(),
                config_map.data.clone(),
            );
            Ok(())
        }

        async fn clear_config_map(&self, namespace: &str, name: &str) -> Result<bool> {
            let mut state = self.state.lock().unwrap();
            if !state
                .config_maps
                .contains_key(&(namespace.to_string(), name.to_string()))
            {
                return Ok(false);
            }
            state.replace_data(namespace, name, None);
            Ok(true)
        }

        async fn remove_config_map_key(&self, namespace: &str, name: &str, key: &str) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            let mut data = state
                .config_maps
                .get(&(namespace.to_string(), name.to_string()))
                .and_then(|config_map| config_map.data.clone())
                .unwrap_or_default();
            if data.remove(key).is_none() {
                return Err(not_found()).context(error::KubeSnafu {
                    action: "remove ConfigMap key",
                });
            }
            state.replace_data(namespace, name, Some(data));
            Ok(())
        }

        async fn config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .config_maps
                .get(&(namespace.to_string(), name.to_string()))
                .cloned())
        }

        async fn services(&self, _namespace: &str) -> Result<Vec<Service>> {
            Ok(self.state.lock().unwrap().services.clone())
        }

        async fn pods(&self, _namespace: &str, _selector: &str) -> Result<Vec<Pod>> {
            Ok(self.state.lock().unwrap().pods.clone())
        }

        async fn logs(&self, _namespace: &str, _selector: &str, tail_lines: i64) -> Result<String> {
            let state = self.state.lock().unwrap();
            let skip = state.log_lines.len().saturating_sub(tail_lines as usize);
            Ok(state
                .log_lines
                .iter()
                .skip(skip)
                .map(|line| format!("[pod/kapparmor-abcde] {}\n", line))
                .collect())
        }

        async fn daemon_set(&self, _namespace: &str, _name: &str) -> Result<Option<DaemonSet>> {
            Ok(self.state.lock().unwrap().daemon_set.clone())
        }

        async fn ensure_namespace(&self, name: &str) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if !state.namespaces.iter().any(|namespace| namespace == name) {
                state.namespaces.push(name.to_string());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn fake_controller_counts_operations() {
        let cluster = MockCluster::default();
        let config_map = |data: &[(&str, &str)]| ConfigMap {
            metadata: ObjectMeta {
                name: Some(PROFILES_CONFIG_MAP.to_string()),
                namespace: Some("security".to_string()),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        };
        cluster.apply_config_map(&config_map(&[("custom.a", "1")])).await.unwrap();
        cluster.apply_config_map(&config_map(&[("custom.a", "2")])).await.unwrap();
        cluster
            .remove_config_map_key("security", PROFILES_CONFIG_MAP, "custom.a")
            .await
            .unwrap();
        let state = cluster.state.lock().unwrap();
        for operation in [Operation::Create, Operation::Modify, Operation::Delete] {
            assert_eq!(state.counters[&(operation, "custom.a".to_string())], 1.0);
        }
        assert_eq!(state.managed_profiles(), 0);
        assert_eq!(
            state.log_lines.last().unwrap(),
            "level=INFO msg=\"retrieving profiles\" profiles=[]"
        );
    }

    fn daemon_set(
        generation: i64,
        observed: i64,
        desired: i32,
        updated: i32,
        available: i32,
    ) -> DaemonSet {
        DaemonSet {
            metadata: ObjectMeta {
                generation: Some(generation),
                ..Default::default()
            },
            status: Some(DaemonSetStatus {
                observed_generation: Some(observed),
                desired_number_scheduled: desired,
                updated_number_scheduled: Some(updated),
                number_available: Some(available),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pod(name: &str, phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn rollout_status() {
        assert!(daemonset_rolled_out(&daemon_set(2, 2, 1, 1, 1)));
        assert!(!daemonset_rolled_out(&daemon_set(3, 2, 1, 1, 1)));
        assert!(!daemonset_rolled_out(&daemon_set(2, 2, 1, 0, 1)));
        assert!(!daemonset_rolled_out(&daemon_set(2, 2, 1, 1, 0)));
        assert!(!daemonset_rolled_out(&DaemonSet::default()));
    }

    #[test]
    fn json_pointer_escaping() {
        assert_eq!(escape_json_pointer("custom.p"), "custom.p");
        assert_eq!(escape_json_pointer("a/b~c"), "a~1b~0c");
    }

    #[test]
    fn running_pod_preferred() {
        let pods = vec![pod("kapparmor-a", "Pending"), pod("kapparmor-b", "Running")];
        assert_eq!(pick_pod(&pods).as_deref(), Some("kapparmor-b"));
        assert_eq!(pick_pod(&pods[..1]).as_deref(), Some("kapparmor-a"));
        assert_eq!(pick_pod(&[]), None);
        assert_eq!(
            pod_summaries(&pods[..1]),
            vec!["kapparmor-a phase=Pending node=- ip=-".to_string()]
        );
    }
}
