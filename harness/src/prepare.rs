use crate::address::resolve_node_address;
use crate::cluster::ClusterApi;
use crate::error::{self, Result};
use crate::exec::{program_on_path, Cmd, CommandRunner};
use crate::run_log::section;
use e2e_model::{NetworkConfig, Settings};
use lazy_static::lazy_static;
use log::{info, warn};
use regex::Regex;
use snafu::ensure;
use std::net::IpAddr;

const NOT_RUNNING_REGEX: &str = r"(?i)(not running|stopped)";

lazy_static! {
    static ref NOT_RUNNING: Regex = {
        #[allow(clippy::unwrap_used)]
        Regex::new(NOT_RUNNING_REGEX).unwrap()
    };
}

/// What a preparation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrepareReport {
    pub node_ip: Option<IpAddr>,
    /// `true` when the MicroK8s launch configuration was rewritten and the snap restarted.
    pub network_changed: bool,
    pub approved: Vec<String>,
    pub skipped: Vec<String>,
    pub context: Option<String>,
}

/// Brings a shared MicroK8s host into the state the tests need. Running it again on a host that
/// is already prepared changes nothing.
pub struct EnvironmentPreparer<'a, R, C>
where
    R: CommandRunner,
    C: ClusterApi,
{
    settings: &'a Settings,
    runner: &'a R,
    cluster: &'a C,
    snap: Vec<String>,
}

impl<'a, R, C> EnvironmentPreparer<'a, R, C>
where
    R: CommandRunner,
    C: ClusterApi,
{
    pub fn new(settings: &'a Settings, runner: &'a R, cluster: &'a C) -> Self {
        let snap = if program_on_path("sudo") {
            vec!["sudo".to_string(), "snap".to_string()]
        } else {
            vec!["snap".to_string()]
        };
        Self {
            settings,
            runner,
            cluster,
            snap,
        }
    }

    /// Replaces the command prefix used to run `snap`.
    pub fn snap_command(mut self, snap: Vec<String>) -> Self {
        self.snap = snap;
        self
    }

    pub async fn prepare(&self) -> Result<PrepareReport> {
        section("Checking prerequisites");
        self.check_ready().await?;
        info!("MicroK8s is running");

        let node_ip = resolve_node_address(self.settings, self.runner).await?;
        let network_changed = self.ensure_networking(node_ip).await?;
        let (approved, skipped) = self.approve_certificate_requests(node_ip).await;
        let context = self.ensure_context().await;

        Ok(PrepareReport {
            node_ip: Some(node_ip),
            network_changed,
            approved,
            skipped,
            context,
        })
    }

    async fn check_ready(&self) -> Result<()> {
        let timeout = self.settings.timeouts.cluster_ready;
        let cmd = Cmd::new(&self.settings.microk8s)
            .args(["status", "--wait-ready", "--format", "short", "--timeout"])
            .arg(timeout.as_secs().to_string())
            .timeout(timeout * 2);
        let output = match self.runner.output(&cmd).await {
            Ok(output) => output,
            Err(e) => {
                return error::ClusterNotReadySnafu {
                    reason: e.to_string(),
                }
                .fail()
            }
        };
        let text = format!("{}\n{}", output.stdout, output.stderr);
        ensure!(
            !NOT_RUNNING.is_match(&text),
            error::ClusterNotReadySnafu {
                reason: "MicroK8s is not running",
            }
        );
        ensure!(
            output.success(),
            error::ClusterNotReadySnafu {
                reason: format!("'{}' exited with {:?}: {}", cmd, output.code, text.trim()),
            }
        );
        Ok(())
    }

    /// Pins the kubelet and the API server to `node_ip`. Returns `true` if the configuration had
    /// to be changed.
    pub async fn ensure_networking(&self, node_ip: IpAddr) -> Result<bool> {
        section("Ensuring MicroK8s uses the correct interface");
        let _ = self
            .runner
            .output(&Cmd::new(&self.settings.microk8s).args(["disable", "host-access"]))
            .await;

        let desired = NetworkConfig::new(node_ip);
        let current = match self
            .runner
            .output(&Cmd::from_prefix(&self.snap).args(["get", "microk8s", "config"]))
            .await
        {
            Ok(output) if output.success() => output.stdout,
            _ => String::new(),
        };
        if desired.is_applied(&current) {
            info!("MicroK8s config already pinned to {}", node_ip);
            return Ok(false);
        }

        info!("Updating MicroK8s config to pin to {}", node_ip);
        let set = Cmd::from_prefix(&self.snap)
            .args(["set", "microk8s"])
            .arg(format!("config={}", desired.render()));
        if let Err(e) = self.runner.run(&set).await {
            warn!("Unable to set the MicroK8s config: {}", e);
        }
        info!("Restarting MicroK8s...");
        if let Err(e) = self
            .runner
            .run(&Cmd::from_prefix(&self.snap).args(["restart", "microk8s"]))
            .await
        {
            warn!("Unable to restart MicroK8s: {}", e);
        }
        let wait = Cmd::new(&self.settings.microk8s)
            .args(["status", "--wait-ready"])
            .timeout(self.settings.timeouts.command);
        if let Err(e) = self.runner.run(&wait).await {
            return error::ClusterNotReadySnafu {
                reason: format!("MicroK8s did not come back after the restart: {}", e),
            }
            .fail();
        }
        let nodes = Cmd::from_prefix(&self.settings.kubectl).args(["get", "nodes", "-o", "wide"]);
        if let Ok(output) = self.runner.output(&nodes).await {
            info!("Nodes:\n{}", output.stdout.trim_end());
        }
        info!("Pinned to {}", node_ip);
        Ok(true)
    }

    /// Approves the pending kubelet serving certificate requests naming `node_ip`. Returns the
    /// names of the approved and of the skipped requests.
    pub async fn approve_certificate_requests(
        &self,
        node_ip: IpAddr,
    ) -> (Vec<String>, Vec<String>) {
        section(&format!(
            "Approving kubelet-serving CSRs (expect SAN IP={})",
            node_ip
        ));
        let mut approved = Vec::new();
        let mut skipped = Vec::new();
        let requests = match self.cluster.certificate_requests().await {
            Ok(requests) => requests,
            Err(e) => {
                warn!("Could not fetch CSRs: {}", e);
                return (approved, skipped);
            }
        };
        let pending: Vec<_> = requests
            .into_iter()
            .filter(|request| request.pending && request.is_kubelet_serving())
            .collect();
        if pending.is_empty() {
            info!("No pending kubelet-serving CSRs found.");
            return (approved, skipped);
        }
        for request in pending {
            if !request.is_eligible(node_ip) {
                info!(
                    "Skipping {} (SAN does not match {})",
                    request.name, node_ip
                );
                skipped.push(request.name);
                continue;
            }
            info!("Approving {}", request.name);
            match self.cluster.approve_certificate_request(&request.name).await {
                Ok(()) => approved.push(request.name),
                Err(e) => {
                    warn!("Unable to approve {}: {}", request.name, e);
                    skipped.push(request.name);
                }
            }
        }
        if !approved.is_empty() {
            info!("CSRs approved: {}", approved.join(", "));
        }
        (approved, skipped)
    }

    /// Makes the configured context current for kubectl. Returns the context in use.
    async fn ensure_context(&self) -> Option<String> {
        let current = self.current_context().await;
        if current.as_deref() != Some(self.settings.kube_context.as_str()) {
            let use_context = Cmd::from_prefix(&self.settings.kubectl)
                .args(["config", "use-context"])
                .arg(&self.settings.kube_context);
            if let Err(e) = self.runner.run(&use_context).await {
                warn!(
                    "Unable to switch to context '{}': {}",
                    self.settings.kube_context, e
                );
            }
        }
        let context = self.current_context().await;
        match &context {
            Some(context) => info!("Using context: {}", context),
            None => warn!("Unable to determine the current kubectl context"),
        }
        context
    }

    async fn current_context(&self) -> Option<String> {
        let cmd = Cmd::from_prefix(&self.settings.kubectl).args(["config", "current-context"]);
        match self.runner.output(&cmd).await {
            Ok(output) if output.success() && !output.stdout.trim().is_empty() => {
                Some(output.stdout.trim().to_string())
            }
            _ => None,
        }
    }
}
