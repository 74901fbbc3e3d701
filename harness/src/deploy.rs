use crate::cluster::{daemonset_rolled_out, pod_summaries, ClusterApi};
use crate::error::{self, Result};
use crate::exec::{Cmd, CommandRunner};
use crate::poll::poll_until;
use crate::run_log::section;
use chrono::{DateTime, Utc};
use e2e_model::constants::HELM_KUBE_VERSION;
use e2e_model::Settings;
use log::{info, warn};
use snafu::ResultExt;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

/// The source revision and build time stamped into the image and the pod annotations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    pub git_sha: String,
    pub build_time: String,
}

impl Provenance {
    pub async fn capture<R>(runner: &R, now: DateTime<Utc>) -> Self
    where
        R: CommandRunner,
    {
        let git_sha = match runner
            .run(&Cmd::new("git").args(["rev-parse", "--short=12", "HEAD"]))
            .await
        {
            Ok(output) => output.stdout.trim().to_string(),
            Err(e) => {
                warn!("Unable to determine the git commit: {}", e);
                "unknown".to_string()
            }
        };
        Self {
            git_sha,
            build_time: now.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployRequest {
    pub version: String,
    pub chart: PathBuf,
    pub namespace: String,
    /// Build the image locally and import it into the MicroK8s containerd instead of pulling it.
    pub sideload: bool,
    pub skip_build: bool,
    pub provenance: Provenance,
}

impl DeployRequest {
    pub fn pull_policy(&self) -> &'static str {
        if self.sideload {
            "IfNotPresent"
        } else {
            "Always"
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum HelmPhase {
    DryRun,
    Install,
}

/// The `helm upgrade --install` command line for `phase`.
pub fn helm_upgrade(settings: &Settings, request: &DeployRequest, phase: HelmPhase) -> Cmd {
    let mut cmd = Cmd::new("helm")
        .arg("upgrade")
        .arg(&settings.release_name)
        .arg("--install");
    cmd = match phase {
        HelmPhase::DryRun => cmd.args([
            "--create-namespace",
            "--debug",
            "--devel",
            "--dry-run",
            "--kube-version",
            HELM_KUBE_VERSION,
        ]),
        HelmPhase::Install => cmd
            .args(["--cleanup-on-fail", "--create-namespace", "--devel"])
            .timeout(settings.timeouts.helm),
    };
    let values = [
        ("image.pullPolicy", request.pull_policy().to_string()),
        ("image.tag", format!("{}-dev", request.version)),
        ("podAnnotations.gitCommit", request.provenance.git_sha.clone()),
        ("podAnnotations.build-time", request.provenance.build_time.clone()),
        ("service.enabled", "true".to_string()),
        ("serviceMonitor.enabled", "true".to_string()),
        ("serviceMonitor.labels.release", settings.release_name.clone()),
    ];
    cmd = cmd.arg("--namespace").arg(&request.namespace);
    for (key, value) in values {
        cmd = cmd.arg("--set").arg(format!("{}={}", key, value));
    }
    cmd.arg(request.chart.to_string_lossy())
}

/// Installs the controller chart and waits until its DaemonSet has rolled out.
pub struct Deployer<'a, R, C>
where
    R: CommandRunner,
    C: ClusterApi,
{
    settings: &'a Settings,
    runner: &'a R,
    cluster: &'a C,
}

impl<'a, R, C> Deployer<'a, R, C>
where
    R: CommandRunner,
    C: ClusterApi,
{
    pub fn new(settings: &'a Settings, runner: &'a R, cluster: &'a C) -> Self {
        Self {
            settings,
            runner,
            cluster,
        }
    }

    pub async fn deploy(&self, request: &DeployRequest) -> Result<()> {
        if request.sideload && !request.skip_build {
            self.build_and_sideload(request).await?;
        } else if !request.skip_build {
            warn!("Registry push is not performed, the cluster must be able to pull the image");
        }

        section("Deploying Kapparmor");
        info!(
            "Using imagePullPolicy: {} (sideload={})",
            request.pull_policy(),
            request.sideload
        );
        info!("Running helm dry-run...");
        let dry_run = helm_upgrade(self.settings, request, HelmPhase::DryRun);
        if let Err(e) = self.runner.run(&dry_run).await {
            warn!("Helm dry-run failed: {}", e);
        }

        info!("Deploying...");
        let install = helm_upgrade(self.settings, request, HelmPhase::Install);
        let output = self.runner.run(&install).await?;
        info!("{}", output.stdout.trim_end());

        info!("Waiting for rollout...");
        self.wait_for_rollout(&request.namespace).await?;
        info!("Kapparmor deployed successfully");

        match self
            .cluster
            .pods(&request.namespace, &self.settings.label_selector)
            .await
        {
            Ok(pods) => {
                for summary in pod_summaries(&pods) {
                    info!("{}", summary);
                }
            }
            Err(e) => warn!("Unable to list the controller pods: {}", e),
        }
        Ok(())
    }

    /// Builds the image unless it exists locally and imports it into the cluster runtime.
    pub async fn build_and_sideload(&self, request: &DeployRequest) -> Result<()> {
        section("Building and side-loading image");
        let image = format!(
            "{}:{}-dev",
            self.settings.image_repository, request.version
        );
        let inspect = Cmd::new("docker").args(["image", "inspect"]).arg(&image);
        let exists = matches!(self.runner.output(&inspect).await, Ok(output) if output.success());
        if exists {
            info!("Image exists: {}", image);
        } else {
            info!("Building image {}...", image);
            let build = Cmd::new("docker")
                .args(["build", "-t"])
                .arg(&image)
                .arg("--build-arg")
                .arg(format!("GIT_SHA={}", request.provenance.git_sha))
                .arg("--build-arg")
                .arg(format!("BUILD_TIME={}", request.provenance.build_time))
                .args(["-f", "Dockerfile", "."])
                .timeout(self.settings.timeouts.image_build);
            self.runner.run(&build).await?;
        }

        info!("Side-loading image to MicroK8s...");
        let dir = tempfile::tempdir().context(error::IoSnafu {
            action: "create a directory for the image archive",
        })?;
        let archive = dir.path().join("kapparmor-image.tar");
        self.save_image(&image, &archive).await?;
        let import = Cmd::new(&self.settings.microk8s)
            .args(["ctr", "image", "import"])
            .arg(archive.to_string_lossy())
            .timeout(self.settings.timeouts.image_build);
        self.runner.run(&import).await?;
        info!("Image side-loaded");
        Ok(())
    }

    async fn save_image(&self, image: &str, archive: &Path) -> Result<()> {
        let save = Cmd::new("docker")
            .args(["save", "-o"])
            .arg(archive.to_string_lossy())
            .arg(image)
            .timeout(self.settings.timeouts.image_build);
        self.runner.run(&save).await?;
        Ok(())
    }

    /// Polls the DaemonSet until every desired pod runs the current template.
    pub async fn wait_for_rollout(&self, namespace: &str) -> Result<()> {
        let name = &self.settings.daemonset_name;
        let policy = self.settings.timeouts.rollout;
        let cluster = self.cluster;
        let result = poll_until(&policy, move || async move {
            match cluster.daemon_set(namespace, name).await {
                Ok(Some(daemon_set)) if daemonset_rolled_out(&daemon_set) => {
                    ControlFlow::Break(())
                }
                Ok(Some(_)) => ControlFlow::Continue(None),
                Ok(None) => ControlFlow::Continue(Some(format!(
                    "DaemonSet '{}/{}' does not exist",
                    namespace, name
                ))),
                Err(e) => ControlFlow::Continue(Some(e.to_string())),
            }
        })
        .await;
        match result {
            Ok((_, elapsed)) => {
                info!(
                    "daemon set \"{}\" successfully rolled out after {:.0}s",
                    name,
                    elapsed.as_secs_f64()
                );
                Ok(())
            }
            Err(exhausted) => {
                if let Some(Some(reason)) = exhausted.last {
                    warn!("Last rollout check: {}", reason);
                }
                error::RolloutTimeoutSnafu {
                    workload: format!("daemonset/{}", name),
                    timeout: policy.deadline,
                }
                .fail()
            }
        }
    }
}
