use crate::cluster::{pod_summaries, ClusterApi};
use crate::discovery::discover_aggregator;
use crate::error::{self, Result};
use crate::exposition;
use crate::logwait::{show_logs, wait_for_log};
use crate::mutator::ConfigMutator;
use crate::promql::{scrape_targets, series, PrometheusClient, PrometheusSource};
use crate::run_log::{self, section};
use crate::scrape::PodMetricsSource;
use crate::tunnel::{with_tunnel, TunnelOptions, TunnelTarget};
use crate::verifier::MetricsVerifier;
use chrono::Utc;
use e2e_model::constants::{EMPTY_PROFILES_MARKER, LABEL_OPERATION, LABEL_PROFILE_NAME};
use e2e_model::profile::{render_profile, unique_profile_name};
use e2e_model::{MetricNames, Operation, ProfileConfig, Settings};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_plain::{derive_display_from_serialize, derive_fromstr_from_deserialize};

/// Which scenarios a run executes.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Selection {
    #[default]
    All,
    /// Profile management.
    Case1,
    /// Profile in use.
    Case2,
    /// Metrics.
    Case3,
}

derive_display_from_serialize!(Selection);
derive_fromstr_from_deserialize!(Selection);

impl Selection {
    pub fn includes(&self, case: Selection) -> bool {
        *self == Selection::All || *self == case
    }
}

/// Passed and failed checks of a run.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct Tally {
    pub passed: u32,
    pub failed: u32,
}

impl Tally {
    pub fn total(&self) -> u32 {
        self.passed + self.failed
    }

    /// `0` if nothing failed, `1` otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.failed == 0 {
            0
        } else {
            1
        }
    }

    pub fn pass(&mut self, message: &str) {
        run_log::pass(message);
        self.passed += 1;
    }

    pub fn fail(&mut self, message: &str) {
        run_log::fail(message);
        self.failed += 1;
    }

    pub fn record(&mut self, passed: bool, message: &str) {
        if passed {
            self.pass(message)
        } else {
            self.fail(message)
        }
    }
}

/// Runs the scenarios against a deployed controller and keeps the tally.
pub struct TestSuite<'a, C>
where
    C: ClusterApi,
{
    settings: &'a Settings,
    cluster: &'a C,
    tally: Tally,
}

impl<'a, C> TestSuite<'a, C>
where
    C: ClusterApi,
{
    pub fn new(settings: &'a Settings, cluster: &'a C) -> Self {
        Self {
            settings,
            cluster,
            tally: Tally::default(),
        }
    }

    pub fn tally(&self) -> Tally {
        self.tally
    }

    /// Runs the selected scenarios followed by the final status check and the summary.
    pub async fn run(&mut self, selection: Selection) -> Tally {
        delay(self.settings).await;
        show_logs(self.cluster, self.settings, 20).await;
        if selection.includes(Selection::Case1) {
            self.profile_management().await;
        }
        if selection.includes(Selection::Case2) {
            self.profile_in_use().await;
        }
        if selection.includes(Selection::Case3) {
            self.metrics().await;
        }
        self.final_status_check().await;
        self.summary();
        self.tally
    }

    /// Empty profile set, one profile, the same profile edited. Each step must show up in the
    /// latest reconciliation log line.
    pub async fn profile_management(&mut self) {
        section("TEST CASE 1: Profile Management");
        let settings = self.settings;
        let namespace = &settings.target_namespace;
        let expected = &settings.expected_profile;
        let mutator = ConfigMutator::new(settings, self.cluster);

        run_log::test("Apply EMPTY ConfigMap");
        if !mutator.apply(&settings.fixtures.empty, namespace, true).await {
            self.tally.fail("Empty ConfigMap apply");
            return;
        }
        self.tally.pass("Empty ConfigMap applied");
        delay(settings).await;
        let found = wait_for_log(
            self.cluster,
            settings,
            EMPTY_PROFILES_MARKER,
            settings.timeouts.empty_profiles_log,
        )
        .await;
        if found {
            self.tally.pass("Profiles list empty");
        } else {
            self.tally.fail("Profiles list should be empty");
        }

        run_log::test("Apply ONE-PROFILE ConfigMap");
        if !mutator.apply(&settings.fixtures.one_profile, namespace, false).await {
            self.tally.fail("One-profile ConfigMap apply");
            return;
        }
        self.tally.pass("One-profile ConfigMap applied");
        delay(settings).await;
        if wait_for_log(self.cluster, settings, expected, settings.timeouts.profile_log).await {
            self.tally.pass(&format!("Profile '{}' synced", expected));
        } else {
            self.tally.fail(&format!("Profile '{}' not found", expected));
        }

        run_log::test("Apply EDITED ConfigMap");
        if !mutator.apply(&settings.fixtures.edited, namespace, false).await {
            self.tally.fail("Edited ConfigMap apply");
            return;
        }
        self.tally.pass("Edited ConfigMap applied");
        delay(settings).await;
        if wait_for_log(self.cluster, settings, expected, settings.timeouts.profile_log).await {
            self.tally
                .pass(&format!("Profile '{}' detected after edit", expected));
        } else {
            self.tally
                .fail(&format!("Profile '{}' not found after edit", expected));
        }
    }

    /// The profiles ConfigMap can be read while workloads in the test namespace exist.
    pub async fn profile_in_use(&mut self) {
        section("TEST CASE 2: Profile In-Use");
        let settings = self.settings;
        if let Err(e) = self.cluster.ensure_namespace(&settings.test_namespace).await {
            warn!(
                "Unable to create namespace '{}': {}",
                settings.test_namespace, e
            );
        }

        run_log::test("Read back profiles ConfigMap");
        let config_map = self
            .cluster
            .config_map(&settings.target_namespace, &settings.profiles_config_map)
            .await;
        match config_map {
            Ok(Some(config_map)) => {
                self.tally.pass("ConfigMap retrieved");
                info!(
                    "Profiles: [{}]",
                    ProfileConfig::from_config_map(&config_map)
                        .names()
                        .collect::<Vec<_>>()
                        .join(" ")
                );
                show_logs(self.cluster, settings, 30).await;
            }
            Ok(None) => self.tally.fail("ConfigMap not found"),
            Err(e) => self.tally.fail(&format!("ConfigMap not found: {}", e)),
        }
    }

    /// Create, modify and delete a fresh profile and check the counter and gauge deltas, through
    /// Prometheus when it is usable and through the pod endpoint otherwise.
    pub async fn metrics(&mut self) {
        section("TEST CASE 3: Prometheus Metrics");
        let settings = self.settings;
        let cluster = self.cluster;
        let fallback = match PodMetricsSource::new(settings, cluster) {
            Ok(fallback) => fallback,
            Err(e) => {
                self.tally.fail(&format!("Unable to set up the pod metrics check: {}", e));
                return;
            }
        };

        let tally = &mut self.tally;
        if let Err(e) = via_prometheus(settings, cluster, &fallback, tally).await {
            info!("Prometheus path skipped/fallback: {}", e);
            fallback_only(settings, cluster, &fallback, tally).await;
        }
        log_available_metrics(settings, cluster, &fallback).await;
    }

    pub async fn final_status_check(&self) {
        section("Final Status Check");
        match self
            .cluster
            .pods(&self.settings.target_namespace, &self.settings.label_selector)
            .await
        {
            Ok(pods) => {
                for summary in pod_summaries(&pods) {
                    info!("  {}", summary);
                }
            }
            Err(e) => warn!("Unable to list controller pods: {}", e),
        }
    }

    pub fn summary(&self) {
        section("Test Summary");
        info!(
            "Total: {} | Passed: {} | Failed: {}",
            self.tally.total(),
            self.tally.passed,
            self.tally.failed
        );
        if self.tally.failed == 0 {
            info!("✓ All tests passed");
        } else {
            error!("✗ {} test(s) failed", self.tally.failed);
        }
    }
}

/// One controller period and a second of slack.
async fn delay(settings: &Settings) {
    let delay = settings.reconcile_delay();
    info!("Waiting {}s for sync...", delay.as_secs());
    tokio::time::sleep(delay).await;
}

// Runs the metrics lifecycle with Prometheus as the primary source. Fails without recording
// anything when Prometheus cannot be found, reached or queried.
async fn via_prometheus<C>(
    settings: &Settings,
    cluster: &C,
    fallback: &PodMetricsSource<'_, C>,
    tally: &mut Tally,
) -> Result<()>
where
    C: ClusterApi,
{
    let namespace = &settings.prometheus_namespace;
    let service = discover_aggregator(cluster, namespace, settings.metrics.prometheus_port).await?;
    let target = TunnelTarget::service(namespace, &service.name, service.port);
    with_tunnel(
        &TunnelOptions::from_settings(settings),
        target,
        None,
        move |port| prometheus_lifecycle(settings, cluster, fallback, tally, port),
    )
    .await?
}

async fn prometheus_lifecycle<C>(
    settings: &Settings,
    cluster: &C,
    fallback: &PodMetricsSource<'_, C>,
    tally: &mut Tally,
    port: u16,
) -> Result<()>
where
    C: ClusterApi,
{
    let client = healthy_aggregator(settings, port).await?;
    info!("Prometheus is healthy, continuing with metrics tests...");
    let primary = PrometheusSource::new(client, settings.metrics.clone());
    let verifier = MetricsVerifier::new(settings.timeouts.metrics, Some(&primary), fallback);
    metrics_lifecycle(settings, cluster, &verifier, tally).await;
    Ok(())
}

async fn healthy_aggregator(settings: &Settings, port: u16) -> Result<PrometheusClient> {
    let namespace = &settings.prometheus_namespace;
    let client = PrometheusClient::new(port, settings.timeouts.http)?;
    match client.healthy().await {
        Ok(true) => Ok(client),
        Ok(false) => error::AggregatorUnavailableSnafu {
            namespace,
            reason: "the 'up' query did not succeed",
        }
        .fail(),
        Err(e) => error::AggregatorUnavailableSnafu {
            namespace,
            reason: format!("not responding: {}", e),
        }
        .fail(),
    }
}

// Without Prometheus the pod endpoint must respond and expose both metric families before the
// lifecycle runs against it alone.
async fn fallback_only<C>(
    settings: &Settings,
    cluster: &C,
    fallback: &PodMetricsSource<'_, C>,
    tally: &mut Tally,
) where
    C: ClusterApi,
{
    run_log::test("Fallback: port-forward to kapparmor pod /metrics");
    let text = match fallback.scrape().await {
        Ok(text) => text,
        Err(e) => {
            tally.fail(&format!("Metrics endpoint not responding on pod: {}", e));
            return;
        }
    };
    tally.pass("Metrics endpoint is responding (pod)");
    for (family, present) in required_families(&text, &settings.metrics) {
        if present {
            tally.pass(&format!("Metric found in pod /metrics: {}", family));
        } else {
            tally.fail(&format!("Metric missing in pod /metrics: {}", family));
        }
    }
    info!("=== Available Metrics (pod /metrics) ===");
    for line in kapparmor_lines(&text) {
        info!("  {}", line);
    }

    let verifier = MetricsVerifier::new(settings.timeouts.metrics, None, fallback);
    metrics_lifecycle(settings, cluster, &verifier, tally).await;
}

/// Whether each metric family the checks rely on is exposed in `text`.
pub fn required_families<'a>(text: &str, names: &'a MetricNames) -> Vec<(&'a str, bool)> {
    let samples = exposition::parse(text);
    [&names.operations_counter, &names.managed_gauge]
        .into_iter()
        .map(|family| (family.as_str(), exposition::has_family(&samples, family)))
        .collect()
}

/// The sample lines of controller metrics in an exposition.
pub fn kapparmor_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines()
        .filter(|line| line.contains("kapparmor_") && !line.starts_with('#'))
}

/// Creates, modifies and deletes a profile nobody used before and verifies the metric deltas of
/// each step against a baseline taken right before it.
pub async fn metrics_lifecycle<C>(
    settings: &Settings,
    cluster: &C,
    verifier: &MetricsVerifier<'_>,
    tally: &mut Tally,
) where
    C: ClusterApi,
{
    let namespace = &settings.target_namespace;
    let mutator = ConfigMutator::new(settings, cluster);
    let profile = unique_profile_name(Utc::now());
    info!("Using profile '{}'", profile);

    info!("Clearing ConfigMap to establish clean baseline...");
    mutator.clear(namespace).await;
    delay(settings).await;

    for operation in [Operation::Create, Operation::Modify, Operation::Delete] {
        run_log::test(&format!(
            "Testing {} metric increment...",
            operation.to_string().to_uppercase()
        ));
        let baseline = match verifier.baseline(operation, &profile).await {
            Ok(baseline) => Some(baseline),
            Err(e) => {
                tally.fail(&format!("{} baseline unavailable: {}", operation, e));
                None
            }
        };

        let mutated = match operation {
            Operation::Create => {
                let profiles = ProfileConfig::empty()
                    .with_profile(&profile, render_profile(&profile, &[]));
                mutator.apply_profiles(&profiles, namespace).await
            }
            Operation::Modify => {
                let profiles = ProfileConfig::empty()
                    .with_profile(&profile, render_profile(&profile, &["/var/log/** r,"]));
                mutator.apply_profiles(&profiles, namespace).await
            }
            Operation::Delete => mutator.remove_key(namespace, &profile).await,
        };
        if !mutated {
            tally.fail(&format!("{} of '{}' was not applied", operation, profile));
            continue;
        }
        delay(settings).await;
        if operation != Operation::Delete {
            wait_for_reconcile(cluster, settings, &profile, operation).await;
        }

        if let Some(baseline) = baseline {
            let outcome = verifier.verify_delta(operation, &profile, &baseline).await;
            tally.record(outcome.passed(), outcome.message());
        }
    }
}

/// Waits for the controller to log `profile`. A miss does not fail the step, the metrics decide.
async fn wait_for_reconcile<C>(
    cluster: &C,
    settings: &Settings,
    profile: &str,
    operation: Operation,
) -> bool
where
    C: ClusterApi,
{
    let logged = wait_for_log(cluster, settings, profile, settings.timeouts.profile_log).await;
    if !logged {
        debug!(
            "No reconcile of '{}' logged before the {} check, verifying metrics anyway",
            profile, operation
        );
    }
    logged
}

// Best effort diagnostics: what Prometheus holds for the controller, which targets it scrapes
// and what the pod currently exposes.
async fn log_available_metrics<C>(settings: &Settings, cluster: &C, fallback: &PodMetricsSource<'_, C>)
where
    C: ClusterApi,
{
    section("Available Metrics Summary");
    let namespace = &settings.prometheus_namespace;
    match discover_aggregator(cluster, namespace, settings.metrics.prometheus_port).await {
        Ok(service) => {
            let target = TunnelTarget::service(namespace, &service.name, service.port);
            let logged = with_tunnel(
                &TunnelOptions::from_settings(settings),
                target,
                None,
                |port| log_prometheus_metrics(settings, port),
            )
            .await;
            if let Err(e) = logged {
                info!("Prometheus not available: {}", e);
            }
        }
        Err(e) => info!("Prometheus not available: {}", e),
    }

    match fallback.scrape().await {
        Ok(text) => {
            info!("=== Pod /metrics Endpoint ===");
            for line in kapparmor_lines(&text) {
                info!("  {}", line);
            }
        }
        Err(e) => info!("Could not fetch pod /metrics: {}", e),
    }
}

async fn log_prometheus_metrics(settings: &Settings, port: u16) {
    let client = match PrometheusClient::new(port, settings.timeouts.http) {
        Ok(client) => client,
        Err(e) => {
            info!("Prometheus not available: {}", e);
            return;
        }
    };
    let names = &settings.metrics;
    info!("=== Prometheus API Metrics ({}) ===", client.base_url());
    match client.instant_query(&names.operations_counter).await {
        Ok(response) => {
            for (labels, value) in series(&response) {
                info!(
                    "  {}{{operation=\"{}\",profile_name=\"{}\"}} = {}",
                    names.operations_counter,
                    labels.get(LABEL_OPERATION).unwrap_or("?"),
                    labels.get(LABEL_PROFILE_NAME).unwrap_or("?"),
                    value
                );
            }
        }
        Err(e) => info!("  Could not query {}: {}", names.operations_counter, e),
    }
    match client.instant_query(&names.managed_gauge).await {
        Ok(response) => {
            for (_, value) in series(&response) {
                info!("  {} = {}", names.managed_gauge, value);
            }
        }
        Err(e) => info!("  Could not query {}: {}", names.managed_gauge, e),
    }
    match client.active_targets().await {
        Ok(response) => {
            let targets = scrape_targets(&response, "kapparmor");
            if targets.is_empty() {
                info!("⚠ No kapparmor targets found in Prometheus scrape config");
            } else {
                info!("=== Prometheus Scrape Targets ===");
                for target in targets {
                    info!(
                        "  Job: {} | Instance: {} | Health: {}",
                        target.job, target.instance, target.health
                    );
                }
            }
        }
        Err(e) => info!("  Could not query Prometheus targets: {}", e),
    }
}
