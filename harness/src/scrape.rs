use crate::cluster::{pick_pod, ClusterApi};
use crate::error::{self, Result};
use crate::exposition::{self, ExpositionSample};
use crate::promql::{get_text, http_client};
use crate::tunnel::{local_url, with_tunnel, TunnelOptions, TunnelTarget};
use crate::verifier::MetricsSource;
use async_trait::async_trait;
use e2e_model::constants::METRICS_PATH;
use e2e_model::{EvidenceSource, LabelSet, MetricNames, Observation, Operation, Settings};
use log::debug;
use snafu::OptionExt;

/// Controller metrics read straight from a controller pod's `/metrics` endpoint through a pod
/// tunnel that only lives for the duration of one scrape.
pub struct PodMetricsSource<'a, C>
where
    C: ClusterApi,
{
    settings: &'a Settings,
    cluster: &'a C,
    tunnels: TunnelOptions,
    http: reqwest::Client,
}

impl<'a, C> PodMetricsSource<'a, C>
where
    C: ClusterApi,
{
    pub fn new(settings: &'a Settings, cluster: &'a C) -> Result<Self> {
        Ok(Self {
            settings,
            cluster,
            tunnels: TunnelOptions::from_settings(settings),
            http: http_client(settings.timeouts.http)?,
        })
    }

    /// The name of the controller pod that is scraped.
    pub async fn pod_name(&self) -> Result<String> {
        let namespace = &self.settings.target_namespace;
        let selector = &self.settings.label_selector;
        let pods = self.cluster.pods(namespace, selector).await?;
        pick_pod(&pods).context(error::NoPodsSnafu {
            namespace,
            selector,
        })
    }

    /// Fetches the exposition text of one controller pod.
    pub async fn scrape(&self) -> Result<String> {
        let pod = self.pod_name().await?;
        let target = TunnelTarget::pod(
            &self.settings.target_namespace,
            pod,
            self.settings.metrics.controller_port,
        );
        let http = &self.http;
        with_tunnel(&self.tunnels, target, None, |port| async move {
            let url = local_url(port, METRICS_PATH);
            debug!("Scraping {}", url);
            get_text(http.get(&url), &url).await
        })
        .await?
    }
}

/// The counter of `(operation, profile)` and the managed profiles gauge in a scrape.
pub fn observation_from_samples(
    samples: &[ExpositionSample],
    names: &MetricNames,
    operation: Operation,
    profile: &str,
) -> Observation {
    Observation::new(
        exposition::counter_value(
            samples,
            &names.operations_counter,
            &LabelSet::operation(operation, profile),
        ),
        exposition::gauge_sum(samples, &names.managed_gauge),
    )
}

#[async_trait]
impl<'a, C> MetricsSource for PodMetricsSource<'a, C>
where
    C: ClusterApi,
{
    fn source(&self) -> EvidenceSource {
        EvidenceSource::Fallback
    }

    async fn observe(&self, operation: Operation, profile: &str) -> Result<Observation> {
        let text = self.scrape().await?;
        Ok(observation_from_samples(
            &exposition::parse(&text),
            &self.settings.metrics,
            operation,
            profile,
        ))
    }
}
