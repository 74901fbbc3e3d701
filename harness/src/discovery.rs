use crate::cluster::ClusterApi;
use crate::error::{self, Result};
use e2e_model::constants::{APP_NAME, APP_PART_OF, LABEL_RELEASE, PROM_NAMES, PROM_RELEASE, PROM_STACK};
use k8s_openapi::api::core::v1::Service;
use log::info;
use std::cmp::Reverse;
use std::collections::BTreeMap;

/// A Service that fronts the Prometheus aggregator.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AggregatorService {
    pub name: String,
    pub port: u16,
    pub score: u32,
}

/// How strongly a set of Service labels suggests the kube-prometheus-stack Prometheus.
pub fn score_labels(labels: &BTreeMap<String, String>) -> u32 {
    let is = |key: &str, value: &str| labels.get(key).map(String::as_str) == Some(value);
    let mut score = 0;
    if is(APP_PART_OF, PROM_STACK) {
        score += 2;
    }
    if PROM_NAMES.iter().any(|name| is(APP_NAME, name)) {
        score += 1;
    }
    if is(LABEL_RELEASE, PROM_RELEASE) {
        score += 1;
    }
    score
}

/// Picks the best Service exposing `port`: the highest score wins, equal scores go to the
/// lexicographically smallest name.
pub fn select_aggregator(services: &[Service], port: u16) -> Option<AggregatorService> {
    let mut candidates: Vec<AggregatorService> = services
        .iter()
        .filter(|service| {
            service
                .spec
                .as_ref()
                .and_then(|spec| spec.ports.as_ref())
                .map(|ports| ports.iter().any(|p| p.port == i32::from(port)))
                .unwrap_or(false)
        })
        .filter_map(|service| {
            Some(AggregatorService {
                name: service.metadata.name.clone()?,
                port,
                score: score_labels(service.metadata.labels.as_ref().unwrap_or(&BTreeMap::new())),
            })
        })
        .collect();
    candidates.sort_by(|a, b| (Reverse(a.score), &a.name).cmp(&(Reverse(b.score), &b.name)));
    candidates.into_iter().next()
}

/// Finds the Prometheus Service of `namespace`. Any failure leaves the run on the fallback path.
pub async fn discover_aggregator<C>(cluster: &C, namespace: &str, port: u16) -> Result<AggregatorService>
where
    C: ClusterApi,
{
    let services = match cluster.services(namespace).await {
        Ok(services) => services,
        Err(e) => {
            return error::AggregatorUnavailableSnafu {
                namespace,
                reason: format!("cannot list services: {}", e),
            }
            .fail()
        }
    };
    let service = select_aggregator(&services, port).ok_or_else(|| {
        error::AggregatorUnavailableSnafu {
            namespace,
            reason: format!("no Service exposes port {}", port),
        }
        .build()
    })?;
    info!(
        "Discovered Prometheus Service: {}:{} (ns={})",
        service.name, service.port, namespace
    );
    Ok(service)
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::cluster::test::MockCluster;
    use crate::error::Severity;
    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use maplit::btreemap;

    pub(crate) fn service(name: &str, labels: BTreeMap<String, String>, ports: &[i32]) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                ports: Some(
                    ports
                        .iter()
                        .map(|port| ServicePort {
                            port: *port,
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn scores() {
        assert_eq!(score_labels(&BTreeMap::new()), 0);
        assert_eq!(
            score_labels(&btreemap! {
                APP_PART_OF.to_string() => PROM_STACK.to_string(),
                APP_NAME.to_string() => "prometheus-operated".to_string(),
                LABEL_RELEASE.to_string() => PROM_RELEASE.to_string(),
            }),
            4
        );
        assert_eq!(
            score_labels(&btreemap! { APP_NAME.to_string() => "grafana".to_string() }),
            0
        );
    }

    #[test]
    fn highest_score_then_smallest_name() {
        let services = vec![
            service("grafana", BTreeMap::new(), &[3000]),
            service("zz-prom", BTreeMap::new(), &[9090]),
            service(
                "prometheus-b",
                btreemap! { APP_NAME.to_string() => "prometheus".to_string() },
                &[9090, 8080],
            ),
            service(
                "prometheus-a",
                btreemap! { LABEL_RELEASE.to_string() => PROM_RELEASE.to_string() },
                &[9090],
            ),
        ];
        assert_eq!(
            select_aggregator(&services, 9090),
            Some(AggregatorService {
                name: "prometheus-a".to_string(),
                port: 9090,
                score: 1,
            })
        );
        assert_eq!(select_aggregator(&services[..2], 9090).unwrap().name, "zz-prom");
        assert_eq!(select_aggregator(&services[..1], 9090), None);
    }

    #[tokio::test]
    async fn no_candidate_degrades() {
        let cluster = MockCluster::default();
        cluster.state.lock().unwrap().services = vec![service("grafana", BTreeMap::new(), &[3000])];
        let err = discover_aggregator(&cluster, "observability", 9090)
            .await
            .unwrap_err();
        assert_eq!(err.severity(), Severity::Degraded);
    }
}
