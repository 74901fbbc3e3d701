use crate::error::{self, Result};
use crate::tunnel::local_url;
use crate::verifier::MetricsSource;
use async_trait::async_trait;
use e2e_model::{EvidenceSource, LabelSet, MetricNames, Observation, Operation};
use log::debug;
use serde_json::Value;
use snafu::ResultExt;
use std::time::Duration;

/// A Prometheus HTTP API reachable on a local port.
#[derive(Debug, Clone)]
pub struct PrometheusClient {
    base: String,
    http: reqwest::Client,
}

impl PrometheusClient {
    pub fn new(local_port: u16, timeout: Duration) -> Result<Self> {
        Ok(Self {
            base: local_url(local_port, ""),
            http: http_client(timeout)?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    /// Runs an instant query and returns the raw response document.
    pub async fn instant_query(&self, expr: &str) -> Result<Value> {
        debug!("PromQL: {}", expr);
        self.get_json("/api/v1/query", &[("query", expr)]).await
    }

    pub async fn active_targets(&self) -> Result<Value> {
        self.get_json("/api/v1/targets", &[("state", "active")]).await
    }

    /// `true` if the `up` query succeeds.
    pub async fn healthy(&self) -> Result<bool> {
        let response = self.instant_query("up").await?;
        Ok(response.get("status").and_then(Value::as_str) == Some("success"))
    }

    async fn get_json(&self, path: &str, query: &[(&str, &str)]) -> Result<Value> {
        let url = format!("{}{}", self.base, path);
        let text = get_text(self.http.get(&url).query(query), &url).await?;
        serde_json::from_str(&text).context(error::ResponseParseSnafu { url })
    }
}

/// Sends `request` and returns the response body. A status other than 2xx is an error, so a
/// rejected query never reads as an empty result.
pub(crate) async fn get_text(request: reqwest::RequestBuilder, url: &str) -> Result<String> {
    request
        .send()
        .await
        .context(error::HttpSnafu { url })?
        .error_for_status()
        .context(error::HttpSnafu { url })?
        .text()
        .await
        .context(error::HttpSnafu { url })
}

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context(error::HttpClientSnafu)
}

/// Every series of an instant vector response with its value. Values that are not numbers count
/// as 0. Any other response yields no series.
pub fn series(response: &Value) -> Vec<(LabelSet, f64)> {
    if response.get("status").and_then(Value::as_str) != Some("success") {
        return Vec::new();
    }
    let data = match response.get("data") {
        Some(data) => data,
        None => return Vec::new(),
    };
    if data.get("resultType").and_then(Value::as_str) != Some("vector") {
        return Vec::new();
    }
    data.get("result")
        .and_then(Value::as_array)
        .map(|result| {
            result
                .iter()
                .map(|item| {
                    let labels: LabelSet = item
                        .get("metric")
                        .and_then(Value::as_object)
                        .map(|metric| {
                            metric
                                .iter()
                                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                                .collect()
                        })
                        .unwrap_or_default();
                    (labels, sample_value(item))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// The sum of the series of an instant vector response, restricted to the series carrying every
/// label of `filter` with exactly the given value. No series sums to 0.
pub fn instant_value(response: &Value, filter: Option<&LabelSet>) -> f64 {
    series(response)
        .into_iter()
        .filter(|(labels, _)| filter.map(|filter| filter.matches(labels.iter())).unwrap_or(true))
        .fold(0.0, |sum, (_, value)| sum + value)
}

// A sample is `[<timestamp>, "<value>"]`.
fn sample_value(item: &Value) -> f64 {
    item.get("value")
        .and_then(|value| value.get(1))
        .and_then(Value::as_str)
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or(0.0)
}

/// A scrape target as reported by `/api/v1/targets`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ScrapeTarget {
    pub job: String,
    pub instance: String,
    pub health: String,
}

/// The active targets whose labels mention `needle`, case insensitively.
pub fn scrape_targets(response: &Value, needle: &str) -> Vec<ScrapeTarget> {
    let needle = needle.to_lowercase();
    let label = |labels: Option<&Value>, name: &str| {
        labels
            .and_then(|labels| labels.get(name))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string()
    };
    response
        .get("data")
        .and_then(|data| data.get("activeTargets"))
        .and_then(Value::as_array)
        .map(|targets| {
            targets
                .iter()
                .filter(|target| {
                    target
                        .get("labels")
                        .map(|labels| labels.to_string().to_lowercase().contains(&needle))
                        .unwrap_or(false)
                })
                .map(|target| {
                    let labels = target.get("labels");
                    ScrapeTarget {
                        job: label(labels, "job"),
                        instance: label(labels, "instance"),
                        health: target
                            .get("health")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown")
                            .to_string(),
                    }
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Controller metrics as aggregated by Prometheus.
pub struct PrometheusSource {
    client: PrometheusClient,
    names: MetricNames,
}

impl PrometheusSource {
    pub fn new(client: PrometheusClient, names: MetricNames) -> Self {
        Self { client, names }
    }

    pub fn client(&self) -> &PrometheusClient {
        &self.client
    }
}

#[async_trait]
impl MetricsSource for PrometheusSource {
    fn source(&self) -> EvidenceSource {
        EvidenceSource::Primary
    }

    async fn observe(&self, operation: Operation, profile: &str) -> Result<Observation> {
        let labels = LabelSet::operation(operation, profile);
        let counter = self
            .client
            .instant_query(&labels.selector(&self.names.operations_counter))
            .await?;
        let gauge = self
            .client
            .instant_query(&format!("sum({})", self.names.managed_gauge))
            .await?;
        Ok(Observation::new(
            instant_value(&counter, Some(&labels)),
            instant_value(&gauge, None),
        ))
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves every request on a local port with `status` and `body`. Returns the port.
    pub(crate) async fn respond_with(status: &'static str, body: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut request = vec![0; 4096];
                let _ = stream.read(&mut request).await;
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\
                     Connection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        port
    }

    fn vector(result: Value) -> Value {
        json!({"status": "success", "data": {"resultType": "vector", "result": result}})
    }

    #[test]
    fn sums_matching_series() {
        let response = vector(json!([
            {"metric": {"operation": "create", "profile_name": "custom.a", "instance": "n1"}, "value": [1700000000.1, "2"]},
            {"metric": {"operation": "create", "profile_name": "custom.a", "instance": "n2"}, "value": [1700000000.1, "1"]},
            {"metric": {"operation": "create", "profile_name": "custom.ab"}, "value": [1700000000.1, "7"]},
            {"metric": {"operation": "delete", "profile_name": "custom.a"}, "value": [1700000000.1, "4"]}
        ]));
        let filter = LabelSet::operation(Operation::Create, "custom.a");
        assert_eq!(instant_value(&response, Some(&filter)), 3.0);
        assert_eq!(instant_value(&response, None), 14.0);
    }

    #[test]
    fn empty_or_unexpected_responses_are_zero() {
        assert_eq!(instant_value(&vector(json!([])), None), 0.0);
        assert_eq!(
            instant_value(&json!({"status": "error", "errorType": "bad_data"}), None),
            0.0
        );
        assert_eq!(
            instant_value(
                &json!({"status": "success", "data": {"resultType": "scalar", "result": [1, "3"]}}),
                None
            ),
            0.0
        );
    }

    #[test]
    fn malformed_values_are_zero() {
        let response = vector(json!([
            {"metric": {}, "value": [1, "not-a-number"]},
            {"metric": {}, "value": [1]},
            {"metric": {}, "value": [1, 5]},
            {"metric": {}, "value": [1, "2.5"]}
        ]));
        assert_eq!(instant_value(&response, None), 2.5);
    }

    #[test]
    fn series_carry_labels() {
        let response = vector(json!([
            {"metric": {"operation": "modify", "profile_name": "custom.a"}, "value": [1, "1"]}
        ]));
        let series = series(&response);
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].0.get("operation"), Some("modify"));
        assert_eq!(series[0].1, 1.0);
    }

    #[test]
    fn kapparmor_targets() {
        let response = json!({"status": "success", "data": {"activeTargets": [
            {"labels": {"job": "kapparmor", "instance": "10.1.0.5:8080"}, "health": "up"},
            {"labels": {"job": "node-exporter", "instance": "10.1.0.6:9100"}, "health": "up"},
            {"labels": {"instance": "10.1.0.7:8080", "service": "KappArmor-metrics"}}
        ]}});
        assert_eq!(
            scrape_targets(&response, "kapparmor"),
            vec![
                ScrapeTarget {
                    job: "kapparmor".to_string(),
                    instance: "10.1.0.5:8080".to_string(),
                    health: "up".to_string(),
                },
                ScrapeTarget {
                    job: "unknown".to_string(),
                    instance: "10.1.0.7:8080".to_string(),
                    health: "unknown".to_string(),
                },
            ]
        );
        assert!(scrape_targets(&json!({}), "kapparmor").is_empty());
    }

    #[test]
    fn no_series_is_positive_zero() {
        let value = instant_value(&vector(json!([])), None);
        assert_eq!(value, 0.0);
        assert!(value.is_sign_positive());
        assert_eq!(format!("{}", value), "0");
    }

    #[tokio::test]
    async fn rejected_query_is_an_error() {
        let port = respond_with(
            "400 Bad Request",
            r#"{"status":"error","errorType":"bad_data","error":"parse error"}"#,
        )
        .await;
        let client = PrometheusClient::new(port, Duration::from_secs(5)).unwrap();
        let source = PrometheusSource::new(client, MetricNames::default());
        let err = source
            .observe(Operation::Create, "custom.p")
            .await
            .unwrap_err();
        assert!(matches!(err, error::Error::Http { .. }), "{}", err);
        assert!(source.client().healthy().await.is_err());
    }

    #[tokio::test]
    async fn successful_query_is_read() {
        let port = respond_with(
            "200 OK",
            r#"{"status":"success","data":{"resultType":"vector","result":[{"metric":{},"value":[1,"3"]}]}}"#,
        )
        .await;
        let client = PrometheusClient::new(port, Duration::from_secs(5)).unwrap();
        let response = client.instant_query("up").await.unwrap();
        assert_eq!(instant_value(&response, None), 3.0);
        assert!(client.healthy().await.unwrap());
    }
}
