// Copyright Polaris Sidecar Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Telemetry reporter: scrapes the local data plane's admin endpoint on a
//! fixed tick, computes per-endpoint counter deltas, and reports each call
//! outcome to the registry.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::{CallResult, Discovery, RetStatus, ServiceKey};

const SCRAPE_INTERVAL: Duration = Duration::from_secs(30);
/// Eviction runs every N ticks; entries idle longer than the inactivity
/// window are dropped so endpoint churn cannot grow the map unboundedly.
const EVICT_EVERY_TICKS: u32 = 10;
const INACTIVE_AFTER: Duration = Duration::from_secs(5 * 60);

const REPORT_ATTEMPTS: u32 = 3;
const REPORT_BACKOFF_BASE: Duration = Duration::from_millis(100);
const REPORT_BACKOFF_CAP: Duration = Duration::from_secs(5);

const DEFAULT_ADMIN_URL: &str = "http://127.0.0.1:15000";
const ADMIN_URL_ENV: &str = "CLUSTER_METRICS_URL";

/// Identifies one upstream endpoint of one cluster.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InstanceMetricKey {
    pub cluster: String,
    pub host: String,
    pub port: u32,
}

/// Cumulative counters from the most recent scrape.
#[derive(Clone, Debug, Default)]
pub struct InstanceMetricValue {
    pub rq_total: u64,
    pub rq_success: u64,
    pub rq_error: u64,
    pub last_active: Option<Instant>,
}

/// Resolves the admin endpoint: explicit config, then the environment, then
/// the conventional local default.
pub fn admin_url(configured: Option<&str>) -> String {
    if let Some(url) = configured {
        if !url.is_empty() {
            return url.to_string();
        }
    }
    match std::env::var(ADMIN_URL_ENV) {
        Ok(url) if !url.is_empty() => url,
        _ => DEFAULT_ADMIN_URL.to_string(),
    }
}

pub struct Reporter {
    namespace: String,
    admin_url: String,
    discovery: Arc<dyn Discovery>,
    client: Client<hyper_util::client::legacy::connect::HttpConnector, Empty<Bytes>>,
}

impl Reporter {
    pub fn new(namespace: &str, admin_url: String, discovery: Arc<dyn Discovery>) -> Self {
        Self {
            namespace: namespace.to_string(),
            admin_url,
            discovery,
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    pub async fn run(self, ctx: CancellationToken, _errors: tokio::sync::mpsc::Sender<anyhow::Error>) {
        info!(admin_url = self.admin_url, "starting telemetry reporter");
        let mut values: HashMap<InstanceMetricKey, InstanceMetricValue> = HashMap::new();
        let mut clean_counter = 0u32;
        let mut ticker =
            tokio::time::interval_at(Instant::now() + SCRAPE_INTERVAL, SCRAPE_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    clean_counter += 1;
                    if clean_counter >= EVICT_EVERY_TICKS {
                        clean_counter = 0;
                        evict_inactive(&mut values, Instant::now());
                    }
                    self.scrape_and_report(&mut values).await;
                }
                _ = ctx.cancelled() => {
                    info!("telemetry reporter stopped");
                    return;
                }
            }
        }
    }

    /// One tick: scrape counters and latency, report the deltas. Scrape
    /// failures are transient and absorbed; the next tick tries again.
    async fn scrape_and_report(&self, values: &mut HashMap<InstanceMetricKey, InstanceMetricValue>) {
        let clusters: Clusters = match self.get_json("/clusters?format=json").await {
            Ok(clusters) => clusters,
            Err(e) => {
                warn!(err = %e, "failed to scrape admin clusters");
                return;
            }
        };
        let delays = match self.get_json::<StatsObject>("/stats?format=json").await {
            Ok(stats) => parse_upstream_delay(&stats),
            Err(e) => {
                warn!(err = %e, "failed to scrape admin stats");
                HashMap::new()
            }
        };
        debug!(?delays, "parsed upstream delays");

        let now = Instant::now();
        for (key, current) in collect_cluster_metrics(&clusters, now) {
            let delta = diff(values.get(&key), &current);
            values.insert(key.clone(), current);
            let Some(delta) = delta else {
                // First sight of this endpoint establishes the baseline.
                continue;
            };
            let delay = delays.get(&key.cluster).copied().unwrap_or_default();
            self.report(&key, &delta, delay).await;
        }
    }

    async fn report(&self, key: &InstanceMetricKey, delta: &InstanceMetricValue, delay: f64) {
        for _ in 0..delta.rq_success {
            self.report_status(key, RetStatus::Success, 200, delay).await;
        }
        for _ in 0..delta.rq_error {
            self.report_status(key, RetStatus::Fail, 500, delay).await;
        }
    }

    /// Reports one call outcome, retrying with exponential backoff. After
    /// the attempts are exhausted the result is dropped.
    async fn report_status(&self, key: &InstanceMetricKey, status: RetStatus, code: u32, delay: f64) {
        let result = CallResult {
            service: ServiceKey::new(self.namespace.clone(), key.cluster.clone()),
            host: key.host.clone(),
            port: key.port,
            status,
            code,
            delay: Duration::from_millis(delay as u64),
        };
        for attempt in 0..REPORT_ATTEMPTS {
            match self.discovery.report_call(result.clone()).await {
                Ok(()) => return,
                Err(e) => {
                    let backoff =
                        REPORT_BACKOFF_CAP.min(REPORT_BACKOFF_BASE * 2u32.saturating_pow(attempt));
                    warn!(
                        cluster = key.cluster,
                        attempt = attempt + 1,
                        ?backoff,
                        err = %e,
                        "call result report failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
        warn!(cluster = key.cluster, attempts = REPORT_ATTEMPTS, "dropping call result");
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        let uri: hyper::Uri = format!("{}{}", self.admin_url, path).parse()?;
        let request = hyper::Request::builder()
            .uri(uri)
            .body(Empty::<Bytes>::new())?;
        let response = self.client.request(request).await?;
        let body = response.into_body().collect().await?.to_bytes();
        Ok(serde_json::from_slice(&body)?)
    }
}

fn evict_inactive(values: &mut HashMap<InstanceMetricKey, InstanceMetricValue>, now: Instant) {
    values.retain(|_, value| match value.last_active {
        Some(last_active) => now.duration_since(last_active) <= INACTIVE_AFTER,
        None => false,
    });
}

/// Computes the per-field delta against the previous snapshot. Counter
/// resets (current below previous) clamp to zero rather than going negative.
/// A key seen for the first time yields no delta; reporting the raw
/// cumulative would over-report everything that happened before we watched.
fn diff(
    previous: Option<&InstanceMetricValue>,
    current: &InstanceMetricValue,
) -> Option<InstanceMetricValue> {
    let previous = previous?;
    Some(InstanceMetricValue {
        rq_total: current.rq_total.saturating_sub(previous.rq_total),
        rq_success: current.rq_success.saturating_sub(previous.rq_success),
        rq_error: current.rq_error.saturating_sub(previous.rq_error),
        last_active: current.last_active,
    })
}

fn collect_cluster_metrics(
    clusters: &Clusters,
    now: Instant,
) -> Vec<(InstanceMetricKey, InstanceMetricValue)> {
    let mut out = Vec::new();
    for cluster in &clusters.cluster_statuses {
        for host in &cluster.host_statuses {
            let Some(socket) = host.address.as_ref().and_then(|a| a.socket_address.as_ref())
            else {
                continue;
            };
            let key = InstanceMetricKey {
                cluster: cluster.name.clone(),
                host: socket.address.clone(),
                port: socket.port_value,
            };
            let mut value = InstanceMetricValue {
                last_active: Some(now),
                ..Default::default()
            };
            for stat in &host.stats {
                match stat.name.as_str() {
                    "rq_total" => value.rq_total = stat.value,
                    "rq_success" => value.rq_success = stat.value,
                    "rq_error" => value.rq_error = stat.value,
                    _ => {}
                }
            }
            out.push((key, value));
        }
    }
    out
}

/// Extracts a representative upstream latency per cluster from the admin
/// histograms: the third computed quantile (P50) of
/// `cluster.<name>.upstream_rq_time`.
fn parse_upstream_delay(stats: &StatsObject) -> HashMap<String, f64> {
    let mut out = HashMap::new();
    for stat in &stats.stats {
        let Some(histograms) = &stat.histograms else {
            continue;
        };
        for quantile in &histograms.computed_quantiles {
            let name = &quantile.name;
            if !name.starts_with("cluster.") || !name.ends_with(".upstream_rq_time") {
                continue;
            }
            let Some(first_dot) = name.find('.') else {
                continue;
            };
            let remainder = &name[first_dot + 1..];
            let Some(last_dot) = remainder.rfind('.') else {
                continue;
            };
            let service = &remainder[..last_dot];
            if service.is_empty() {
                continue;
            }
            let Some(value) = quantile.values.get(2).and_then(|v| v.cumulative) else {
                continue;
            };
            out.insert(service.to_string(), value);
        }
    }
    out
}

// The admin endpoint renders its protobuf schema as JSON; uint64 counters
// arrive as strings per the canonical encoding, and field names may be
// either snake_case or lowerCamelCase depending on the emitter.

#[derive(Debug, Default, Deserialize)]
struct Clusters {
    #[serde(default, alias = "clusterStatuses")]
    cluster_statuses: Vec<ClusterStatus>,
}

#[derive(Debug, Default, Deserialize)]
struct ClusterStatus {
    #[serde(default)]
    name: String,
    #[serde(default, alias = "hostStatuses")]
    host_statuses: Vec<HostStatus>,
}

#[derive(Debug, Default, Deserialize)]
struct HostStatus {
    #[serde(default)]
    address: Option<Address>,
    #[serde(default)]
    stats: Vec<SimpleMetric>,
}

#[derive(Debug, Default, Deserialize)]
struct Address {
    #[serde(default, alias = "socketAddress")]
    socket_address: Option<SocketAddress>,
}

#[derive(Debug, Default, Deserialize)]
struct SocketAddress {
    #[serde(default)]
    address: String,
    #[serde(default, alias = "portValue")]
    port_value: u32,
}

#[derive(Debug, Default, Deserialize)]
struct SimpleMetric {
    #[serde(default)]
    name: String,
    #[serde(default, deserialize_with = "u64_or_string")]
    value: u64,
}

#[derive(Debug, Default, Deserialize)]
struct StatsObject {
    #[serde(default)]
    stats: Vec<Stat>,
}

#[derive(Debug, Default, Deserialize)]
struct Stat {
    #[serde(default)]
    histograms: Option<Histograms>,
}

#[derive(Debug, Default, Deserialize)]
struct Histograms {
    #[serde(default, alias = "computedQuantiles")]
    computed_quantiles: Vec<ComputedQuantile>,
}

#[derive(Debug, Default, Deserialize)]
struct ComputedQuantile {
    #[serde(default)]
    name: String,
    #[serde(default)]
    values: Vec<QuantileValue>,
}

#[derive(Debug, Default, Deserialize)]
struct QuantileValue {
    #[serde(default)]
    cumulative: Option<f64>,
}

fn u64_or_string<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        String(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::String(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLUSTERS_JSON: &str = r#"{
        "cluster_statuses": [
            {
                "name": "orders",
                "host_statuses": [
                    {
                        "address": {"socket_address": {"address": "10.0.0.5", "port_value": 8080}},
                        "stats": [
                            {"name": "rq_total", "value": "12"},
                            {"name": "rq_success", "value": "10"},
                            {"name": "rq_error", "value": 2}
                        ]
                    }
                ]
            }
        ]
    }"#;

    const CLUSTERS_CAMEL_JSON: &str = r#"{
        "clusterStatuses": [
            {
                "name": "orders",
                "hostStatuses": [
                    {
                        "address": {"socketAddress": {"address": "10.0.0.5", "portValue": 8080}},
                        "stats": [{"name": "rq_total", "value": "7"}]
                    }
                ]
            }
        ]
    }"#;

    const STATS_JSON: &str = r#"{
        "stats": [
            {"name": "ignored", "value": 3},
            {
                "histograms": {
                    "computed_quantiles": [
                        {
                            "name": "cluster.orders.upstream_rq_time",
                            "values": [
                                {"interval": null, "cumulative": 1.0},
                                {"interval": null, "cumulative": 2.0},
                                {"interval": null, "cumulative": 8.5},
                                {"interval": null, "cumulative": 20.0}
                            ]
                        },
                        {
                            "name": "http.ingress.downstream_rq_time",
                            "values": [{"cumulative": 4.0}]
                        }
                    ]
                }
            }
        ]
    }"#;

    #[test]
    fn parses_cluster_statuses() {
        let clusters: Clusters = serde_json::from_str(CLUSTERS_JSON).unwrap();
        let metrics = collect_cluster_metrics(&clusters, Instant::now());
        assert_eq!(1, metrics.len());
        let (key, value) = &metrics[0];
        assert_eq!(
            &InstanceMetricKey {
                cluster: "orders".to_string(),
                host: "10.0.0.5".to_string(),
                port: 8080,
            },
            key
        );
        assert_eq!(12, value.rq_total);
        assert_eq!(10, value.rq_success);
        assert_eq!(2, value.rq_error);
    }

    #[test]
    fn parses_camel_case_admin_output() {
        let clusters: Clusters = serde_json::from_str(CLUSTERS_CAMEL_JSON).unwrap();
        let metrics = collect_cluster_metrics(&clusters, Instant::now());
        assert_eq!(1, metrics.len());
        assert_eq!(7, metrics[0].1.rq_total);
        assert_eq!(8080, metrics[0].0.port);
    }

    #[test]
    fn extracts_third_quantile_per_cluster() {
        let stats: StatsObject = serde_json::from_str(STATS_JSON).unwrap();
        let delays = parse_upstream_delay(&stats);
        assert_eq!(1, delays.len());
        assert_eq!(Some(&8.5), delays.get("orders"));
    }

    #[test]
    fn first_observation_yields_no_delta() {
        let current = InstanceMetricValue {
            rq_total: 100,
            rq_success: 90,
            rq_error: 10,
            last_active: None,
        };
        assert!(diff(None, &current).is_none());
    }

    #[test]
    fn deltas_are_monotonic() {
        let previous = InstanceMetricValue {
            rq_total: 100,
            rq_success: 90,
            rq_error: 10,
            last_active: None,
        };
        let current = InstanceMetricValue {
            rq_total: 130,
            rq_success: 115,
            rq_error: 5, // counter reset
            last_active: None,
        };
        let delta = diff(Some(&previous), &current).unwrap();
        assert_eq!(30, delta.rq_total);
        assert_eq!(25, delta.rq_success);
        assert_eq!(0, delta.rq_error);
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_drops_idle_endpoints() {
        let key = |cluster: &str| InstanceMetricKey {
            cluster: cluster.to_string(),
            host: "10.0.0.5".to_string(),
            port: 8080,
        };
        let mut values = HashMap::new();
        values.insert(
            key("stale"),
            InstanceMetricValue {
                last_active: Some(Instant::now()),
                ..Default::default()
            },
        );
        tokio::time::advance(INACTIVE_AFTER + Duration::from_secs(1)).await;
        values.insert(
            key("fresh"),
            InstanceMetricValue {
                last_active: Some(Instant::now()),
                ..Default::default()
            },
        );

        evict_inactive(&mut values, Instant::now());
        assert!(!values.contains_key(&key("stale")));
        assert!(values.contains_key(&key("fresh")));
    }

    #[test]
    fn admin_url_falls_back_to_default() {
        assert_eq!("http://10.1.1.1:15000", admin_url(Some("http://10.1.1.1:15000")));
        // Empty configuration falls through (env may or may not be set; the
        // result must never be empty).
        assert!(!admin_url(Some("")).is_empty());
        assert!(!admin_url(None).is_empty());
    }
}
