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

//! Meshproxy resolver: answers any known mesh service name with a fixed
//! address so the application's traffic is steered into the local data plane.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record, RecordType};
use itertools::Itertools;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ResolverEntry;
use crate::dns::name_util::{canonicalize, trim_dot};
use crate::dns::resolver::{Answer, DebugRoute, NamingResolver, Question, ResolveContext};
use crate::dns::Error;
use crate::registry::Discovery;

pub const NAME: &str = "meshproxy";

/// Address handed out for every mesh service; the data plane intercepts
/// traffic to it.
const DEFAULT_ANSWER_IP: Ipv4Addr = Ipv4Addr::new(10, 4, 4, 4);
const DEFAULT_RELOAD_INTERVAL: Duration = Duration::from_secs(30);

pub struct MeshProxyResolver {
    discovery: Arc<dyn Discovery>,
    namespace: String,
    suffix: String,
    dns_ttl: u32,
    answer_ip: Ipv4Addr,
    reload_interval: Duration,
    services: Arc<RwLock<HashSet<String>>>,
}

impl MeshProxyResolver {
    pub fn new(
        entry: &ResolverEntry,
        namespace: &str,
        discovery: Arc<dyn Discovery>,
    ) -> Result<Self, Error> {
        let answer_ip = match entry.options.get("dns_answer_ip") {
            None => DEFAULT_ANSWER_IP,
            Some(value) => value
                .as_str()
                .and_then(|s| s.parse().ok())
                .ok_or(Error::ResolverOption("dns_answer_ip", NAME.to_string()))?,
        };
        let reload_interval = match entry.options.get("reload_interval_sec") {
            None => DEFAULT_RELOAD_INTERVAL,
            Some(value) => value
                .as_u64()
                .map(Duration::from_secs)
                .ok_or(Error::ResolverOption("reload_interval_sec", NAME.to_string()))?,
        };
        Ok(Self {
            discovery,
            namespace: namespace.to_string(),
            suffix: canonicalize(&entry.suffix),
            dns_ttl: entry.dns_ttl,
            answer_ip,
            reload_interval,
            services: Arc::new(RwLock::new(HashSet::new())),
        })
    }

    /// Every name a service is reachable under: `<service>.<namespace>.` and,
    /// when a suffix is configured, `<service>.<namespace>.<suffix>`.
    fn reload_into(&self, services: &[crate::registry::ServiceKey]) {
        let mut next = HashSet::with_capacity(services.len() * 2);
        for key in services {
            let base = format!("{}.{}", key.service, key.namespace).to_ascii_lowercase();
            next.insert(canonicalize(&base));
            if self.suffix != "." {
                next.insert(canonicalize(&format!(
                    "{base}.{}",
                    trim_dot(&self.suffix).to_ascii_lowercase()
                )));
            }
        }
        *self.services.write().unwrap() = next;
    }

    async fn reload(&self) {
        match self.discovery.list_services(&self.namespace).await {
            Ok(services) => {
                debug!(count = services.len(), "reloaded mesh service list");
                self.reload_into(&services);
            }
            Err(e) => warn!(err = %e, "failed to reload mesh service list"),
        }
    }
}

#[async_trait]
impl NamingResolver for MeshProxyResolver {
    fn name(&self) -> &'static str {
        NAME
    }

    fn start(&self, ctx: CancellationToken) {
        let resolver = Self {
            discovery: self.discovery.clone(),
            namespace: self.namespace.clone(),
            suffix: self.suffix.clone(),
            dns_ttl: self.dns_ttl,
            answer_ip: self.answer_ip,
            reload_interval: self.reload_interval,
            services: self.services.clone(),
        };
        tokio::spawn(async move {
            info!(interval = ?resolver.reload_interval, "meshproxy resolver started");
            let mut interval = tokio::time::interval(resolver.reload_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => resolver.reload().await,
                    _ = ctx.cancelled() => {
                        info!("meshproxy resolver stopped");
                        return;
                    }
                }
            }
        });
    }

    async fn serve_dns(
        &self,
        _ctx: &ResolveContext,
        question: &Question,
        qname: &str,
    ) -> Option<Answer> {
        if question.qtype != RecordType::A {
            return None;
        }
        let lookup = canonicalize(qname).to_ascii_lowercase();
        if !self.services.read().unwrap().contains(&lookup) {
            return None;
        }
        Some(Answer::new(vec![Record::from_rdata(
            question.name.clone(),
            self.dns_ttl,
            RData::A(A(self.answer_ip)),
        )]))
    }

    fn debug_routes(&self) -> Vec<DebugRoute> {
        let services = self.services.clone();
        vec![DebugRoute {
            path: "/debug/resolver/meshproxy/services".to_string(),
            handler: Arc::new(move || {
                services
                    .read()
                    .unwrap()
                    .iter()
                    .sorted()
                    .join("\n")
            }),
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ServiceKey;
    use crate::test_helpers::dns::{n, resolve_ctx};
    use crate::test_helpers::registry::StubDiscovery;
    use std::collections::HashMap;

    fn entry(suffix: &str) -> ResolverEntry {
        ResolverEntry {
            name: NAME.to_string(),
            enable: true,
            suffix: suffix.to_string(),
            dns_ttl: 10,
            options: HashMap::new(),
        }
    }

    fn resolver(suffix: &str) -> MeshProxyResolver {
        let stub = Arc::new(StubDiscovery::default());
        let r = MeshProxyResolver::new(&entry(suffix), "prod", stub).unwrap();
        r.reload_into(&[ServiceKey::new("prod", "orders")]);
        r
    }

    #[tokio::test]
    async fn known_service_gets_answer_ip() {
        let r = resolver("svc.cluster.local");
        for qname in ["orders.prod.", "orders.prod.svc.cluster.local.", "ORDERS.PROD."] {
            let question = Question {
                name: n(qname),
                qtype: RecordType::A,
            };
            let answer = r
                .serve_dns(&resolve_ctx(), &question, qname)
                .await
                .unwrap_or_else(|| panic!("no answer for {qname}"));
            assert_eq!(
                &RData::A(A(DEFAULT_ANSWER_IP)),
                answer.records()[0].data()
            );
        }
    }

    #[tokio::test]
    async fn unknown_name_falls_through() {
        let r = resolver("");
        let question = Question {
            name: n("payments.prod."),
            qtype: RecordType::A,
        };
        assert!(r
            .serve_dns(&resolve_ctx(), &question, "payments.prod.")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn non_a_questions_fall_through() {
        let r = resolver("");
        let question = Question {
            name: n("orders.prod."),
            qtype: RecordType::AAAA,
        };
        assert!(r
            .serve_dns(&resolve_ctx(), &question, "orders.prod.")
            .await
            .is_none());
    }
}
