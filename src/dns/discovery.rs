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

//! Discovery resolver: answers service questions from the registry and
//! handles the self-encoded `_addr` fast path.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::rr::rdata::{A, AAAA, SRV};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tracing::{debug, warn};

use crate::config::{self, ResolverEntry};
use crate::dns::name_util::{
    canonicalize, decode_addr_label, encode_ip_as_fqdn, trim_dot, ADDR_LABEL,
};
use crate::dns::resolver::{Answer, NamingResolver, Question, ResolveContext};
use crate::dns::{name_util, Error};
use crate::registry::{Discovery, Instance, ServiceKey};

pub const NAME: &str = "discovery";

pub struct DiscoveryResolver {
    discovery: Arc<dyn Discovery>,
    namespace: String,
    suffix: String,
    dns_ttl: u32,
    route_labels: HashMap<String, String>,
}

impl DiscoveryResolver {
    pub fn new(
        entry: &ResolverEntry,
        namespace: &str,
        discovery: Arc<dyn Discovery>,
    ) -> Result<Self, Error> {
        let route_labels = match entry.options.get("route_labels") {
            None => HashMap::new(),
            Some(value) => {
                let raw = value
                    .as_str()
                    .ok_or(Error::ResolverOption("route_labels", NAME.to_string()))?;
                config::parse_labels(raw)
            }
        };
        Ok(Self {
            discovery,
            namespace: namespace.to_string(),
            suffix: canonicalize(&entry.suffix),
            dns_ttl: entry.dns_ttl,
            route_labels,
        })
    }

    /// Answers a name carrying a self-encoded address without consulting the
    /// registry. SRV questions get a bare answer; the address was already
    /// delivered through the A/AAAA question this name exists to serve.
    fn addr_answer(&self, question: &Question, ip: IpAddr) -> Option<Answer> {
        let record = match (question.qtype, ip) {
            (RecordType::A, IpAddr::V4(v4)) => {
                Record::from_rdata(question.name.clone(), self.dns_ttl, RData::A(A(v4)))
            }
            (RecordType::AAAA, IpAddr::V6(v6)) => {
                Record::from_rdata(question.name.clone(), self.dns_ttl, RData::AAAA(AAAA(v6)))
            }
            (RecordType::SRV, _) => return Some(Answer::new(Vec::new())),
            _ => {
                warn!(qname = %question.name, %ip, qtype = %question.qtype,
                    "self-encoded address does not fit the question type");
                return None;
            }
        };
        Some(Answer::new(vec![record]))
    }

    fn instance_record(
        &self,
        question: &Question,
        key: &ServiceKey,
        instance: &Instance,
    ) -> Option<Record> {
        match question.qtype {
            RecordType::A => {
                let addr = instance.host.parse().ok()?;
                Some(Record::from_rdata(
                    question.name.clone(),
                    self.dns_ttl,
                    RData::A(A(addr)),
                ))
            }
            RecordType::AAAA => {
                let addr = instance.host.parse().ok()?;
                Some(Record::from_rdata(
                    question.name.clone(),
                    self.dns_ttl,
                    RData::AAAA(AAAA(addr)),
                ))
            }
            RecordType::SRV => {
                let addr: IpAddr = instance.host.parse().ok()?;
                let target = Name::from_utf8(encode_ip_as_fqdn(addr, key)).ok()?;
                Some(Record::from_rdata(
                    question.name.clone(),
                    self.dns_ttl,
                    RData::SRV(SRV::new(
                        instance.priority as u16,
                        instance.weight as u16,
                        instance.port as u16,
                        target,
                    )),
                ))
            }
            _ => None,
        }
    }
}

#[async_trait]
impl NamingResolver for DiscoveryResolver {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn serve_dns(
        &self,
        ctx: &ResolveContext,
        question: &Question,
        qname: &str,
    ) -> Option<Answer> {
        let labels: Vec<&str> = trim_dot(qname).split('.').collect();
        for (i, label) in labels.iter().enumerate() {
            if *label != ADDR_LABEL {
                continue;
            }
            if i == 0 {
                return None;
            }
            let Some(ip) = decode_addr_label(labels[i - 1]) else {
                warn!(%qname, "failed to decode self-encoded address label");
                return None;
            };
            debug!(%qname, %ip, protocol = ?ctx.protocol, "serving self-encoded address");
            return self.addr_answer(question, ip);
        }

        let key = match name_util::parse_qname(qname, &self.suffix, &self.namespace) {
            Some(key) => key,
            None => {
                debug!(%qname, suffix = %self.suffix, "qname outside the discovery suffix");
                return None;
            }
        };
        let instances = match self
            .discovery
            .get_one_instance(&key, &self.route_labels)
            .await
        {
            Ok(instances) => instances,
            Err(e) => {
                warn!(service = %key, err = %e, "registry lookup failed");
                return None;
            }
        };
        if instances.is_empty() {
            return None;
        }
        let records: Vec<Record> = instances
            .iter()
            .filter_map(|ins| self.instance_record(question, &key, ins))
            .collect();
        if records.is_empty() {
            debug!(service = %key, "no instance produced a usable record");
            return None;
        }
        debug!(service = %key, count = records.len(), "resolved from registry");
        Some(Answer::new(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::dns::{n, resolve_ctx};
    use crate::test_helpers::registry::StubDiscovery;
    use hickory_proto::rr::RecordType;
    use std::net::Ipv4Addr;

    fn entry(suffix: &str) -> ResolverEntry {
        ResolverEntry {
            name: NAME.to_string(),
            enable: true,
            suffix: suffix.to_string(),
            dns_ttl: 10,
            options: HashMap::new(),
        }
    }

    fn resolver(stub: Arc<StubDiscovery>, suffix: &str) -> DiscoveryResolver {
        DiscoveryResolver::new(&entry(suffix), "prod", stub).unwrap()
    }

    #[tokio::test]
    async fn self_encoded_a_record_skips_registry() {
        let stub = Arc::new(StubDiscovery::default());
        let r = resolver(stub.clone(), "");

        let question = Question {
            name: n("7f000001._addr.foo.prod."),
            qtype: RecordType::A,
        };
        let answer = r
            .serve_dns(&resolve_ctx(), &question, "7f000001._addr.foo.prod.")
            .await
            .unwrap();

        let records = answer.records();
        assert_eq!(1, records.len());
        assert_eq!(
            &RData::A(A(Ipv4Addr::new(127, 0, 0, 1))),
            records[0].data()
        );
        assert_eq!(0, stub.lookup_count(), "fast path must not hit the registry");
    }

    #[tokio::test]
    async fn self_encoded_srv_is_bare() {
        let stub = Arc::new(StubDiscovery::default());
        let r = resolver(stub.clone(), "");

        let question = Question {
            name: n("7f000001._addr.foo.prod."),
            qtype: RecordType::SRV,
        };
        let answer = r
            .serve_dns(&resolve_ctx(), &question, "7f000001._addr.foo.prod.")
            .await
            .unwrap();
        assert!(answer.records().is_empty());
        assert_eq!(0, stub.lookup_count());
    }

    #[tokio::test]
    async fn srv_synthesis_embeds_instance_address() {
        let stub = Arc::new(StubDiscovery::with_instances(vec![Instance {
            host: "10.0.0.5".to_string(),
            port: 8080,
            priority: 10,
            weight: 5,
        }]));
        let r = resolver(stub, "");

        let question = Question {
            name: n("orders.prod."),
            qtype: RecordType::SRV,
        };
        let answer = r
            .serve_dns(&resolve_ctx(), &question, "orders.prod.")
            .await
            .unwrap();

        let records = answer.records();
        assert_eq!(1, records.len());
        let RData::SRV(srv) = records[0].data() else {
            panic!("expected SRV record, got {:?}", records[0]);
        };
        assert_eq!(10, srv.priority());
        assert_eq!(5, srv.weight());
        assert_eq!(8080, srv.port());
        assert_eq!(&n("0a000005._addr.orders.prod."), srv.target());
    }

    #[tokio::test]
    async fn a_records_for_every_instance() {
        let stub = Arc::new(StubDiscovery::with_instances(vec![
            Instance {
                host: "10.0.0.5".to_string(),
                port: 8080,
                priority: 0,
                weight: 100,
            },
            Instance {
                host: "10.0.0.6".to_string(),
                port: 8080,
                priority: 0,
                weight: 100,
            },
        ]));
        let r = resolver(stub, "");

        let question = Question {
            name: n("orders.prod."),
            qtype: RecordType::A,
        };
        let answer = r
            .serve_dns(&resolve_ctx(), &question, "orders.prod.")
            .await
            .unwrap();
        assert_eq!(2, answer.records().len());
    }

    #[tokio::test]
    async fn suffix_miss_falls_through() {
        let stub = Arc::new(StubDiscovery::default());
        let r = resolver(stub.clone(), "svc.cluster.local");

        let question = Question {
            name: n("www.example.com."),
            qtype: RecordType::A,
        };
        assert!(r
            .serve_dns(&resolve_ctx(), &question, "www.example.com.")
            .await
            .is_none());
        assert_eq!(0, stub.lookup_count());
    }

    #[tokio::test]
    async fn empty_lookup_falls_through() {
        let stub = Arc::new(StubDiscovery::default());
        let r = resolver(stub.clone(), "");

        let question = Question {
            name: n("orders.prod."),
            qtype: RecordType::A,
        };
        assert!(r
            .serve_dns(&resolve_ctx(), &question, "orders.prod.")
            .await
            .is_none());
        assert_eq!(1, stub.lookup_count());
    }
}
