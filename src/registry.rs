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

//! The narrow registry surface the sidecar consumes. Components never talk
//! to the registry directly; they hold `Arc<dyn Discovery>` / `Arc<dyn
//! Limiter>` handles derived from a single [SdkContext] built at startup.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tonic::transport::{Channel, Endpoint};

pub mod proto {
    tonic::include_proto!("registry.v1");
}

use proto::registry_client::RegistryClient;

/// The registry server's reserved internal namespace.
pub const SERVER_NAMESPACE: &str = "Polaris";

/// Namespace alias that query names may carry; rewritten to
/// [SERVER_NAMESPACE] during parsing.
pub const SYS_NAMESPACE_ALIAS: &str = "polaris";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid registry address {0}")]
    Address(String),
    #[error("registry transport: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("registry rpc: {0}")]
    Rpc(#[from] tonic::Status),
}

/// Identifies a service in the registry. Keys with an empty namespace or
/// service are never produced by parsing and are rejected by the server.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    pub namespace: String,
    pub service: String,
}

impl ServiceKey {
    pub fn new<N: Into<String>, S: Into<String>>(namespace: N, service: S) -> Self {
        Self {
            namespace: namespace.into(),
            service: service.into(),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.service)
    }
}

/// A single registered endpoint of a service.
#[derive(Clone, Debug)]
pub struct Instance {
    pub host: String,
    pub port: u32,
    pub priority: u32,
    pub weight: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetStatus {
    Success,
    Fail,
}

/// Outcome of one upstream call, reported back to the registry so it can
/// feed circuit breaking and load balancing.
#[derive(Clone, Debug)]
pub struct CallResult {
    pub service: ServiceKey,
    pub host: String,
    pub port: u32,
    pub status: RetStatus,
    pub code: u32,
    pub delay: Duration,
}

#[derive(Clone, Debug, Default)]
pub struct QuotaRequest {
    pub namespace: String,
    pub service: String,
    pub method: String,
    pub arguments: Vec<(String, String)>,
    pub token: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuotaResult {
    Ok,
    Limited,
}

#[derive(Clone, Debug)]
pub struct QuotaResponse {
    pub code: QuotaResult,
    pub info: String,
}

/// Service discovery and call reporting, as consumed by the DNS resolvers
/// and the telemetry reporter.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Returns the instances the registry selected for one call to the
    /// service. Routing is influenced by the caller's `source_labels`.
    async fn get_one_instance(
        &self,
        service: &ServiceKey,
        source_labels: &HashMap<String, String>,
    ) -> Result<Vec<Instance>, Error>;

    /// Lists all services registered under a namespace.
    async fn list_services(&self, namespace: &str) -> Result<Vec<ServiceKey>, Error>;

    /// Reports the outcome of a single upstream call.
    async fn report_call(&self, result: CallResult) -> Result<(), Error>;
}

/// Quota acquisition, as consumed by the rate limit translator.
#[async_trait]
pub trait Limiter: Send + Sync {
    async fn acquire_quota(&self, request: &QuotaRequest) -> Result<QuotaResponse, Error>;
}

/// Process-wide registry handle. Built once at startup and passed into each
/// component; components derive their API handles from it rather than from
/// process globals so tests can inject fakes.
#[derive(Clone)]
pub struct SdkContext {
    discovery: Arc<dyn Discovery>,
    limiter: Arc<dyn Limiter>,
}

impl SdkContext {
    pub fn connect(addresses: &[String]) -> Result<Self, Error> {
        let address = addresses
            .first()
            .ok_or_else(|| Error::Address("<empty>".to_string()))?;
        let endpoint = Endpoint::from_shared(format!("http://{address}"))
            .map_err(|_| Error::Address(address.clone()))?
            .connect_timeout(Duration::from_secs(5));
        // Connect lazily; the registry may come up after the sidecar.
        let channel = endpoint.connect_lazy();
        let client = Arc::new(GrpcRegistry {
            client: RegistryClient::new(channel),
        });
        Ok(Self {
            discovery: client.clone(),
            limiter: client,
        })
    }

    /// Builds a context around externally provided implementations.
    pub fn from_parts(discovery: Arc<dyn Discovery>, limiter: Arc<dyn Limiter>) -> Self {
        Self { discovery, limiter }
    }

    pub fn discovery(&self) -> Arc<dyn Discovery> {
        self.discovery.clone()
    }

    pub fn limiter(&self) -> Arc<dyn Limiter> {
        self.limiter.clone()
    }
}

struct GrpcRegistry {
    client: RegistryClient<Channel>,
}

#[async_trait]
impl Discovery for GrpcRegistry {
    async fn get_one_instance(
        &self,
        service: &ServiceKey,
        source_labels: &HashMap<String, String>,
    ) -> Result<Vec<Instance>, Error> {
        let request = proto::GetOneInstanceRequest {
            service: Some(proto::ServiceKey {
                namespace: service.namespace.clone(),
                service: service.service.clone(),
            }),
            source_labels: source_labels.clone(),
        };
        let response = self
            .client
            .clone()
            .get_one_instance(request)
            .await?
            .into_inner();
        Ok(response
            .instances
            .into_iter()
            .map(|ins| Instance {
                host: ins.host,
                port: ins.port,
                priority: ins.priority,
                weight: ins.weight,
            })
            .collect())
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<ServiceKey>, Error> {
        let request = proto::ListServicesRequest {
            namespace: namespace.to_string(),
        };
        let response = self.client.clone().list_services(request).await?.into_inner();
        Ok(response
            .services
            .into_iter()
            .map(|key| ServiceKey::new(key.namespace, key.service))
            .collect())
    }

    async fn report_call(&self, result: CallResult) -> Result<(), Error> {
        let request = proto::CallResult {
            service: Some(proto::ServiceKey {
                namespace: result.service.namespace,
                service: result.service.service,
            }),
            host: result.host,
            port: result.port,
            success: result.status == RetStatus::Success,
            code: result.code,
            delay_ms: result.delay.as_millis() as u64,
        };
        self.client.clone().report_call(request).await?;
        Ok(())
    }
}

#[async_trait]
impl Limiter for GrpcRegistry {
    async fn acquire_quota(&self, request: &QuotaRequest) -> Result<QuotaResponse, Error> {
        let req = proto::QuotaRequest {
            namespace: request.namespace.clone(),
            service: request.service.clone(),
            method: request.method.clone(),
            arguments: request
                .arguments
                .iter()
                .map(|(key, value)| proto::QuotaArgument {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect(),
            token: request.token,
        };
        let response = self.client.clone().acquire_quota(req).await?.into_inner();
        let code = match response.code() {
            proto::quota_response::Code::Limited => QuotaResult::Limited,
            proto::quota_response::Code::Ok => QuotaResult::Ok,
        };
        Ok(QuotaResponse {
            code,
            info: response.info,
        })
    }
}
