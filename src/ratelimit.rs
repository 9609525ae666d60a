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

//! Envoy rate limit service: translates each RLS request into a registry
//! quota acquisition.

use std::path::Path;
use std::sync::Arc;

use anyhow::anyhow;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Identity, ServerTlsConfig};
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::config::{RatelimitConfig, RatelimitNetwork};
use crate::envoy::service::ratelimit::v3::rate_limit_response::{Code, DescriptorStatus};
use crate::envoy::service::ratelimit::v3::rate_limit_service_server::{
    RateLimitService, RateLimitServiceServer,
};
use crate::envoy::service::ratelimit::v3::{
    RateLimitDescriptor, RateLimitRequest, RateLimitResponse,
};
use crate::registry::{Limiter, QuotaRequest, QuotaResult};

pub struct RateLimitServer {
    config: RatelimitConfig,
    service: RlsService,
}

#[derive(Clone)]
struct RlsService {
    namespace: String,
    limiter: Arc<dyn Limiter>,
}

impl RateLimitServer {
    pub fn new(config: RatelimitConfig, namespace: &str, limiter: Arc<dyn Limiter>) -> Self {
        Self {
            config,
            service: RlsService {
                namespace: namespace.to_string(),
                limiter,
            },
        }
    }

    pub async fn run(self, ctx: CancellationToken, errors: tokio::sync::mpsc::Sender<anyhow::Error>) {
        info!(address = self.config.address, "starting ratelimit server");
        let service = RateLimitServiceServer::new(self.service);
        let shutdown = {
            let ctx = ctx.clone();
            async move { ctx.cancelled().await }
        };
        let result = match self.config.network {
            RatelimitNetwork::Unix => {
                let path = Path::new(&self.config.address);
                let listener = match crate::socket::bind_uds(path).await {
                    Ok(listener) => listener,
                    Err(e) => {
                        let _ = errors.send(e).await;
                        return;
                    }
                };
                tonic::transport::Server::builder()
                    .add_service(service)
                    .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
                    .await
            }
            RatelimitNetwork::Tcp => {
                let addr = match self.config.address.parse() {
                    Ok(addr) => addr,
                    Err(e) => {
                        let _ = errors
                            .send(anyhow!("invalid ratelimit bind address {}: {e}", self.config.address))
                            .await;
                        return;
                    }
                };
                let mut builder = tonic::transport::Server::builder();
                if let Some(tls) = &self.config.tls {
                    let identity = match tls.load().await {
                        Ok((cert, key)) => Identity::from_pem(cert, key),
                        Err(e) => {
                            let _ = errors.send(anyhow!("failed to load ratelimit tls files: {e}")).await;
                            return;
                        }
                    };
                    builder = match builder.tls_config(ServerTlsConfig::new().identity(identity)) {
                        Ok(builder) => builder,
                        Err(e) => {
                            let _ = errors.send(anyhow!("invalid ratelimit tls config: {e}")).await;
                            return;
                        }
                    };
                }
                builder
                    .add_service(service)
                    .serve_with_shutdown(addr, shutdown)
                    .await
            }
        };
        match result {
            Ok(()) if ctx.is_cancelled() => info!("ratelimit server stopped"),
            Ok(()) => {
                let _ = errors.send(anyhow!("ratelimit server exited unexpectedly")).await;
            }
            Err(e) => {
                let _ = errors.send(anyhow!("ratelimit server failed: {e}")).await;
            }
        }
    }
}

impl RlsService {
    /// Maps an RLS request onto a quota request: `:path` entries select the
    /// method, every other entry becomes a labeled argument, and a domain
    /// mangled as `<service>.<namespace>` is stripped back to the service.
    /// Returns `None` when the domain or namespace is empty; such requests
    /// pass without applying a limit.
    fn build_quota_request(
        &self,
        domain: &str,
        acquire: u32,
        descriptors: &[RateLimitDescriptor],
    ) -> Option<QuotaRequest> {
        if domain.is_empty() || self.namespace.is_empty() {
            warn!("ratelimit request with empty domain or namespace, passing through");
            return None;
        }
        let mut request = QuotaRequest {
            namespace: self.namespace.clone(),
            token: acquire,
            ..Default::default()
        };
        for descriptor in descriptors {
            for entry in &descriptor.entries {
                if entry.key == ":path" {
                    request.method = entry.value.clone();
                } else {
                    request.arguments.push((entry.key.clone(), entry.value.clone()));
                }
            }
        }
        let suffix = format!(".{}", self.namespace);
        request.service = domain.strip_suffix(&suffix).unwrap_or(domain).to_string();
        Some(request)
    }
}

#[tonic::async_trait]
impl RateLimitService for RlsService {
    async fn should_rate_limit(
        &self,
        request: Request<RateLimitRequest>,
    ) -> Result<Response<RateLimitResponse>, Status> {
        let request = request.into_inner();
        debug!(domain = request.domain, descriptors = request.descriptors.len(),
            "received ratelimit request");
        let acquire = request.hits_addend.max(1);

        let (code, info) = match self.build_quota_request(&request.domain, acquire, &request.descriptors)
        {
            None => (Code::Ok, String::new()),
            Some(quota_request) => {
                let response = self
                    .limiter
                    .acquire_quota(&quota_request)
                    .await
                    .map_err(|e| Status::unavailable(format!("quota acquisition failed: {e}")))?;
                let code = match response.code {
                    QuotaResult::Limited => Code::OverLimit,
                    QuotaResult::Ok => Code::Ok,
                };
                (code, response.info)
            }
        };

        let statuses = request
            .descriptors
            .iter()
            .map(|_| DescriptorStatus { code: code as i32 })
            .collect();
        Ok(Response::new(RateLimitResponse {
            overall_code: code as i32,
            statuses,
            raw_body: info.into_bytes(),
        }))
    }
}
