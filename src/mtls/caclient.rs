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

//! CA client: signs workload CSRs against the mesh certificate authority,
//! authenticated with the pod's service-account token and pinned to the
//! mesh root CA.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};
use tracing::info;

pub mod proto {
    tonic::include_proto!("registry.security.v1");
}

use proto::certificate_authority_client::CertificateAuthorityClient;
use proto::SignCertificateRequest;

pub const DEFAULT_ROOT_CA_PATH: &str = "/etc/polaris-sidecar/certs/rootca.pem";
const SERVICE_ACCOUNT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// Reads the pod's service-account token. Missing or unreadable tokens
/// degrade to anonymous requests rather than failing startup.
pub fn service_account_token() -> String {
    std::fs::read_to_string(SERVICE_ACCOUNT_TOKEN_PATH).unwrap_or_default()
}

/// Signs a CSR into a certificate chain, leaf first.
#[async_trait]
pub trait CertSigner: Send + Sync {
    async fn sign(&self, csr: String, ttl: Duration) -> anyhow::Result<Vec<String>>;
}

pub struct CaClient {
    client: CertificateAuthorityClient<Channel>,
    token: String,
}

impl CaClient {
    pub fn connect(address: &str, token: String, root_ca_path: &str) -> anyhow::Result<Self> {
        let endpoint = if Path::new(root_ca_path).exists() {
            let pem = std::fs::read(root_ca_path)
                .with_context(|| format!("failed to read root ca {root_ca_path}"))?;
            Endpoint::from_shared(format!("https://{address}"))
                .map_err(|e| anyhow!("invalid ca address {address}: {e}"))?
                .tls_config(ClientTlsConfig::new().ca_certificate(Certificate::from_pem(pem)))?
        } else {
            info!(root_ca_path, "root ca not found, connecting to the ca in plaintext");
            Endpoint::from_shared(format!("http://{address}"))
                .map_err(|e| anyhow!("invalid ca address {address}: {e}"))?
        };
        Ok(Self {
            client: CertificateAuthorityClient::new(endpoint.connect_lazy()),
            token,
        })
    }
}

#[async_trait]
impl CertSigner for CaClient {
    async fn sign(&self, csr: String, ttl: Duration) -> anyhow::Result<Vec<String>> {
        let mut request = tonic::Request::new(SignCertificateRequest {
            csr,
            validity_duration: ttl.as_secs() as i64,
        });
        if !self.token.is_empty() {
            let value = format!("Bearer {}", self.token.trim())
                .parse()
                .map_err(|e| anyhow!("service account token is not a valid header: {e}"))?;
            request.metadata_mut().insert("authorization", value);
        }
        let response = self
            .client
            .clone()
            .sign_certificate(request)
            .await
            .context("certificate signing rpc failed")?
            .into_inner();
        if response.cert_chain.is_empty() {
            return Err(anyhow!("ca returned an empty certificate chain"));
        }
        Ok(response.cert_chain)
    }
}
