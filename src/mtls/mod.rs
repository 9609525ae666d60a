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

//! mTLS agent: rotates the workload identity against the mesh CA and serves
//! it to Envoy over SDS.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::MtlsConfig;
use crate::envoy::service::secret::v3::secret_discovery_service_server::SecretDiscoveryServiceServer;

pub mod caclient;
pub mod rotator;
pub mod sds;

use caclient::{CaClient, CertSigner};
use rotator::Rotator;
use sds::SecretStore;

/// One issued workload identity: leaf + chain, its key, and the trust root.
#[derive(Clone, Debug)]
pub struct CertBundle {
    pub cert_chain: String,
    pub private_key: String,
    pub root_cert: String,
}

/// Builds a CSR for the workload identity and has the CA sign it.
#[derive(Clone)]
pub struct CertManager {
    namespace: String,
    service_account: String,
    ttl: Duration,
    signer: Arc<dyn CertSigner>,
}

impl CertManager {
    pub fn new(
        namespace: &str,
        service_account: &str,
        ttl: Duration,
        signer: Arc<dyn CertSigner>,
    ) -> Self {
        Self {
            namespace: namespace.to_string(),
            service_account: service_account.to_string(),
            ttl,
            signer,
        }
    }

    fn spiffe_id(&self) -> String {
        format!(
            "spiffe://cluster.local/ns/{}/sa/{}",
            self.namespace, self.service_account
        )
    }

    pub async fn fetch_bundle(&self) -> anyhow::Result<CertBundle> {
        let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .context("failed to generate key pair")?;
        let mut params = rcgen::CertificateParams::default();
        params.subject_alt_names = vec![rcgen::SanType::URI(
            self.spiffe_id()
                .try_into()
                .map_err(|e| anyhow!("invalid spiffe id: {e}"))?,
        )];
        // Leave the distinguished name empty; identity lives in the SAN.
        params.distinguished_name = rcgen::DistinguishedName::new();
        let csr = params
            .serialize_request(&key_pair)
            .context("failed to build csr")?
            .pem()
            .context("failed to encode csr")?;

        let chain = self.signer.sign(csr, self.ttl).await?;
        let root_cert = chain.last().cloned().unwrap_or_default();
        Ok(CertBundle {
            cert_chain: chain.concat(),
            private_key: key_pair.serialize_pem(),
            root_cert,
        })
    }
}

pub struct Agent {
    socket_path: PathBuf,
    manager: CertManager,
    rotator: Rotator,
    store: Arc<SecretStore>,
}

impl Agent {
    pub fn new(config: &MtlsConfig, namespace: &str) -> anyhow::Result<Self> {
        let signer = CaClient::connect(
            &config.ca_server,
            caclient::service_account_token(),
            caclient::DEFAULT_ROOT_CA_PATH,
        )?;
        let manager = CertManager::new(
            namespace,
            &config.service_account,
            Duration::from_secs(config.cert_ttl_sec),
            Arc::new(signer),
        );
        Ok(Self {
            socket_path: PathBuf::from(&config.address),
            manager,
            rotator: Rotator::new(
                Duration::from_secs(config.rotate_period_sec),
                Duration::from_secs(config.failed_retry_delay_sec),
            ),
            store: Arc::new(SecretStore::new()),
        })
    }

    pub async fn run(self, ctx: CancellationToken, errors: tokio::sync::mpsc::Sender<anyhow::Error>) {
        info!(socket = %self.socket_path.display(), "starting mtls agent");
        let listener = match crate::socket::bind_uds(Path::new(&self.socket_path)).await {
            Ok(listener) => listener,
            Err(e) => {
                let _ = errors.send(e).await;
                return;
            }
        };

        let service = SecretDiscoveryServiceServer::new(sds::Service::new(self.store.clone()));
        let server = {
            let ctx = ctx.clone();
            let errors = errors.clone();
            tokio::spawn(async move {
                let shutdown = {
                    let ctx = ctx.clone();
                    async move { ctx.cancelled().await }
                };
                let result = tonic::transport::Server::builder()
                    .add_service(service)
                    .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
                    .await;
                match result {
                    Ok(()) if ctx.is_cancelled() => {}
                    Ok(()) => {
                        let _ = errors.send(anyhow!("sds server exited unexpectedly")).await;
                    }
                    Err(e) => {
                        let _ = errors.send(anyhow!("sds server failed: {e}")).await;
                    }
                }
            })
        };

        let manager = self.manager.clone();
        let store = self.store.clone();
        self.rotator
            .run(&ctx, move || {
                let manager = manager.clone();
                let store = store.clone();
                async move {
                    let bundle = manager.fetch_bundle().await?;
                    store.update(bundle);
                    Ok(())
                }
            })
            .await;

        let _ = server.await;
        info!("mtls agent stopped");
    }
}
