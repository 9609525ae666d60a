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

//! SDS server: streams the current certificate bundle to subscribed Envoy
//! listeners and pushes every rotation.

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use prost::Message;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status, Streaming};
use tracing::debug;

use crate::envoy::extensions::transport_sockets::tls::v3::{
    data_source, secret, CertificateValidationContext, DataSource, Secret, TlsCertificate,
};
use crate::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use crate::envoy::service::secret::v3::secret_discovery_service_server::SecretDiscoveryService;
use crate::mtls::CertBundle;

const SECRET_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret";
const IDENTITY_SECRET_NAME: &str = "default";
const ROOT_SECRET_NAME: &str = "ROOTCA";

/// Holds the latest certificate bundle and fans updates out to all
/// subscribed SDS streams.
pub struct SecretStore {
    state: watch::Sender<Option<(u64, CertBundle)>>,
}

impl SecretStore {
    pub fn new() -> Self {
        let (state, _) = watch::channel(None);
        Self { state }
    }

    pub fn update(&self, bundle: CertBundle) {
        self.state.send_modify(|state| {
            let version = state.as_ref().map(|(v, _)| v + 1).unwrap_or(1);
            debug!(version, "updating sds secrets");
            *state = Some((version, bundle));
        });
    }

    fn subscribe(&self) -> watch::Receiver<Option<(u64, CertBundle)>> {
        self.state.subscribe()
    }
}

impl Default for SecretStore {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Service {
    store: Arc<SecretStore>,
}

impl Service {
    pub fn new(store: Arc<SecretStore>) -> Self {
        Self { store }
    }
}

#[tonic::async_trait]
impl SecretDiscoveryService for Service {
    type StreamSecretsStream =
        Pin<Box<dyn Stream<Item = Result<DiscoveryResponse, Status>> + Send + 'static>>;

    async fn stream_secrets(
        &self,
        _request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamSecretsStream>, Status> {
        let stream = WatchStream::new(self.store.subscribe())
            .filter_map(|state| state.map(|(version, bundle)| Ok(build_response(version, &bundle))));
        Ok(Response::new(Box::pin(stream)))
    }

    async fn fetch_secrets(
        &self,
        _request: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        let state = self.store.subscribe().borrow().clone();
        match state {
            Some((version, bundle)) => Ok(Response::new(build_response(version, &bundle))),
            None => Err(Status::unavailable("no certificate issued yet")),
        }
    }
}

fn build_response(version: u64, bundle: &CertBundle) -> DiscoveryResponse {
    let identity = Secret {
        name: IDENTITY_SECRET_NAME.to_string(),
        r#type: Some(secret::Type::TlsCertificate(TlsCertificate {
            certificate_chain: Some(inline(&bundle.cert_chain)),
            private_key: Some(inline(&bundle.private_key)),
        })),
    };
    let root = Secret {
        name: ROOT_SECRET_NAME.to_string(),
        r#type: Some(secret::Type::ValidationContext(
            CertificateValidationContext {
                trusted_ca: Some(inline(&bundle.root_cert)),
            },
        )),
    };
    DiscoveryResponse {
        version_info: version.to_string(),
        nonce: version.to_string(),
        type_url: SECRET_TYPE_URL.to_string(),
        resources: [identity, root]
            .into_iter()
            .map(|secret| prost_types::Any {
                type_url: SECRET_TYPE_URL.to_string(),
                value: secret.encode_to_vec(),
            })
            .collect(),
    }
}

fn inline(pem: &str) -> DataSource {
    DataSource {
        specifier: Some(data_source::Specifier::InlineBytes(
            pem.as_bytes().to_vec(),
        )),
    }
}
