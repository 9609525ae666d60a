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

//! The local DNS server: UDP and TCP listeners on the same bind address,
//! sharing one handler. Each transport is an independent serving unit.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use hickory_proto::ProtoErrorKind;
use hickory_server::ServerFuture;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::dns::discovery::DiscoveryResolver;
use crate::dns::handler::{Forwarder, Handler};
use crate::dns::meshproxy::MeshProxyResolver;
use crate::dns::recursor;
use crate::dns::resolver::{DebugRoute, NamingResolver};
use crate::dns::{discovery, meshproxy, Error};
use crate::registry::SdkContext;

const TCP_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Server {
    udp: ServerFuture<Handler>,
    tcp: ServerFuture<Handler>,
    udp_addr: SocketAddr,
    tcp_addr: SocketAddr,
    resolvers: Vec<Arc<dyn NamingResolver>>,
}

impl Server {
    pub async fn new(config: &Config, sdk: &SdkContext) -> Result<Self, Error> {
        let mut resolvers: Vec<Arc<dyn NamingResolver>> = Vec::new();
        for entry in &config.resolvers {
            if !entry.enable {
                info!(resolver = entry.name, "resolver disabled");
                continue;
            }
            // The chain is an explicit ordered list; the declaration order
            // in the config is the consultation order.
            let resolver: Arc<dyn NamingResolver> = match entry.name.as_str() {
                discovery::NAME => Arc::new(DiscoveryResolver::new(
                    entry,
                    &config.namespace,
                    sdk.discovery(),
                )?),
                meshproxy::NAME => Arc::new(MeshProxyResolver::new(
                    entry,
                    &config.namespace,
                    sdk.discovery(),
                )?),
                other => return Err(Error::UnknownResolver(other.to_string())),
            };
            info!(resolver = entry.name, suffix = entry.suffix, "resolver initialized");
            resolvers.push(resolver);
        }

        let forwarder: Option<Arc<dyn Forwarder>> = if config.recurse.enable {
            recursor::Config::from_system(
                config.bind_localhost(),
                config.recurse.timeout_sec,
                &config.recurse.name_servers,
            )?
            .map(|cfg| Arc::new(recursor::Proxy::new(cfg)) as Arc<dyn Forwarder>)
        } else {
            None
        };

        let handler = Handler::new(resolvers.clone(), forwarder);
        Self::bind(config.bind_addr(), handler, resolvers).await
    }

    async fn bind(
        addr: SocketAddr,
        handler: Handler,
        resolvers: Vec<Arc<dyn NamingResolver>>,
    ) -> Result<Self, Error> {
        let udp_socket = UdpSocket::bind(addr).await.map_err(|e| Error::Bind(addr, e))?;
        let udp_addr = udp_socket.local_addr().map_err(|e| Error::Bind(addr, e))?;
        let tcp_listener = TcpListener::bind(addr).await.map_err(|e| Error::Bind(addr, e))?;
        let tcp_addr = tcp_listener.local_addr().map_err(|e| Error::Bind(addr, e))?;

        let mut udp = ServerFuture::new(handler.clone());
        udp.register_socket(udp_socket);
        let mut tcp = ServerFuture::new(handler);
        tcp.register_listener(tcp_listener, TCP_REQUEST_TIMEOUT);

        info!(%udp_addr, %tcp_addr, "dns server listening");
        Ok(Self {
            udp,
            tcp,
            udp_addr,
            tcp_addr,
            resolvers,
        })
    }

    pub fn udp_address(&self) -> SocketAddr {
        self.udp_addr
    }

    pub fn tcp_address(&self) -> SocketAddr {
        self.tcp_addr
    }

    pub fn debug_routes(&self) -> Vec<DebugRoute> {
        self.resolvers
            .iter()
            .flat_map(|r| r.debug_routes())
            .collect()
    }

    /// Runs both transports to completion. Fatal serve errors are reported
    /// on the supervisor's error channel; cancellation drains gracefully.
    pub async fn run(self, ctx: CancellationToken, errors: mpsc::Sender<anyhow::Error>) {
        for resolver in &self.resolvers {
            resolver.start(ctx.clone());
        }
        let udp = tokio::spawn(serve_transport(self.udp, "udp", ctx.clone(), errors.clone()));
        let tcp = tokio::spawn(serve_transport(self.tcp, "tcp", ctx, errors));
        let _ = udp.await;
        let _ = tcp.await;
        info!("dns server stopped");
    }
}

async fn serve_transport(
    mut server: ServerFuture<Handler>,
    transport: &'static str,
    ctx: CancellationToken,
    errors: mpsc::Sender<anyhow::Error>,
) {
    tokio::select! {
        result = server.block_until_done() => {
            if let Err(e) = result {
                match e.kind() {
                    ProtoErrorKind::NoError => (),
                    _ => {
                        let _ = errors
                            .send(anyhow!("dns {transport} listener failed: {e}"))
                            .await;
                    }
                }
            }
        }
        _ = ctx.cancelled() => {
            info!(transport, "shutting down dns listener");
            if tokio::time::timeout(GRACEFUL_TIMEOUT, server.shutdown_gracefully())
                .await
                .is_err()
            {
                warn!(transport, "graceful dns shutdown timed out");
            }
        }
    }
}
