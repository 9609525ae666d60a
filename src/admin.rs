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

//! Debug and health HTTP surface: readiness/liveness probes, CPU profiles,
//! and the debug routes resolvers register.

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use itertools::Itertools;
use pprof::protos::Message;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dns::resolver::DebugRoute;
use crate::telemetry;

const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_PROFILE_SECONDS: u64 = 10;

/// Ready tracks whether the process is ready.
#[derive(Clone, Debug, Default)]
pub struct Ready(Arc<Mutex<HashSet<String>>>);

impl Ready {
    pub fn new() -> Ready {
        Ready(Default::default())
    }

    /// register_task adds a dependency that blocks readiness until the
    /// returned guard is dropped.
    pub fn register_task(&self, name: &str) -> BlockReady {
        self.0.lock().unwrap().insert(name.to_string());
        BlockReady {
            parent: self.clone(),
            name: name.to_string(),
        }
    }

    pub fn pending(&self) -> HashSet<String> {
        self.0.lock().unwrap().clone()
    }
}

/// BlockReady blocks readiness until it is dropped.
pub struct BlockReady {
    parent: Ready,
    name: String,
}

impl Drop for BlockReady {
    fn drop(&mut self) {
        let mut pending = self.parent.0.lock().unwrap();
        pending.remove(&self.name);
        let left = pending.len();
        let dur = telemetry::APPLICATION_START_TIME.elapsed();
        if left == 0 {
            info!(task = self.name, ?dur, "readiness blocker complete, marking server ready");
        } else {
            info!(task = self.name, ?dur, left, "readiness blocker complete");
        }
    }
}

pub struct DebugServer {
    addr: SocketAddr,
    state: Arc<State>,
}

struct State {
    ready: Ready,
    routes: HashMap<String, DebugRoute>,
}

impl DebugServer {
    pub fn new(addr: SocketAddr, ready: Ready, routes: Vec<DebugRoute>) -> Self {
        Self {
            addr,
            state: Arc::new(State {
                ready,
                routes: routes
                    .into_iter()
                    .map(|route| (route.path.clone(), route))
                    .collect(),
            }),
        }
    }

    pub async fn run(self, ctx: CancellationToken, errors: tokio::sync::mpsc::Sender<anyhow::Error>) {
        let listener = match TcpListener::bind(self.addr).await {
            Ok(listener) => listener,
            Err(e) => {
                let _ = errors
                    .send(anyhow!("failed to bind debug server {}: {e}", self.addr))
                    .await;
                return;
            }
        };
        info!(address = %self.addr, "debug server listening");
        let graceful = GracefulShutdown::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(err = %e, "debug server accept failed");
                            continue;
                        }
                    };
                    debug!(%peer, "debug connection accepted");
                    let state = self.state.clone();
                    let service = service_fn(move |request| handle(state.clone(), request));
                    let conn = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service);
                    let conn = graceful.watch(conn);
                    tokio::spawn(async move {
                        if let Err(e) = conn.await {
                            debug!(err = %e, "debug connection error");
                        }
                    });
                }
                _ = ctx.cancelled() => break,
            }
        }
        drop(listener);
        if tokio::time::timeout(GRACEFUL_TIMEOUT, graceful.shutdown())
            .await
            .is_err()
        {
            warn!("graceful debug server shutdown timed out");
        }
        info!("debug server stopped");
    }
}

async fn handle(
    state: Arc<State>,
    request: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = request.uri().path().to_string();
    let response = match path.as_str() {
        "/sidecar/health/liveness" => empty(StatusCode::OK),
        "/sidecar/health/readiness" => {
            let pending = state.ready.pending();
            if pending.is_empty() {
                text(StatusCode::OK, "ok".to_string())
            } else {
                text(
                    StatusCode::SERVICE_UNAVAILABLE,
                    format!("not ready, pending: {}", pending.iter().sorted().join(", ")),
                )
            }
        }
        "/debug/pprof/profile" => profile(request.uri().query()).await,
        "/debug/pprof/cmdline" => text(
            StatusCode::OK,
            std::env::args().collect::<Vec<_>>().join(" "),
        ),
        _ => match state.routes.get(&path) {
            Some(route) => text(StatusCode::OK, (route.handler)()),
            None => empty(StatusCode::NOT_FOUND),
        },
    };
    Ok(response)
}

/// Samples the process for the requested number of seconds and returns a
/// pprof protobuf profile.
async fn profile(query: Option<&str>) -> Response<Full<Bytes>> {
    let seconds = query
        .and_then(|q| {
            q.split('&')
                .find_map(|pair| pair.strip_prefix("seconds="))
                .and_then(|raw| raw.parse().ok())
        })
        .unwrap_or(DEFAULT_PROFILE_SECONDS);
    let guard = match pprof::ProfilerGuardBuilder::default().frequency(99).build() {
        Ok(guard) => guard,
        Err(e) => return text(StatusCode::INTERNAL_SERVER_ERROR, format!("profiler: {e}")),
    };
    tokio::time::sleep(Duration::from_secs(seconds)).await;
    let body = guard
        .report()
        .build()
        .and_then(|report| report.pprof())
        .map(|profile| profile.encode_to_vec());
    match body {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/octet-stream")
            .body(Full::new(Bytes::from(body)))
            .unwrap(),
        Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, format!("profile: {e}")),
    }
}

fn empty(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

fn text(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}
