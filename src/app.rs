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

//! Supervisor: builds the enabled components, runs them under a shared
//! cancellation token, and coordinates a time-bounded graceful shutdown.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::registry::SdkContext;
use crate::reporter::Reporter;
use crate::{admin, dns, mtls, ratelimit, reporter, signal};

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

pub async fn run(shutdown: signal::Shutdown, config: Config) -> anyhow::Result<()> {
    let sdk = SdkContext::connect(&config.registry.addresses)?;
    let ready = admin::Ready::new();
    let booting = ready.register_task("components");

    let dns = dns::Server::new(&config, &sdk).await?;
    let debug = if config.debug.enable {
        Some(admin::DebugServer::new(
            SocketAddr::new(config.bind, config.debug.port),
            ready.clone(),
            dns.debug_routes(),
        ))
    } else {
        None
    };
    let metrics = if config.mesh.metrics.enable {
        Some(Reporter::new(
            &config.namespace,
            reporter::admin_url(config.mesh.metrics.admin_url.as_deref()),
            sdk.discovery(),
        ))
    } else {
        None
    };
    let rls = if config.mesh.ratelimit.enable {
        Some(ratelimit::RateLimitServer::new(
            config.mesh.ratelimit.clone(),
            &config.namespace,
            sdk.limiter(),
        ))
    } else {
        None
    };
    let mtls = if config.mesh.mtls.enable {
        Some(mtls::Agent::new(&config.mesh.mtls, &config.namespace)?)
    } else {
        None
    };

    // The error channel is sized to the number of service tasks so a burst
    // of simultaneous failures never blocks a dying component. The DNS
    // server owns two tasks, one per transport.
    let mut capacity = 2;
    for enabled in [
        debug.is_some(),
        metrics.is_some(),
        rls.is_some(),
        mtls.is_some(),
    ] {
        if enabled {
            capacity += 1;
        }
    }
    let (err_tx, mut err_rx) = mpsc::channel(capacity);

    let ctx = CancellationToken::new();
    let tracker = TaskTracker::new();
    tracker.spawn(dns.run(ctx.clone(), err_tx.clone()));
    if let Some(debug) = debug {
        tracker.spawn(debug.run(ctx.clone(), err_tx.clone()));
    }
    if let Some(metrics) = metrics {
        tracker.spawn(metrics.run(ctx.clone(), err_tx.clone()));
    }
    if let Some(rls) = rls {
        tracker.spawn(rls.run(ctx.clone(), err_tx.clone()));
    }
    if let Some(mtls) = mtls {
        tracker.spawn(mtls.run(ctx.clone(), err_tx.clone()));
    }
    drop(err_tx);
    drop(booting);

    tokio::select! {
        _ = shutdown.wait() => info!("shutting down"),
        Some(err) = err_rx.recv() => error!(err = %err, "component failed, shutting down"),
    }

    ctx.cancel();
    tracker.close();
    if tokio::time::timeout(SHUTDOWN_DEADLINE, tracker.wait())
        .await
        .is_err()
    {
        warn!(deadline = ?SHUTDOWN_DEADLINE, "graceful shutdown timed out, forcing exit");
    } else {
        info!("all components shut down gracefully");
    }
    Ok(())
}
