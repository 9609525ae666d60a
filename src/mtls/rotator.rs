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

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Drives a periodic refresh: on success sleep the rotation period, on
/// failure retry after the shorter delay.
pub struct Rotator {
    period: Duration,
    failed_retry_delay: Duration,
}

impl Rotator {
    pub fn new(period: Duration, failed_retry_delay: Duration) -> Self {
        Self {
            period,
            failed_retry_delay,
        }
    }

    pub async fn run<F, Fut>(&self, ctx: &CancellationToken, mut refresh: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        loop {
            let delay = match refresh().await {
                Ok(()) => self.period,
                Err(e) => {
                    warn!(err = %e, retry_in = ?self.failed_retry_delay, "certificate refresh failed");
                    self.failed_retry_delay
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.cancelled() => return,
            }
        }
    }
}
