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

use polaris_sidecar::{app, config, signal, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let boot = config::BootOverrides::from_args(std::env::args().skip(1))?;
    let config = config::Config::load(&boot)?;
    telemetry::setup_logging(config.log_level.as_deref());
    app::run(signal::Shutdown::new(), config).await
}
