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

use std::str::FromStr;
use std::time::Instant;

use once_cell::sync::Lazy;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;

pub static APPLICATION_START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

pub fn setup_logging(level: Option<&str>) {
    Lazy::force(&APPLICATION_START_TIME);
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(default_filter(level)))
        .init();
}

fn default_filter(level: Option<&str>) -> Targets {
    // Explicit config wins over RUST_LOG; hickory's per-request logging is
    // noisy at info and stays quieted unless explicitly overridden.
    let base = level
        .map(|l| l.to_string())
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "info".to_string());
    Targets::from_str(&format!("hickory_server=warn,{base}"))
        .unwrap_or_else(|_| Targets::new().with_default(LevelFilter::INFO))
}
