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

use std::io;
use std::net::SocketAddr;

pub mod discovery;
pub mod handler;
pub mod meshproxy;
pub mod name_util;
pub mod recursor;
pub mod resolver;
pub mod server;

pub use server::Server;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to bind {0}: {1}")]
    Bind(SocketAddr, #[source] io::Error),
    #[error("unknown resolver {0}")]
    UnknownResolver(String),
    #[error("failed to read system resolver config: {0}")]
    SystemConf(String),
    #[error("invalid option {0} for resolver {1}")]
    ResolverOption(&'static str, String),
}
