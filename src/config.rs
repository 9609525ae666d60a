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

//! Sidecar configuration: YAML file, overlaid by environment variables,
//! overlaid by boot flags. Validation failures are fatal at startup.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::dns::{discovery, meshproxy};

const ENV_BIND: &str = "SIDECAR_BIND";
const ENV_PORT: &str = "SIDECAR_PORT";
const ENV_NAMESPACE: &str = "SIDECAR_NAMESPACE";
const ENV_LOG_LEVEL: &str = "SIDECAR_LOG_LEVEL";
const ENV_REGISTRY_ADDRESS: &str = "SIDECAR_REGISTRY_ADDRESS";
const ENV_RECURSE_ENABLE: &str = "SIDECAR_RECURSE_ENABLE";
const ENV_RECURSE_TIMEOUT: &str = "SIDECAR_RECURSE_TIMEOUT";
const ENV_DNS_ENABLE: &str = "SIDECAR_DNS_ENABLE";
const ENV_DNS_SUFFIX: &str = "SIDECAR_DNS_SUFFIX";
const ENV_DNS_TTL: &str = "SIDECAR_DNS_TTL";
const ENV_DNS_ROUTE_LABELS: &str = "SIDECAR_DNS_ROUTE_LABELS";
const ENV_MESH_ENABLE: &str = "SIDECAR_MESH_ENABLE";
const ENV_MTLS_ENABLE: &str = "SIDECAR_MTLS_ENABLE";
const ENV_MTLS_CA_SERVER: &str = "SIDECAR_MTLS_CA_SERVER";
const ENV_RLS_ENABLE: &str = "SIDECAR_RLS_ENABLE";
const ENV_METRIC_ENABLE: &str = "SIDECAR_METRIC_ENABLE";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to read config file {0}: {1}")]
    Read(PathBuf, #[source] std::io::Error),
    #[error("failed to parse config file {0}: {1}")]
    Parse(PathBuf, #[source] serde_yaml::Error),
    #[error("invalid env var {0}={1}")]
    EnvVar(String, String),
    #[error("invalid flag {0}={1}")]
    Flag(&'static str, String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub namespace: String,
    pub bind: IpAddr,
    pub port: u16,
    pub log_level: Option<String>,
    pub registry: RegistryConfig,
    pub recurse: RecurseConfig,
    pub resolvers: Vec<ResolverEntry>,
    pub mesh: MeshConfig,
    pub debug: DebugConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 53,
            log_level: None,
            registry: RegistryConfig::default(),
            recurse: RecurseConfig::default(),
            resolvers: vec![ResolverEntry {
                name: discovery::NAME.to_string(),
                enable: true,
                suffix: String::new(),
                dns_ttl: default_dns_ttl(),
                options: HashMap::new(),
            }],
            mesh: MeshConfig::default(),
            debug: DebugConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub addresses: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RecurseConfig {
    pub enable: bool,
    pub timeout_sec: u64,
    pub name_servers: Vec<String>,
}

impl Default for RecurseConfig {
    fn default() -> Self {
        Self {
            enable: true,
            timeout_sec: 2,
            name_servers: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ResolverEntry {
    pub name: String,
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default)]
    pub suffix: String,
    #[serde(default = "default_dns_ttl")]
    pub dns_ttl: u32,
    #[serde(default)]
    pub options: HashMap<String, serde_yaml::Value>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct MeshConfig {
    pub metrics: MetricsConfig,
    pub ratelimit: RatelimitConfig,
    pub mtls: MtlsConfig,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enable: bool,
    pub admin_url: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RatelimitNetwork {
    #[default]
    Unix,
    Tcp,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RatelimitConfig {
    pub enable: bool,
    pub network: RatelimitNetwork,
    pub address: String,
    pub tls: Option<TlsPaths>,
}

impl Default for RatelimitConfig {
    fn default() -> Self {
        Self {
            enable: false,
            network: RatelimitNetwork::Unix,
            address: "/var/run/polaris-sidecar/rls.sock".to_string(),
            tls: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TlsPaths {
    pub cert_file: String,
    pub key_file: String,
}

impl TlsPaths {
    pub async fn load(&self) -> std::io::Result<(String, String)> {
        let cert = tokio::fs::read_to_string(&self.cert_file).await?;
        let key = tokio::fs::read_to_string(&self.key_file).await?;
        Ok((cert, key))
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct MtlsConfig {
    pub enable: bool,
    pub ca_server: String,
    pub address: String,
    pub service_account: String,
    pub rotate_period_sec: u64,
    pub failed_retry_delay_sec: u64,
    pub cert_ttl_sec: u64,
}

impl Default for MtlsConfig {
    fn default() -> Self {
        Self {
            enable: false,
            ca_server: String::new(),
            address: "/var/run/polaris-sidecar/sds.sock".to_string(),
            service_account: "default".to_string(),
            rotate_period_sec: 1800,
            failed_retry_delay_sec: 10,
            cert_ttl_sec: 86_400,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct DebugConfig {
    pub enable: bool,
    pub port: u16,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            enable: true,
            port: 50_000,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_dns_ttl() -> u32 {
    10
}

/// Command-line overrides; the highest-precedence configuration layer.
#[derive(Clone, Debug, Default)]
pub struct BootOverrides {
    pub config_path: Option<PathBuf>,
    pub bind: Option<IpAddr>,
    pub port: Option<u16>,
    pub log_level: Option<String>,
    pub recurse_enabled: Option<bool>,
}

impl BootOverrides {
    pub fn from_args<I: Iterator<Item = String>>(args: I) -> Result<Self, Error> {
        let mut overrides = Self::default();
        let mut args = args;
        while let Some(arg) = args.next() {
            let (flag, inline_value) = match arg.split_once('=') {
                Some((flag, value)) => (flag.to_string(), Some(value.to_string())),
                None => (arg, None),
            };
            let mut value = |name: &'static str| -> Result<String, Error> {
                inline_value
                    .clone()
                    .or_else(|| args.next())
                    .ok_or(Error::Flag(name, "<missing>".to_string()))
            };
            match flag.as_str() {
                "-c" | "--config" => overrides.config_path = Some(PathBuf::from(value("config")?)),
                "--bind" => {
                    let raw = value("bind")?;
                    overrides.bind = Some(raw.parse().map_err(|_| Error::Flag("bind", raw))?);
                }
                "--port" => {
                    let raw = value("port")?;
                    overrides.port = Some(raw.parse().map_err(|_| Error::Flag("port", raw))?);
                }
                "--log-level" => overrides.log_level = Some(value("log-level")?),
                "--recurse-enabled" => {
                    let raw = value("recurse-enabled")?;
                    overrides.recurse_enabled =
                        Some(raw.parse().map_err(|_| Error::Flag("recurse-enabled", raw))?);
                }
                other => {
                    return Err(Error::Flag("unknown", other.to_string()));
                }
            }
        }
        Ok(overrides)
    }
}

impl Config {
    /// Loads the effective config: file, then environment, then boot flags.
    pub fn load(boot: &BootOverrides) -> Result<Config, Error> {
        let mut config = match &boot.config_path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .map_err(|e| Error::Read(path.clone(), e))?;
                serde_yaml::from_str(&raw).map_err(|e| Error::Parse(path.clone(), e))?
            }
            None => Config::default(),
        };
        config.apply_env()?;
        config.apply_boot(boot);
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), Error> {
        if let Some(bind) = env_parse(ENV_BIND)? {
            self.bind = bind;
        }
        if let Some(port) = env_parse(ENV_PORT)? {
            self.port = port;
        }
        if let Some(namespace) = env_parse::<String>(ENV_NAMESPACE)? {
            self.namespace = namespace;
        }
        if let Some(level) = env_parse::<String>(ENV_LOG_LEVEL)? {
            self.log_level = Some(level);
        }
        if let Some(addresses) = env_parse::<String>(ENV_REGISTRY_ADDRESS)? {
            self.registry.addresses = addresses
                .split(',')
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect();
        }
        if let Some(enable) = env_parse(ENV_RECURSE_ENABLE)? {
            self.recurse.enable = enable;
        }
        if let Some(timeout) = env_parse(ENV_RECURSE_TIMEOUT)? {
            self.recurse.timeout_sec = timeout;
        }
        for entry in &mut self.resolvers {
            if entry.name == discovery::NAME {
                if let Some(enable) = env_parse(ENV_DNS_ENABLE)? {
                    entry.enable = enable;
                }
                if let Some(suffix) = env_parse::<String>(ENV_DNS_SUFFIX)? {
                    entry.suffix = suffix;
                }
                if let Some(ttl) = env_parse(ENV_DNS_TTL)? {
                    entry.dns_ttl = ttl;
                }
                if let Some(labels) = env_parse::<String>(ENV_DNS_ROUTE_LABELS)? {
                    entry
                        .options
                        .insert("route_labels".to_string(), serde_yaml::Value::String(labels));
                }
            }
        }
        let mesh_enable: Option<bool> = env_parse(ENV_MESH_ENABLE)?;
        if let Some(enable) = env_parse(ENV_MTLS_ENABLE)?.or(mesh_enable) {
            self.mesh.mtls.enable = enable;
        }
        if let Some(ca_server) = env_parse::<String>(ENV_MTLS_CA_SERVER)? {
            self.mesh.mtls.ca_server = ca_server;
        }
        if let Some(enable) = env_parse(ENV_RLS_ENABLE)?.or(mesh_enable) {
            self.mesh.ratelimit.enable = enable;
        }
        if let Some(enable) = env_parse(ENV_METRIC_ENABLE)?.or(mesh_enable) {
            self.mesh.metrics.enable = enable;
        }
        Ok(())
    }

    fn apply_boot(&mut self, boot: &BootOverrides) {
        if let Some(bind) = boot.bind {
            self.bind = bind;
        }
        if let Some(port) = boot.port {
            self.port = port;
        }
        if let Some(level) = &boot.log_level {
            self.log_level = Some(level.clone());
        }
        if let Some(enable) = boot.recurse_enabled {
            self.recurse.enable = enable;
        }
    }

    fn validate(&self) -> Result<(), Error> {
        if self.namespace.is_empty() {
            return Err(Error::Invalid("namespace must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(Error::Invalid("port must not be 0".to_string()));
        }
        if self.registry.addresses.is_empty() {
            return Err(Error::Invalid(
                "registry.addresses must not be empty".to_string(),
            ));
        }
        if self.recurse.enable && self.recurse.timeout_sec == 0 {
            return Err(Error::Invalid(
                "recurse.timeout_sec must be at least 1".to_string(),
            ));
        }
        for entry in &self.resolvers {
            if entry.name != discovery::NAME && entry.name != meshproxy::NAME {
                return Err(Error::Invalid(format!("unknown resolver {}", entry.name)));
            }
        }
        if self.mesh.mtls.enable && self.mesh.mtls.ca_server.is_empty() {
            return Err(Error::Invalid(
                "mesh.mtls.ca_server is required when mtls is enabled".to_string(),
            ));
        }
        if self.mesh.ratelimit.enable
            && self.mesh.ratelimit.network == RatelimitNetwork::Tcp
            && self.mesh.ratelimit.address.parse::<SocketAddr>().is_err()
        {
            return Err(Error::Invalid(format!(
                "mesh.ratelimit.address {} is not a tcp bind address",
                self.mesh.ratelimit.address
            )));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    /// Whether the sidecar's DNS socket owns loopback from the host's point
    /// of view; governs the recursor's self-recursion guard.
    pub fn bind_localhost(&self) -> bool {
        self.bind.is_loopback() || self.bind.is_unspecified()
    }
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>, Error> {
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| Error::EnvVar(key.to_string(), value)),
        Err(_) => Ok(None),
    }
}

/// Parses `"k1:v1,k2:v2"` into a map; malformed pairs are skipped.
pub fn parse_labels(labels: &str) -> HashMap<String, String> {
    let mut values = HashMap::new();
    for token in labels.split(',') {
        if let Some((key, value)) = token.split_once(':') {
            if !key.is_empty() {
                values.insert(key.to_string(), value.to_string());
            }
        }
    }
    values
}
