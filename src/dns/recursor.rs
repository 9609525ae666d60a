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

//! Recursive fallback: questions no resolver answered are forwarded to the
//! host's upstream nameservers with search-domain expansion, strict
//! round-robin rotation and per-attempt retry.

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RecordType};
use hickory_proto::xfer::Protocol;
use hickory_resolver::system_conf::read_system_conf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, info, warn};

use crate::dns::name_util::canonicalize;
use crate::dns::Error;

const RESOLV_CONF_PATH: &str = "/etc/resolv.conf";

#[derive(Clone, Debug)]
pub struct Config {
    /// Names with fewer dots than this are expanded with the search list.
    pub ndots: usize,
    /// Search domains, canonicalized with a trailing dot.
    pub search: Vec<String>,
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Attempts per expanded name.
    pub attempts: usize,
    /// Upstream nameservers as `host:53`, in priority order.
    pub upstream: Vec<String>,
}

impl Config {
    /// Builds the recursor config by merging the explicitly configured
    /// nameservers with the host's `/etc/resolv.conf`. Returns `None` when
    /// the host has no resolver config or no usable upstream remains.
    pub fn from_system(
        bind_localhost: bool,
        timeout_secs: u64,
        name_servers: &[String],
    ) -> Result<Option<Config>, Error> {
        if !Path::new(RESOLV_CONF_PATH).exists() {
            info!("{RESOLV_CONF_PATH} does not exist, recursive fallback disabled");
            return Ok(None);
        }
        let (cfg, opts) = read_system_conf().map_err(|e| Error::SystemConf(e.to_string()))?;
        let system_hosts: Vec<String> = cfg
            .name_servers()
            .iter()
            .map(|ns| ns.socket_addr.ip().to_string())
            .collect();
        let search = cfg
            .search()
            .iter()
            .map(|name| canonicalize(&name.to_utf8()))
            .collect();
        Ok(Self::from_parts(
            bind_localhost,
            timeout_secs,
            name_servers,
            &system_hosts,
            search,
            opts.ndots,
            opts.attempts,
            opts.timeout,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn from_parts(
        bind_localhost: bool,
        timeout_secs: u64,
        explicit: &[String],
        system: &[String],
        search: Vec<String>,
        ndots: usize,
        system_attempts: usize,
        system_timeout: Duration,
    ) -> Option<Config> {
        let mut upstream = Vec::new();
        let mut seen = std::collections::HashSet::new();
        // Explicitly configured nameservers take priority over the host's.
        // A loopback upstream would recurse into ourselves when we own the
        // loopback DNS socket, so it is excluded.
        for host in explicit.iter().chain(system.iter()) {
            if !seen.insert(host.clone()) {
                continue;
            }
            if bind_localhost && host == "127.0.0.1" {
                continue;
            }
            upstream.push(format!("{host}:53"));
        }
        if upstream.is_empty() {
            info!("no usable upstream nameserver, recursive fallback disabled");
            return None;
        }
        let config = Config {
            ndots: ndots.max(1),
            search,
            timeout: Duration::from_secs(timeout_secs.max(system_timeout.as_secs()).max(1)),
            attempts: system_attempts.max(upstream.len()),
            upstream,
        };
        info!(?config, "recursive fallback configured");
        Some(config)
    }
}

/// Forwards questions to the configured upstreams. Rotation is globally
/// monotonic: every attempt, from any request, advances the shared index.
pub struct Proxy {
    config: Config,
    next: Mutex<usize>,
}

impl Proxy {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            next: Mutex::new(0),
        }
    }

    pub fn search(&self) -> &[String] {
        &self.config.search
    }

    fn next_upstream(&self) -> String {
        let mut next = self.next.lock().unwrap();
        let server = self.config.upstream[*next].clone();
        *next = (*next + 1) % self.config.upstream.len();
        server
    }

    fn expand_query(&self, name: &str) -> Vec<String> {
        if name.matches('.').count() < self.config.ndots {
            return self
                .config
                .search
                .iter()
                .map(|suffix| canonicalize(&format!("{name}{suffix}")))
                .collect();
        }
        vec![name.to_string()]
    }

    /// Resolves one question upstream. Expanded names are tried in order;
    /// each is given `attempts` tries across the rotating upstreams. A
    /// truncated response is returned as-is so the client can upgrade to TCP.
    pub async fn resolve(
        &self,
        protocol: Protocol,
        name: &Name,
        qtype: RecordType,
        edns: Option<&Edns>,
    ) -> Option<Message> {
        let started = Instant::now();
        let qname = canonicalize(&name.to_utf8());
        let domains = self.expand_query(&qname);
        debug!(%qname, ?domains, "expanded recursive query");
        for domain in &domains {
            let target = match Name::from_utf8(domain) {
                Ok(target) => target,
                Err(e) => {
                    warn!(domain, err = %e, "skipping unparsable expanded name");
                    continue;
                }
            };
            let mut request = Message::new();
            request
                .set_message_type(MessageType::Query)
                .set_op_code(OpCode::Query)
                .set_recursion_desired(true)
                .add_query(Query::query(target, qtype));
            if let Some(edns) = edns {
                *request.extensions_mut() = Some(edns.clone());
            }
            for attempt in 0..self.config.attempts {
                request.set_id(rand::random::<u16>());
                let upstream = self.next_upstream();
                match tokio::time::timeout(
                    self.config.timeout,
                    exchange(&request, &upstream, protocol),
                )
                .await
                {
                    Ok(Ok(response)) => {
                        let rcode = response.response_code();
                        if rcode == ResponseCode::NoError
                            || rcode == ResponseCode::NXDomain
                            || response.truncated()
                        {
                            debug!(
                                upstream,
                                domain,
                                %rcode,
                                truncated = response.truncated(),
                                latency = ?started.elapsed(),
                                "recursive query succeeded"
                            );
                            return Some(response);
                        }
                        warn!(upstream, domain, %rcode, attempt, "retrying on upstream rcode");
                    }
                    Ok(Err(e)) => {
                        warn!(upstream, domain, err = %e, attempt, "upstream exchange failed")
                    }
                    Err(_) => warn!(upstream, domain, attempt, "upstream query timed out"),
                }
            }
        }
        None
    }
}

/// One raw exchange with an upstream over the client's transport.
async fn exchange(request: &Message, upstream: &str, protocol: Protocol) -> io::Result<Message> {
    let addr: SocketAddr = upstream
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("bad upstream {upstream}")))?;
    let bytes = request.to_vec().map_err(io::Error::other)?;
    match protocol {
        Protocol::Tcp => {
            let mut stream = TcpStream::connect(addr).await?;
            stream
                .write_all(&(bytes.len() as u16).to_be_bytes())
                .await?;
            stream.write_all(&bytes).await?;
            let mut len = [0u8; 2];
            stream.read_exact(&mut len).await?;
            let mut buf = vec![0u8; u16::from_be_bytes(len) as usize];
            stream.read_exact(&mut buf).await?;
            Message::from_vec(&buf).map_err(io::Error::other)
        }
        _ => {
            let bind: SocketAddr = if addr.is_ipv4() {
                "0.0.0.0:0".parse().unwrap()
            } else {
                "[::]:0".parse().unwrap()
            };
            let socket = UdpSocket::bind(bind).await?;
            socket.connect(addr).await?;
            socket.send(&bytes).await?;
            let mut buf = vec![0u8; u16::MAX as usize];
            loop {
                let n = socket.recv(&mut buf).await?;
                let response = Message::from_vec(&buf[..n]).map_err(io::Error::other)?;
                // A stale datagram from a previous attempt is not ours.
                if response.id() == request.id() {
                    return Ok(response);
                }
            }
        }
    }
}
