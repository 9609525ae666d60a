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

//! Query-name parsing: suffix matching and the `<service>.<namespace>.<suffix>`
//! split used by the discovery resolver.

use std::net::IpAddr;

use crate::registry::{ServiceKey, SERVER_NAMESPACE, SYS_NAMESPACE_ALIAS};

/// Label that marks a self-encoded address name, e.g.
/// `7f000001._addr.orders.prod.`.
pub const ADDR_LABEL: &str = "_addr";

/// Appends the trailing dot if the name does not already carry one.
pub fn canonicalize(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{name}.")
    }
}

/// Removes the trailing dot if present.
pub fn trim_dot(name: &str) -> &str {
    name.strip_suffix('.').unwrap_or(name)
}

/// Matches `suffix` against the end of `qname` (both canonicalized,
/// case-insensitively) and returns the remainder. An empty suffix matches
/// everything and leaves the name untouched.
pub fn match_suffix(qname: &str, suffix: &str) -> (String, bool) {
    if suffix.is_empty() {
        return (qname.to_string(), true);
    }
    let qname = canonicalize(qname);
    let suffix = canonicalize(suffix);
    if !qname.to_ascii_lowercase().ends_with(&suffix.to_ascii_lowercase()) {
        return (qname, false);
    }
    let stripped = qname[..qname.len() - suffix.len()].to_string();
    (stripped, true)
}

/// Splits a query name into a [ServiceKey]. The name must end with `suffix`;
/// the remainder is split on its last dot into `<service>.<namespace>`. A
/// remainder without a dot uses `current_ns`. The `polaris` namespace alias
/// is rewritten to the registry's reserved namespace.
pub fn parse_qname(qname: &str, suffix: &str, current_ns: &str) -> Option<ServiceKey> {
    let (stripped, matched) = match_suffix(qname, suffix);
    if !matched {
        return None;
    }
    let remainder = trim_dot(&stripped);
    if remainder.is_empty() {
        return None;
    }
    let (service, namespace) = match remainder.rfind('.') {
        None => (remainder, current_ns),
        Some(idx) => (&remainder[..idx], &remainder[idx + 1..]),
    };
    if service.is_empty() || namespace.is_empty() {
        return None;
    }
    let namespace = if namespace.eq_ignore_ascii_case(SYS_NAMESPACE_ALIAS) {
        SERVER_NAMESPACE
    } else {
        namespace
    };
    Some(ServiceKey::new(namespace, service))
}

/// Encodes an instance address as a resolvable fake FQDN:
/// `<hex(ip)>._addr.<service>.<namespace>.`. Serving that name answers with
/// the embedded address and no registry lookup.
pub fn encode_ip_as_fqdn(ip: IpAddr, key: &ServiceKey) -> String {
    let hex = match ip {
        IpAddr::V4(v4) => hex_encode(&v4.octets()),
        IpAddr::V6(v6) => hex_encode(&v6.octets()),
    };
    canonicalize(&format!(
        "{hex}.{ADDR_LABEL}.{}.{}",
        key.service, key.namespace
    ))
}

/// Decodes the hex label preceding `_addr` back into an address.
pub fn decode_addr_label(label: &str) -> Option<IpAddr> {
    let bytes = hex_decode(label)?;
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}
