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

use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::{Name, Record, RecordType};
use hickory_proto::xfer::Protocol;
use tokio_util::sync::CancellationToken;

/// The question being resolved: the original (case-preserving) name plus the
/// record type.
#[derive(Clone, Debug)]
pub struct Question {
    pub name: Name,
    pub qtype: RecordType,
}

/// Per-request context handed to resolvers. The transport matters downstream
/// for response sizing and for the recursive fallback.
#[derive(Clone, Copy, Debug)]
pub struct ResolveContext {
    pub protocol: Protocol,
}

/// A reply produced by a [NamingResolver]. Replies from the chain are always
/// authoritative; the handler owns flags and framing.
#[derive(Debug)]
pub struct Answer {
    records: Vec<Record>,
    response_code: ResponseCode,
}

impl Answer {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records,
            response_code: ResponseCode::NoError,
        }
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn response_code(&self) -> ResponseCode {
        self.response_code
    }
}

/// A debug endpoint exposed by a resolver through the sidecar's debug HTTP
/// server.
#[derive(Clone)]
pub struct DebugRoute {
    pub path: String,
    pub handler: Arc<dyn Fn() -> String + Send + Sync>,
}

/// One unit of the ordered resolver chain. The first resolver to return a
/// reply wins; returning `None` passes the question to the next resolver and
/// finally to the recursive fallback.
#[async_trait]
pub trait NamingResolver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Spawns any background work the resolver needs; cancelled with the
    /// supervisor token.
    fn start(&self, _ctx: CancellationToken) {}

    /// Resolves one question. `qname` is the preprocessed (search-domain
    /// stripped) query name; `question.name` keeps the original for record
    /// synthesis.
    async fn serve_dns(
        &self,
        ctx: &ResolveContext,
        question: &Question,
        qname: &str,
    ) -> Option<Answer>;

    fn debug_routes(&self) -> Vec<DebugRoute> {
        Vec::new()
    }
}
