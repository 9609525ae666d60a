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

//! Request dispatch: resolver chain first, recursive fallback second,
//! SERVFAIL last. The handler owns response flags and EDNS mirroring;
//! message framing (truncation to the advertised size) is applied by the
//! server's encoder per transport.

use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use hickory_proto::op::{Edns, Header, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::opt::{ClientSubnet, EdnsCode, EdnsOption};
use hickory_proto::rr::{Name, Record, RecordType};
use hickory_proto::xfer::Protocol;
use hickory_server::authority::{MessageResponse, MessageResponseBuilder};
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use tracing::{debug, error, warn};

use crate::dns::recursor;
use crate::dns::resolver::{Answer, NamingResolver, Question, ResolveContext};

/// Upstream fallback consulted after every resolver returned nil.
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// The search domains the handler strips before consulting resolvers.
    fn search(&self) -> &[String];

    async fn forward(
        &self,
        protocol: Protocol,
        name: &Name,
        qtype: RecordType,
        edns: Option<&Edns>,
    ) -> Option<hickory_proto::op::Message>;
}

#[async_trait]
impl Forwarder for recursor::Proxy {
    fn search(&self) -> &[String] {
        self.search()
    }

    async fn forward(
        &self,
        protocol: Protocol,
        name: &Name,
        qtype: RecordType,
        edns: Option<&Edns>,
    ) -> Option<hickory_proto::op::Message> {
        self.resolve(protocol, name, qtype, edns).await
    }
}

/// The shared request handler behind both the UDP and TCP listeners.
#[derive(Clone)]
pub struct Handler {
    resolvers: Arc<Vec<Arc<dyn NamingResolver>>>,
    forwarder: Option<Arc<dyn Forwarder>>,
}

impl Handler {
    pub fn new(
        resolvers: Vec<Arc<dyn NamingResolver>>,
        forwarder: Option<Arc<dyn Forwarder>>,
    ) -> Self {
        Self {
            resolvers: Arc::new(resolvers),
            forwarder,
        }
    }

    /// Strips the first matching search domain from the query name, so that
    /// resolvers see the bare service name even when the client's stub
    /// resolver already appended its search list.
    fn preprocess(&self, qname: &str) -> String {
        let Some(forwarder) = &self.forwarder else {
            return qname.to_string();
        };
        for search in forwarder.search() {
            let suffix = format!(".{}", search);
            if let Some(stripped) = qname.strip_suffix(&suffix) {
                if stripped.is_empty() {
                    return qname.to_string();
                }
                return stripped.to_string();
            }
        }
        qname.to_string()
    }

    async fn dispatch<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: R,
    ) -> ResponseInfo {
        match request.message_type() {
            MessageType::Query => match request.op_code() {
                OpCode::Query => self.serve(request, response_handle).await,
                code => {
                    warn!(op_code = ?code, "unimplemented op_code");
                    send_code(request, response_handle, ResponseCode::NotImp).await
                }
            },
            MessageType::Response => {
                warn!(id = request.id(), "got a response as a request");
                send_code(request, response_handle, ResponseCode::FormErr).await
            }
        }
    }

    async fn serve<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: R,
    ) -> ResponseInfo {
        let info = match request.request_info() {
            Ok(info) => info,
            Err(_) => return send_code(request, response_handle, ResponseCode::Refused).await,
        };
        let qtype = info.query.query_type();
        let name = info.query.original().name().clone();

        if can_resolve(qtype) {
            let qname = self.preprocess(&name.to_utf8());
            debug!(%qname, raw = %name, %qtype, "serving question");
            let ctx = ResolveContext {
                protocol: request.protocol(),
            };
            let question = Question {
                name: name.clone(),
                qtype,
            };
            for resolver in self.resolvers.iter() {
                if let Some(answer) = resolver.serve_dns(&ctx, &question, &qname).await {
                    debug!(resolver = resolver.name(), count = answer.records().len(), "resolved");
                    return write_answer(request, response_handle, &answer).await;
                }
            }
        }

        if let Some(forwarder) = &self.forwarder {
            if let Some(response) = forwarder
                .forward(request.protocol(), &name, qtype, request.edns())
                .await
            {
                return write_forwarded(request, response_handle, &response).await;
            }
        }
        send_code(request, response_handle, ResponseCode::ServFail).await
    }
}

#[async_trait]
impl RequestHandler for Handler {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: R,
    ) -> ResponseInfo {
        // A panicking resolver must not take the serving task down with it.
        match AssertUnwindSafe(self.dispatch(request, response_handle))
            .catch_unwind()
            .await
        {
            Ok(info) => info,
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(%reason, backtrace = %Backtrace::force_capture(), "panic while serving request");
                let mut header = Header::new();
                header.set_response_code(ResponseCode::ServFail);
                header.into()
            }
        }
    }
}

fn can_resolve(qtype: RecordType) -> bool {
    matches!(qtype, RecordType::A | RecordType::AAAA | RecordType::SRV)
}

async fn write_answer<R: ResponseHandler>(
    request: &Request,
    response_handle: R,
    answer: &Answer,
) -> ResponseInfo {
    let mut header = Header::response_from_request(request.header());
    header.set_authoritative(true);
    header.set_recursion_available(true);
    header.set_response_code(answer.response_code());

    let mut builder = MessageResponseBuilder::from_message_request(request);
    if let Some(edns) = response_edns(request, answer.response_code(), false) {
        builder.edns(edns);
    }
    let response = builder.build(
        header,
        answer.records().iter(),
        None.iter(),
        None.iter(),
        None.iter(),
    );
    send_response(response, response_handle).await
}

async fn write_forwarded<R: ResponseHandler>(
    request: &Request,
    response_handle: R,
    upstream: &hickory_proto::op::Message,
) -> ResponseInfo {
    let rcode = upstream.response_code();
    let mut header = Header::response_from_request(request.header());
    header.set_authoritative(true);
    header.set_recursion_available(true);
    header.set_response_code(rcode);
    header.set_truncated(upstream.truncated());

    let mut builder = MessageResponseBuilder::from_message_request(request);
    if let Some(edns) = response_edns(request, rcode, false) {
        builder.edns(edns);
    }
    let response = builder.build(
        header,
        upstream.answers().iter(),
        upstream.name_servers().iter(),
        None.iter(),
        upstream.additionals().iter(),
    );
    send_response(response, response_handle).await
}

async fn send_code<R: ResponseHandler>(
    request: &Request,
    response_handle: R,
    code: ResponseCode,
) -> ResponseInfo {
    let mut header = Header::response_from_request(request.header());
    header.set_recursion_available(true);
    header.set_response_code(code);

    let mut builder = MessageResponseBuilder::from_message_request(request);
    if let Some(edns) = response_edns(request, code, true) {
        builder.edns(edns);
    }
    let response = builder.build_no_records(header);
    send_response(response, response_handle).await
}

/// Mirrors the request's EDNS into the response: the advertised UDP size,
/// the version, and the client-subnet option. The subnet scope is zeroed for
/// globally valid replies (and all error codes); otherwise the reply is only
/// valid for the subnet it was queried with.
fn response_edns(request: &Request, rcode: ResponseCode, ecs_global: bool) -> Option<Edns> {
    let req_edns = request.edns()?;
    let mut resp_edns = Edns::new();
    resp_edns.set_max_payload(req_edns.max_payload());
    resp_edns.set_version(req_edns.version());

    if let Some(EdnsOption::Subnet(subnet)) = req_edns.option(EdnsCode::Subnet) {
        let scope = if ecs_global
            || matches!(
                rcode,
                ResponseCode::NXDomain
                    | ResponseCode::ServFail
                    | ResponseCode::Refused
                    | ResponseCode::NotImp
            ) {
            0
        } else {
            subnet.source_prefix()
        };
        let mirrored = ClientSubnet::new(subnet.addr(), subnet.source_prefix(), scope);
        resp_edns.options_mut().insert(EdnsOption::Subnet(mirrored));
    }
    Some(resp_edns)
}

async fn send_response<'a, R: ResponseHandler>(
    response: MessageResponse<
        '_,
        'a,
        impl Iterator<Item = &'a Record> + Send + 'a,
        impl Iterator<Item = &'a Record> + Send + 'a,
        impl Iterator<Item = &'a Record> + Send + 'a,
        impl Iterator<Item = &'a Record> + Send + 'a,
    >,
    mut response_handle: R,
) -> ResponseInfo {
    match response_handle.send_response(response).await {
        Ok(info) => info,
        Err(e) => {
            error!(err = %e, "failed to write dns response");
            let mut header = Header::new();
            header.set_response_code(ResponseCode::ServFail);
            header.into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::resolver::{Answer, DebugRoute};
    use crate::test_helpers::dns::{a, n, server_request, CaptureHandler};
    use hickory_proto::op::{Message, Query};
    use hickory_proto::rr::DNSClass;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FixedResolver {
        name: &'static str,
        answer: Option<Vec<Record>>,
        calls: Arc<Mutex<Vec<&'static str>>>,
        seen_qnames: Mutex<Vec<String>>,
    }

    impl FixedResolver {
        fn new(
            name: &'static str,
            answer: Option<Vec<Record>>,
            calls: Arc<Mutex<Vec<&'static str>>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                name,
                answer,
                calls,
                seen_qnames: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl NamingResolver for FixedResolver {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn serve_dns(
            &self,
            _ctx: &ResolveContext,
            _question: &Question,
            qname: &str,
        ) -> Option<Answer> {
            self.calls.lock().unwrap().push(self.name);
            self.seen_qnames.lock().unwrap().push(qname.to_string());
            self.answer.as_ref().map(|records| Answer::new(records.clone()))
        }

        fn debug_routes(&self) -> Vec<DebugRoute> {
            Vec::new()
        }
    }

    struct PanickingResolver;

    #[async_trait]
    impl NamingResolver for PanickingResolver {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn serve_dns(
            &self,
            _ctx: &ResolveContext,
            _question: &Question,
            _qname: &str,
        ) -> Option<Answer> {
            panic!("resolver blew up");
        }
    }

    struct FakeForwarder {
        search: Vec<String>,
        response: Option<Message>,
        calls: AtomicUsize,
    }

    impl FakeForwarder {
        fn new(search: Vec<String>, response: Option<Message>) -> Arc<Self> {
            Arc::new(Self {
                search,
                response,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Forwarder for FakeForwarder {
        fn search(&self) -> &[String] {
            &self.search
        }

        async fn forward(
            &self,
            _protocol: Protocol,
            _name: &Name,
            _qtype: RecordType,
            _edns: Option<&Edns>,
        ) -> Option<Message> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.response.clone()
        }
    }

    fn query(name: &str, qtype: RecordType) -> Message {
        let mut msg = Message::new();
        msg.set_id(42)
            .set_message_type(MessageType::Query)
            .set_recursion_desired(true)
            .add_query({
                let mut q = Query::query(n(name), qtype);
                q.set_query_class(DNSClass::IN);
                q
            });
        msg
    }

    async fn run(handler: &Handler, msg: &Message) -> (ResponseInfo, Option<Message>) {
        let request = server_request(msg, "127.0.0.1:5353".parse().unwrap(), Protocol::Udp);
        let (capture, mut rx) = CaptureHandler::new();
        let info = handler.handle_request(&request, capture).await;
        (info, rx.try_recv().ok())
    }

    #[tokio::test]
    async fn first_resolver_with_answer_wins() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let miss = FixedResolver::new("miss", None, calls.clone());
        let hit = FixedResolver::new(
            "hit",
            Some(vec![a(n("orders.prod."), Ipv4Addr::new(10, 0, 0, 5))]),
            calls.clone(),
        );
        let handler = Handler::new(vec![miss, hit], None);

        let (_, response) = run(&handler, &query("orders.prod.", RecordType::A)).await;
        let response = response.expect("expected a reply");
        assert_eq!(ResponseCode::NoError, response.response_code());
        assert!(response.authoritative());
        assert!(response.recursion_available());
        assert_eq!(1, response.answers().len());
        assert_eq!(vec!["miss", "hit"], *calls.lock().unwrap());
    }

    #[tokio::test]
    async fn unsupported_qtype_bypasses_resolvers() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let resolver = FixedResolver::new(
            "hit",
            Some(vec![a(n("orders.prod."), Ipv4Addr::new(10, 0, 0, 5))]),
            calls.clone(),
        );
        let forwarder = FakeForwarder::new(vec![], None);
        let handler = Handler::new(vec![resolver], Some(forwarder.clone()));

        let (_, response) = run(&handler, &query("orders.prod.", RecordType::TXT)).await;
        assert_eq!(
            ResponseCode::ServFail,
            response.expect("expected a reply").response_code()
        );
        assert!(calls.lock().unwrap().is_empty(), "resolver chain must be skipped");
        assert_eq!(1, forwarder.calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn miss_falls_through_to_forwarder() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let miss = FixedResolver::new("miss", None, calls);

        let mut upstream = Message::new();
        upstream
            .set_message_type(MessageType::Response)
            .set_response_code(ResponseCode::NoError)
            .add_answer(a(n("www.example.com."), Ipv4Addr::new(93, 184, 216, 34)));
        let forwarder = FakeForwarder::new(vec![], Some(upstream));
        let handler = Handler::new(vec![miss], Some(forwarder));

        let (_, response) = run(&handler, &query("www.example.com.", RecordType::A)).await;
        let response = response.expect("expected forwarded reply");
        assert_eq!(ResponseCode::NoError, response.response_code());
        // Forwarded replies still carry the local server's flags.
        assert!(response.authoritative());
        assert!(response.recursion_available());
        assert_eq!(1, response.answers().len());
    }

    #[tokio::test]
    async fn total_miss_is_servfail() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let miss = FixedResolver::new("miss", None, calls);
        let handler = Handler::new(vec![miss], Some(FakeForwarder::new(vec![], None)));

        let (_, response) = run(&handler, &query("www.example.com.", RecordType::A)).await;
        assert_eq!(
            ResponseCode::ServFail,
            response.expect("expected a reply").response_code()
        );
    }

    #[tokio::test]
    async fn empty_question_is_refused() {
        let handler = Handler::new(vec![], None);
        let mut msg = Message::new();
        msg.set_id(7).set_message_type(MessageType::Query);

        let (_, response) = run(&handler, &msg).await;
        assert_eq!(
            ResponseCode::Refused,
            response.expect("expected a reply").response_code()
        );
    }

    #[tokio::test]
    async fn search_domains_are_stripped() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let resolver = FixedResolver::new(
            "hit",
            Some(vec![a(n("orders.prod."), Ipv4Addr::new(10, 0, 0, 5))]),
            calls,
        );
        let forwarder = FakeForwarder::new(vec!["svc.cluster.local.".to_string()], None);
        let handler = Handler::new(vec![resolver.clone()], Some(forwarder));

        let _ = run(
            &handler,
            &query("orders.prod.svc.cluster.local.", RecordType::A),
        )
        .await;
        assert_eq!(
            vec!["orders.prod".to_string()],
            *resolver.seen_qnames.lock().unwrap()
        );
    }

    #[tokio::test]
    async fn panicking_resolver_does_not_kill_the_handler() {
        let handler = Handler::new(vec![Arc::new(PanickingResolver)], None);

        let (info, response) = run(&handler, &query("orders.prod.", RecordType::A)).await;
        assert_eq!(ResponseCode::ServFail, info.response_code());
        assert!(response.is_none(), "panic path must not write a reply");

        // The handler keeps serving afterwards.
        let healthy = Handler::new(vec![], None);
        let (_, response) = run(&healthy, &query("orders.prod.", RecordType::A)).await;
        assert_eq!(
            ResponseCode::ServFail,
            response.expect("expected a reply").response_code()
        );
    }

    #[tokio::test]
    async fn ecs_is_mirrored_with_scope() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let resolver = FixedResolver::new(
            "hit",
            Some(vec![a(n("orders.prod."), Ipv4Addr::new(10, 0, 0, 5))]),
            calls,
        );
        let handler = Handler::new(vec![resolver], None);

        let subnet = ClientSubnet::new("192.0.2.0".parse().unwrap(), 24, 0);
        let mut msg = query("orders.prod.", RecordType::A);
        let edns = msg.extensions_mut().get_or_insert_with(Edns::new);
        edns.set_max_payload(1232);
        edns.options_mut().insert(EdnsOption::Subnet(subnet.clone()));

        // NOERROR: the reply is only valid for the subnet it was queried
        // with, so the scope echoes the source netmask.
        let (_, response) = run(&handler, &msg).await;
        let response = response.expect("expected a reply");
        let resp_edns = response.extensions().as_ref().expect("expected OPT");
        assert_eq!(1232, resp_edns.max_payload());
        let Some(EdnsOption::Subnet(mirrored)) = resp_edns.option(EdnsCode::Subnet) else {
            panic!("expected mirrored client subnet");
        };
        assert_eq!(24, mirrored.source_prefix());
        assert_eq!(24, mirrored.scope_prefix());

        // Error codes are globally valid: scope drops to zero.
        let empty = Handler::new(vec![], None);
        let (_, response) = run(&empty, &msg).await;
        let response = response.expect("expected a reply");
        assert_eq!(ResponseCode::ServFail, response.response_code());
        let resp_edns = response.extensions().as_ref().expect("expected OPT");
        let Some(EdnsOption::Subnet(mirrored)) = resp_edns.option(EdnsCode::Subnet) else {
            panic!("expected mirrored client subnet");
        };
        assert_eq!(0, mirrored.scope_prefix());
    }
}
