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

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use hickory_client::client::{Client, ClientHandle};
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use hickory_proto::runtime::iocompat::AsyncIoTokioAsStd;
use hickory_proto::runtime::TokioRuntimeProvider;
use hickory_proto::serialize::binary::{BinDecodable, BinEncoder};
use hickory_proto::tcp::TcpClientStream;
use hickory_proto::udp::UdpClientStream;
use hickory_proto::xfer::{DnsResponse, Protocol};
use hickory_server::authority::{MessageRequest, MessageResponse};
use hickory_server::server::{Request, ResponseHandler, ResponseInfo};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;

use crate::dns::resolver::ResolveContext;

/// A short-hand helper for constructing a [Name].
pub fn n<S: AsRef<str>>(name: S) -> Name {
    Name::from_utf8(name).unwrap()
}

/// Creates an A record for the name and IP.
pub fn a(name: Name, addr: Ipv4Addr) -> Record {
    Record::from_rdata(name, 10, RData::A(A(addr)))
}

/// Creates an AAAA record for the name and IP.
pub fn aaaa(name: Name, addr: Ipv6Addr) -> Record {
    Record::from_rdata(name, 10, RData::AAAA(AAAA(addr)))
}

pub fn resolve_ctx() -> ResolveContext {
    ResolveContext {
        protocol: Protocol::Udp,
    }
}

/// Converts a [Message] into a server-side [Request].
pub fn server_request(msg: &Message, client_addr: SocketAddr, protocol: Protocol) -> Request {
    let wire_bytes = msg.to_vec().unwrap();
    let msg_request = MessageRequest::from_bytes(&wire_bytes).unwrap();
    Request::new(msg_request, client_addr, protocol)
}

/// A [ResponseHandler] that decodes every written response back into a
/// [Message] and hands it to the test.
#[derive(Clone)]
pub struct CaptureHandler {
    sender: mpsc::UnboundedSender<Message>,
}

impl CaptureHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl ResponseHandler for CaptureHandler {
    async fn send_response<'a>(
        &mut self,
        response: MessageResponse<
            '_,
            'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
        >,
    ) -> std::io::Result<ResponseInfo> {
        let mut buf = Vec::with_capacity(512);
        let mut encoder = BinEncoder::new(&mut buf);
        encoder.set_max_size(u16::MAX);
        let info = response.destructive_emit(&mut encoder)?;
        let msg = Message::from_vec(&buf)?;
        let _ = self.sender.send(msg);
        Ok(info)
    }
}

/// Creates a DNS client speaking TCP to the nameserver at the given address.
pub async fn new_tcp_client(addr: SocketAddr) -> Client {
    let (stream, sender) = TcpClientStream::<AsyncIoTokioAsStd<TcpStream>>::new(
        addr,
        None,
        None,
        TokioRuntimeProvider::new(),
    );
    let (client, bg) = Client::new(Box::new(stream), sender, None).await.unwrap();
    tokio::spawn(bg);
    client
}

/// Creates a DNS client speaking UDP to the nameserver at the given address.
pub async fn new_udp_client(addr: SocketAddr) -> Client {
    let stream =
        UdpClientStream::<TokioRuntimeProvider>::builder(addr, TokioRuntimeProvider::new()).build();
    let (client, bg) = Client::connect(stream).await.unwrap();
    tokio::spawn(bg);
    client
}

/// Sends a query via the client.
pub async fn send_request<C: ClientHandle>(
    client: &mut C,
    name: Name,
    rr_type: RecordType,
) -> DnsResponse {
    client.query(name, DNSClass::IN, rr_type).await.unwrap()
}

/// Runs a fake upstream nameserver answering every question with the given
/// rcode (and optionally one A record). Returns its address.
pub async fn run_upstream(rcode: ResponseCode, answer: Option<Ipv4Addr>) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let Ok(query) = Message::from_vec(&buf[..len]) else {
                continue;
            };
            let mut response = Message::new();
            response
                .set_id(query.id())
                .set_message_type(MessageType::Response)
                .set_op_code(OpCode::Query)
                .set_recursion_desired(query.recursion_desired())
                .set_recursion_available(true)
                .set_response_code(rcode);
            if let Some(query) = query.queries().first() {
                response.add_query(query.clone());
                if let Some(ip) = answer {
                    response.add_answer(a(query.name().clone(), ip));
                }
            }
            let _ = socket
                .send_to(&response.to_vec().unwrap(), peer)
                .await;
        }
    });
    addr
}
