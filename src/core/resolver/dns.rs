//! Direct DNS A-record queries over UDP, with a TCP retry for truncated answers.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use super::{Resolve, ResolveError};

/// Largest UDP answer we accept (EDNS-sized).
const MAX_UDP_RESPONSE: usize = 4096;

/// Queries one DNS server directly.
#[derive(Debug, Clone)]
pub struct DirectResolver {
    server: SocketAddr,
    timeout: Duration,
}

impl DirectResolver {
    pub fn new(server: SocketAddr, timeout: Duration) -> Self {
        Self { server, timeout }
    }

    fn io_error(&self, source: std::io::Error) -> ResolveError {
        ResolveError::Io {
            server: self.server.to_string(),
            source,
        }
    }

    fn protocol_error(&self, message: impl ToString) -> ResolveError {
        ResolveError::Protocol {
            server: self.server.to_string(),
            message: message.to_string(),
        }
    }

    async fn exchange_udp(&self, query: &[u8]) -> Result<Vec<u8>, ResolveError> {
        let bind: SocketAddr = if self.server.is_ipv4() {
            ([0u8; 4], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };

        let socket = UdpSocket::bind(bind).await.map_err(|e| self.io_error(e))?;
        socket
            .connect(self.server)
            .await
            .map_err(|e| self.io_error(e))?;
        socket.send(query).await.map_err(|e| self.io_error(e))?;

        let mut buf = vec![0u8; MAX_UDP_RESPONSE];
        let len = socket.recv(&mut buf).await.map_err(|e| self.io_error(e))?;
        buf.truncate(len);
        Ok(buf)
    }

    async fn exchange_tcp(&self, query: &[u8]) -> Result<Vec<u8>, ResolveError> {
        let len = u16::try_from(query.len()).map_err(|_| self.protocol_error("query too large"))?;

        let mut stream = TcpStream::connect(self.server)
            .await
            .map_err(|e| self.io_error(e))?;

        let mut framed = Vec::with_capacity(query.len() + 2);
        framed.extend_from_slice(&len.to_be_bytes());
        framed.extend_from_slice(query);
        stream
            .write_all(&framed)
            .await
            .map_err(|e| self.io_error(e))?;

        let mut len_buf = [0u8; 2];
        stream
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| self.io_error(e))?;

        let mut buf = vec![0u8; usize::from(u16::from_be_bytes(len_buf))];
        stream
            .read_exact(&mut buf)
            .await
            .map_err(|e| self.io_error(e))?;
        Ok(buf)
    }

    async fn query(&self, domain: &str) -> Result<Ipv4Addr, ResolveError> {
        let (id, query) = build_query(domain)?;

        let mut response = self.parse_response(id, &self.exchange_udp(&query).await?)?;
        if response.truncated() {
            response = self.parse_response(id, &self.exchange_tcp(&query).await?)?;
        }

        if response.response_code() != ResponseCode::NoError {
            return Err(ResolveError::NoAnswer {
                server: self.server.to_string(),
                domain: domain.to_string(),
            });
        }

        first_a_record(&response).ok_or_else(|| ResolveError::NoAnswer {
            server: self.server.to_string(),
            domain: domain.to_string(),
        })
    }

    fn parse_response(&self, id: u16, bytes: &[u8]) -> Result<Message, ResolveError> {
        let message = Message::from_bytes(bytes).map_err(|e| self.protocol_error(e))?;
        if message.id() != id || message.message_type() != MessageType::Response {
            return Err(self.protocol_error("response does not match query"));
        }
        Ok(message)
    }
}

#[async_trait]
impl Resolve for DirectResolver {
    fn label(&self) -> String {
        format!("dns:{}", self.server)
    }

    async fn resolve(&self, domain: &str) -> Result<Ipv4Addr, ResolveError> {
        timeout(self.timeout, self.query(domain))
            .await
            .map_err(|_| ResolveError::Timeout {
                server: self.server.to_string(),
                timeout: self.timeout,
            })?
    }
}

/// Builds an A query with recursion desired. Returns the message id and wire bytes.
pub(crate) fn build_query(domain: &str) -> Result<(u16, Vec<u8>), ResolveError> {
    let mut name = Name::from_ascii(domain).map_err(|_| ResolveError::InvalidDomain {
        domain: domain.to_string(),
    })?;
    name.set_fqdn(true);

    let id = query_id();
    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, RecordType::A));

    let bytes = message.to_bytes().map_err(|e| ResolveError::Protocol {
        server: "local".to_string(),
        message: e.to_string(),
    })?;
    Ok((id, bytes))
}

/// First A record in the answer section. CNAME chains are followed by the
/// upstream resolver, so any A record present belongs to the queried name.
pub(crate) fn first_a_record(message: &Message) -> Option<Ipv4Addr> {
    message.answers().iter().find_map(|record| match record.data() {
        Some(RData::A(a)) => Some(a.0),
        _ => None,
    })
}

fn query_id() -> u16 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    #[allow(clippy::cast_possible_truncation)]
    let id = (nanos ^ std::process::id().rotate_left(16)) as u16;
    id
}
