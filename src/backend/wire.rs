use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Backend, with_deadline};
use crate::addr::{AddressSet, QueryKey, Resolution};
use crate::config::{QueryFamily, Transport};
use crate::error::ResolveError;

const MAX_UDP_RESPONSE: usize = 4096;

/// 标准 DNS 协议后端 / Plain DNS backend over UDP or TCP.
pub struct WireBackend {
    server: SocketAddr,
    timeout: Duration,
    transport: Transport,
    family: QueryFamily,
}

impl WireBackend {
    pub fn new(server: SocketAddr, timeout: Duration, transport: Transport, family: QueryFamily) -> Self {
        Self {
            server,
            timeout,
            transport,
            family,
        }
    }

    async fn query(
        &self,
        key: &QueryKey,
        qtype: RecordType,
        deadline: Instant,
    ) -> Result<Resolution, ResolveError> {
        let id: u16 = rand::random();
        let packet = encode_query(key, qtype, id)?;

        let msg = match self.transport {
            Transport::Udp => {
                let raw = with_deadline(deadline, self.timeout, udp_exchange(self.server, &packet)).await?;
                let msg = parse_message(&raw, id)?;
                if msg.truncated() {
                    debug!(event = "udp_truncated_fallback_tcp", upstream = %self.server, qname = %key, "falling back to tcp");
                    let raw = with_deadline(deadline, self.timeout, tcp_exchange(self.server, &packet)).await?;
                    parse_message(&raw, id)?
                } else {
                    msg
                }
            }
            Transport::Tcp => {
                let raw = with_deadline(deadline, self.timeout, tcp_exchange(self.server, &packet)).await?;
                parse_message(&raw, id)?
            }
        };
        extract_resolution(&msg, key, qtype)
    }
}

#[async_trait]
impl Backend for WireBackend {
    fn label(&self) -> &str {
        "dns"
    }

    async fn resolve(&self, key: &QueryKey) -> Result<Resolution, ResolveError> {
        // A 与 AAAA 共用一个截止时间 / A and AAAA share one deadline.
        let deadline = Instant::now() + self.timeout;
        match self.family {
            QueryFamily::Ipv4 => self.query(key, RecordType::A, deadline).await,
            QueryFamily::Ipv6 => self.query(key, RecordType::AAAA, deadline).await,
            QueryFamily::Any => match self.query(key, RecordType::A, deadline).await {
                Err(ResolveError::NoAnswer(_)) => self.query(key, RecordType::AAAA, deadline).await,
                other => other,
            },
        }
    }
}

pub(crate) fn encode_query(key: &QueryKey, qtype: RecordType, id: u16) -> Result<Vec<u8>, ResolveError> {
    let mut name = Name::from_ascii(key.name()).map_err(|_| ResolveError::InvalidName(key.to_string()))?;
    name.set_fqdn(true);

    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    msg.add_query(Query::query(name, qtype));
    Ok(msg.to_vec()?)
}

fn parse_message(raw: &[u8], expected_id: u16) -> Result<Message, ResolveError> {
    let msg = Message::from_vec(raw)?;
    if msg.id() != expected_id {
        return Err(ResolveError::Malformed(format!(
            "transaction id mismatch: expected {expected_id}, got {}",
            msg.id()
        )));
    }
    if msg.message_type() != MessageType::Response {
        return Err(ResolveError::Malformed("not a response".to_string()));
    }
    Ok(msg)
}

/// Pulls addresses of `qtype` out of the answer section; TTL is the smallest
/// answer TTL.
pub(crate) fn extract_resolution(msg: &Message, key: &QueryKey, qtype: RecordType) -> Result<Resolution, ResolveError> {
    match msg.response_code() {
        ResponseCode::NoError => {}
        ResponseCode::NXDomain => return Err(ResolveError::NoAnswer(key.to_string())),
        other => {
            return Err(ResolveError::UpstreamError {
                code: u16::from(other),
            });
        }
    }

    let mut min_ttl = u32::MAX;
    let mut ips = Vec::new();
    for record in msg.answers() {
        let ip = match (qtype, record.data()) {
            (RecordType::A, Some(RData::A(a))) => IpAddr::V4(a.0),
            (RecordType::AAAA, Some(RData::AAAA(aaaa))) => IpAddr::V6(aaaa.0),
            // CNAME chains and anything else are skipped
            _ => continue,
        };
        min_ttl = min_ttl.min(record.ttl());
        ips.push(ip);
    }

    let addrs = AddressSet::from_ips(ips).ok_or_else(|| ResolveError::NoAnswer(key.to_string()))?;
    Ok(Resolution { addrs, ttl: min_ttl })
}

// 每次请求使用新 socket，结束即释放 / fresh socket per query, released on drop
async fn udp_exchange(server: SocketAddr, packet: &[u8]) -> Result<Vec<u8>, ResolveError> {
    let socket = Socket::new(Domain::for_address(server), Type::DGRAM, Some(Protocol::UDP))?;
    if let Err(e) = socket.set_recv_buffer_size(64 * 1024) {
        warn!("failed to set udp recv buffer size: {}", e);
    }
    let bind: SocketAddr = if server.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    socket.bind(&bind.into())?;
    socket.set_nonblocking(true)?;
    let sock = UdpSocket::from_std(socket.into())?;

    sock.connect(server).await?;
    sock.send(packet).await?;

    let mut buf = vec![0u8; MAX_UDP_RESPONSE];
    loop {
        let size = sock.recv(&mut buf).await?;
        // Connected socket: only the upstream can reach us, but stale replies
        // to an earlier id are still possible.
        if size >= 2 && packet.len() >= 2 && buf[..2] == packet[..2] {
            buf.truncate(size);
            return Ok(buf);
        }
        debug!(upstream = %server, size, "discarding udp datagram with foreign id");
    }
}

async fn tcp_exchange(server: SocketAddr, packet: &[u8]) -> Result<Vec<u8>, ResolveError> {
    let mut stream = TcpStream::connect(server).await?;
    stream.set_nodelay(true)?;

    let len = u16::try_from(packet.len()).map_err(|_| ResolveError::Malformed("query too large for tcp".into()))?;
    let mut out = Vec::with_capacity(2 + packet.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(packet);
    stream.write_all(&out).await?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let resp_len = u16::from_be_bytes(len_buf) as usize;
    if resp_len == 0 {
        return Err(ResolveError::Malformed("empty tcp frame".into()));
    }
    let mut buf = vec![0u8; resp_len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}
