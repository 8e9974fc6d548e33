//! DNS reachability probe bound to a connection's interface.
//!
//! A connection only counts as working when a real DNS server answers a
//! query sent out of its own interface. Link state and DHCP leases are not
//! trusted.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RecordType};
use hickory_proto::serialize::binary::BinEncodable;
use netcheck_nm::NetworkService;
use rand::Rng;
use rand::seq::IndexedRandom;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, error, warn};

use crate::error::CoreError;
use crate::registry::ConnectionRecord;

const DNS_PORT: u16 = 53;
const MAX_UDP_REPLY: usize = 4096;

// ── Transport ───────────────────────────────────────────────────────

/// Why a single DNS query did not count as success.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("timed out")]
    Timeout,
    #[error("nameserver unreachable: {0}")]
    NoNameserver(String),
    #[error("domain does not exist")]
    NxDomain,
    #[error("{0}")]
    Other(String),
}

/// One query to send.
#[derive(Debug, Clone, Copy)]
pub struct ProbeTarget<'a> {
    pub nameserver: IpAddr,
    pub domain: &'a str,
    pub interface: &'a str,
}

/// Sends one `A` query out of a given interface.
#[async_trait]
pub trait DnsTransport: Send + Sync {
    async fn query(&self, target: ProbeTarget<'_>) -> Result<(), QueryError>;
}

/// Plain UDP DNS from a socket bound to the interface with `SO_BINDTODEVICE`.
#[derive(Debug, Clone)]
pub struct UdpTransport {
    timeout: Duration,
}

impl UdpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl DnsTransport for UdpTransport {
    async fn query(&self, target: ProbeTarget<'_>) -> Result<(), QueryError> {
        let (id, request) = encode_query(target.domain)?;
        let socket = bind_to_interface(target.nameserver, target.interface)
            .map_err(|e| QueryError::NoNameserver(e.to_string()))?;
        let server = SocketAddr::new(target.nameserver, DNS_PORT);

        let exchange = async {
            socket.send_to(&request, server).await?;
            let mut buf = vec![0_u8; MAX_UDP_REPLY];
            loop {
                let (len, from) = socket.recv_from(&mut buf).await?;
                if from == server {
                    buf.truncate(len);
                    return Ok::<_, io::Error>(buf);
                }
            }
        };

        let reply = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| QueryError::Timeout)?
            .map_err(|e| QueryError::NoNameserver(e.to_string()))?;
        classify_reply(id, &reply)
    }
}

fn bind_to_interface(nameserver: IpAddr, interface: &str) -> io::Result<UdpSocket> {
    let (domain, local) = match nameserver {
        IpAddr::V4(_) => (Domain::IPV4, SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))),
        IpAddr::V6(_) => (Domain::IPV6, SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))),
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.bind_device(Some(interface.as_bytes()))?;
    socket.set_nonblocking(true)?;
    socket.bind(&local.into())?;
    UdpSocket::from_std(socket.into())
}

fn encode_query(domain: &str) -> Result<(u16, Vec<u8>), QueryError> {
    let name = Name::from_ascii(domain).map_err(|e| QueryError::Other(format!("bad domain {domain}: {e}")))?;
    let id: u16 = rand::rng().random();
    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, RecordType::A));
    let bytes = message
        .to_vec()
        .map_err(|e| QueryError::Other(format!("cannot encode query: {e}")))?;
    Ok((id, bytes))
}

/// Any well-formed `NOERROR` reply counts, even with no answers.
pub(crate) fn classify_reply(expected_id: u16, reply: &[u8]) -> Result<(), QueryError> {
    let message =
        Message::from_vec(reply).map_err(|e| QueryError::Other(format!("malformed reply: {e}")))?;
    if message.id() != expected_id || message.message_type() != MessageType::Response {
        return Err(QueryError::Other("reply does not match query".into()));
    }
    match message.response_code() {
        ResponseCode::NoError => Ok(()),
        ResponseCode::NXDomain => Err(QueryError::NxDomain),
        code => Err(QueryError::Other(format!("server answered {code}"))),
    }
}

// ── Prober ──────────────────────────────────────────────────────────

/// Decides whether a connection reaches the Internet.
#[derive(Debug, Clone)]
pub struct Prober<T> {
    transport: T,
    nameservers: Vec<IpAddr>,
    queries: Vec<String>,
}

impl<T: DnsTransport> Prober<T> {
    pub fn new(transport: T, nameservers: Vec<IpAddr>, queries: Vec<String>) -> Self {
        Self {
            transport,
            nameservers,
            queries,
        }
    }

    /// Two random (nameserver, domain) pairs with distinct members.
    fn pick_pairs(&self) -> Vec<(IpAddr, &str)> {
        let mut rng = rand::rng();
        let nameservers = self.nameservers.choose_multiple(&mut rng, 2).copied();
        let queries = self.queries.choose_multiple(&mut rng, 2).map(String::as_str);
        nameservers.zip(queries).collect()
    }

    /// Probe `record`'s connection: the first query, then the second one
    /// only if the first failed. On success `record` is confirmed; on failure
    /// it is left untouched.
    pub async fn probe<S: NetworkService + ?Sized>(
        &self,
        service: &S,
        record: &mut ConnectionRecord,
    ) -> Result<bool, CoreError> {
        let connection = record.id.clone();
        let connection = connection.as_str();
        let Some(interface) = service.connection_interface(connection).await? else {
            debug!(connection, "no interface, probe fails");
            return Ok(false);
        };
        if service.gateway_ip_for(connection).await?.is_none() {
            debug!(connection, device = %interface, "no gateway, probe fails");
            return Ok(false);
        }

        for (nameserver, domain) in self.pick_pairs() {
            let target = ProbeTarget {
                nameserver,
                domain,
                interface: &interface,
            };
            match self.transport.query(target).await {
                Ok(()) => {
                    debug!(connection, device = %interface, %nameserver, domain, "DNS probe succeeded");
                    record.confirm(Utc::now());
                    return Ok(true);
                }
                Err(err) => log_failure(connection, &interface, nameserver, domain, &err),
            }
        }
        Ok(false)
    }
}

fn log_failure(connection: &str, interface: &str, nameserver: IpAddr, domain: &str, err: &QueryError) {
    match err {
        QueryError::Timeout | QueryError::NoNameserver(_) => {
            debug!(connection, device = interface, %nameserver, domain, error = %err, "DNS query failed");
        }
        QueryError::NxDomain => {
            error!(
                connection,
                device = interface,
                %nameserver,
                domain,
                "DNS query returned NXDOMAIN for a known domain, possible DNS hijacking"
            );
        }
        QueryError::Other(_) => {
            warn!(connection, device = interface, %nameserver, domain, error = %err, "DNS query failed");
        }
    }
}
