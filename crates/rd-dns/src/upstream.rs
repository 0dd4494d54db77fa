//! Upstream DNS clients.
//!
//! One exchange is one request/reply pair with a single nameserver over
//! UDP or TCP, bounded by the configured read timeout. Sockets are not
//! reused across exchanges.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::debug;

use crate::packet::DnsMessage;

const UDP_BUF_SIZE: usize = 4096;

/// UDP and TCP clients sharing one per-exchange timeout.
pub struct UpstreamClients {
    read_timeout: Duration,
}

impl UpstreamClients {
    pub fn new(read_timeout: Duration) -> Self {
        Self { read_timeout }
    }

    /// Send `req` to `server` and wait for the matching reply.
    pub async fn exchange(
        &self,
        req: &DnsMessage,
        server: SocketAddr,
        tcp: bool,
    ) -> Result<DnsMessage> {
        let result = if tcp {
            self.exchange_tcp(req, server).await
        } else {
            self.exchange_udp(req, server).await
        };
        result.with_context(|| format!("exchange with {}", server))
    }

    async fn exchange_udp(&self, req: &DnsMessage, server: SocketAddr) -> Result<DnsMessage> {
        let bind_addr: SocketAddr = if server.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(server).await?;
        socket.send(&req.encode()).await?;

        let mut buf = vec![0u8; UDP_BUF_SIZE];
        timeout(self.read_timeout, async {
            loop {
                let len = socket.recv(&mut buf).await?;
                match DnsMessage::parse(&buf[..len]) {
                    Ok(reply) if reply.id == req.id => return Ok(reply),
                    Ok(reply) => {
                        debug!(
                            "discarding reply with unexpected id {:#06x} from {}",
                            reply.id, server
                        );
                    }
                    Err(e) => bail!("malformed reply from {}: {}", server, e),
                }
            }
        })
        .await
        .map_err(|_| anyhow::anyhow!("timed out after {:?}", self.read_timeout))?
    }

    async fn exchange_tcp(&self, req: &DnsMessage, server: SocketAddr) -> Result<DnsMessage> {
        let dur = self.read_timeout;
        let mut stream = timeout(dur, TcpStream::connect(server)).await??;

        let msg = req.encode();
        let len_bytes = (msg.len() as u16).to_be_bytes();
        stream.write_all(&len_bytes).await?;
        stream.write_all(&msg).await?;

        let mut len_buf = [0u8; 2];
        timeout(dur, stream.read_exact(&mut len_buf)).await??;
        let reply_len = u16::from_be_bytes(len_buf) as usize;

        let mut reply_buf = vec![0u8; reply_len];
        timeout(dur, stream.read_exact(&mut reply_buf)).await??;

        let reply = DnsMessage::parse(&reply_buf)
            .map_err(|e| anyhow::anyhow!("malformed reply from {}: {}", server, e))?;
        if reply.id != req.id {
            bail!("reply id {:#06x} does not match query", reply.id);
        }
        Ok(reply)
    }
}
