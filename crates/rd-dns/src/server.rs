//! Request dispatcher: UDP and TCP listeners and the per-query resolution
//! chain (hosts overlay, response cache, forwarding engine).

use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::cache::CacheKey;
use crate::forward;
use crate::packet::{self, DnsMessage, RCODE_NOERROR};
use crate::records::{DnsRecord, RecordType};
use crate::ServerState;

const UDP_BUF_SIZE: usize = 4096;

/// Serve queries from a bound UDP socket until cancellation. Each datagram
/// is handled on its own task so slow upstream I/O never blocks siblings.
pub async fn run_udp_server(
    socket: UdpSocket,
    state: Arc<ServerState>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) -> Result<()> {
    let socket = Arc::new(socket);
    info!("DNS UDP server listening on {}", socket.local_addr()?);

    let mut buf = [0u8; UDP_BUF_SIZE];
    loop {
        let (len, src) = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("UDP listener shutting down");
                return Ok(());
            }
            res = socket.recv_from(&mut buf) => match res {
                Ok(r) => r,
                Err(e) => {
                    warn!("UDP recv error: {}", e);
                    continue;
                }
            }
        };

        let query = buf[..len].to_vec();
        let socket = socket.clone();
        let state = state.clone();
        tracker.spawn(async move {
            let Some(mut response) = handle_query(&state, &query, false).await else {
                return;
            };
            packet::truncate_for_udp(&mut response, packet::MAX_UDP_SIZE);
            if let Err(e) = socket.send_to(&response, src).await {
                debug!("failed to send UDP response to {}: {}", src, e);
            }
        });
    }
}

/// Serve queries from a bound TCP listener until cancellation.
pub async fn run_tcp_server(
    listener: TcpListener,
    state: Arc<ServerState>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) -> Result<()> {
    info!("DNS TCP server listening on {}", listener.local_addr()?);

    loop {
        let (stream, src) = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("TCP listener shutting down");
                return Ok(());
            }
            res = listener.accept() => match res {
                Ok(r) => r,
                Err(e) => {
                    warn!("TCP accept error: {}", e);
                    continue;
                }
            }
        };

        let state = state.clone();
        tracker.spawn(async move {
            if let Err(e) = handle_tcp_connection(stream, &state).await {
                debug!("TCP connection error from {}: {}", src, e);
            }
        });
    }
}

async fn handle_tcp_connection(mut stream: TcpStream, state: &ServerState) -> Result<()> {
    // TCP DNS: 2-byte length prefix, then the message.
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let msg_len = u16::from_be_bytes(len_buf) as usize;
    if msg_len < 12 {
        return Ok(());
    }

    let mut query = vec![0u8; msg_len];
    stream.read_exact(&mut query).await?;

    let Some(response) = handle_query(state, &query, true).await else {
        return Ok(());
    };

    stream
        .write_all(&(response.len() as u16).to_be_bytes())
        .await?;
    stream.write_all(&response).await?;
    Ok(())
}

/// Handle one raw query and encode the reply. `None` means the message was
/// unparsable and is dropped without a reply.
pub async fn handle_query(state: &ServerState, query: &[u8], tcp: bool) -> Option<Vec<u8>> {
    let req = match DnsMessage::parse(query) {
        Ok(req) if !req.questions.is_empty() => req,
        Ok(_) => {
            debug!("dropping query without a question");
            return None;
        }
        Err(e) => {
            debug!("dropping malformed query: {}", e);
            return None;
        }
    };

    if let Some(hook) = &state.hooks.before_resolve {
        hook(&req);
    }

    let mut resp = resolve(state, &req, tcp).await;
    resp.set_recursion_available(true);

    if let Some(hook) = &state.hooks.after_resolve {
        hook(&req, &resp);
    }

    Some(resp.encode())
}

async fn resolve(state: &ServerState, req: &DnsMessage, tcp: bool) -> DnsMessage {
    let question = &req.questions[0];
    let name = &question.name;

    // Reverse zone: answer PTR from the overlay, forward otherwise.
    if is_reverse_zone(name) {
        if let Some(domain) = state.hosts.find_reverse(name).await {
            debug!("answering PTR for '{}' from hosts", name);
            let mut m = DnsMessage::reply_to(req);
            m.set_authoritative(false);
            m.answers
                .push(DnsRecord::ptr(name, &domain, state.config.host_ttl));
            return m;
        }
        return forward::forward(state, req, tcp).await;
    }

    // Hosts overlay.
    if matches!(
        question.qtype,
        RecordType::A | RecordType::Aaaa | RecordType::Any
    ) {
        let ips = state.hosts.find_hosts(name).await;
        let matching: Vec<IpAddr> = ips
            .into_iter()
            .filter(|ip| match question.qtype {
                RecordType::A => ip.is_ipv4(),
                RecordType::Aaaa => ip.is_ipv6(),
                _ => true,
            })
            .collect();
        if !matching.is_empty() {
            return answer_from_hosts(state, req, matching);
        }
    }

    // Response cache.
    let key = CacheKey::new(name, question.qtype, question.qclass, tcp);
    if state.cache.enabled() {
        if let Some(mut cached) = state.cache.get(&key) {
            state.stats.cache_hit.fetch_add(1, Ordering::Relaxed);
            debug!("cache hit for '{}' {}", name, question.qtype);
            cached.id = req.id;
            return cached;
        }
        state.stats.cache_miss.fetch_add(1, Ordering::Relaxed);
    }

    let resp = forward::forward(state, req, tcp).await;
    if resp.rcode() == RCODE_NOERROR && !resp.truncated() {
        state.cache.insert(key, &resp);
    }
    resp
}

fn answer_from_hosts(state: &ServerState, req: &DnsMessage, mut ips: Vec<IpAddr>) -> DnsMessage {
    if state.config.round_robin && ips.len() > 1 {
        let rot = state.rr_counter.fetch_add(1, Ordering::Relaxed) % ips.len();
        ips.rotate_left(rot);
    }

    let name = &req.questions[0].name;
    let mut m = DnsMessage::reply_to(req);
    m.set_authoritative(true);
    for ip in ips {
        m.answers
            .push(DnsRecord::addr(name, ip, state.config.host_ttl));
    }
    debug!(
        "answering '{}' from hosts with {} records",
        name,
        m.answers.len()
    );
    m
}

fn is_reverse_zone(name: &str) -> bool {
    name == "in-addr.arpa"
        || name.ends_with(".in-addr.arpa")
        || name == "ip6.arpa"
        || name.ends_with(".ip6.arpa")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverse_zone_detection() {
        assert!(is_reverse_zone("5.0.0.10.in-addr.arpa"));
        assert!(is_reverse_zone("1.0.0.0.ip6.arpa"));
        assert!(!is_reverse_zone("in-addr.arpa.example.com"));
        assert!(!is_reverse_zone("example.com"));
    }
}
