#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rd_dns::packet::{DnsMessage, RCODE_NXDOMAIN};
use rd_dns::records::{DnsRecord, RecordType};
use rd_dns::{Config, Hooks, ServerState};
use tokio::net::UdpSocket;

/// Scripted reply for one query name.
#[derive(Clone)]
pub enum Script {
    /// NOERROR with the given answer records.
    Answer(Vec<DnsRecord>),
    /// NOERROR with an empty answer section.
    NoData,
    /// An empty reply with the given rcode.
    Rcode(u8),
}

/// A scripted upstream resolver on a loopback UDP socket. Names without a
/// script are answered with NXDOMAIN. Queries are counted.
pub struct MockUpstream {
    pub addr: SocketAddr,
    queries: Arc<AtomicUsize>,
}

impl MockUpstream {
    pub async fn start(scripts: HashMap<String, Script>) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let queries = Arc::new(AtomicUsize::new(0));
        let counter = queries.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                    break;
                };
                let Ok(query) = DnsMessage::parse(&buf[..len]) else {
                    continue;
                };
                if query.questions.is_empty() {
                    continue;
                }
                counter.fetch_add(1, Ordering::SeqCst);

                let mut reply = DnsMessage::reply_to(&query);
                match scripts.get(&query.questions[0].name) {
                    Some(Script::Answer(records)) => reply.answers = records.clone(),
                    Some(Script::NoData) => {}
                    Some(Script::Rcode(rcode)) => reply.set_rcode(*rcode),
                    None => reply.set_rcode(RCODE_NXDOMAIN),
                }
                let _ = socket.send_to(&reply.encode(), peer).await;
            }
        });

        Self { addr, queries }
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

pub fn make_state(config: Config, hosts: rd_dns::hosts::HostsSource) -> Arc<ServerState> {
    Arc::new(ServerState::new(config, hosts, Hooks::default(), "test"))
}

pub fn query_bytes(id: u16, name: &str, qtype: RecordType) -> Vec<u8> {
    DnsMessage::query(id, name, qtype).encode()
}
