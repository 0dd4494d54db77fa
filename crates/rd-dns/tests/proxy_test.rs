//! End-to-end tests of the query resolution chain: hosts overlay, cache,
//! and forwarding against scripted upstreams.

mod helpers;

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::Ordering;
use std::time::Duration;

use helpers::{make_state, query_bytes, MockUpstream, Script};
use rd_dns::config::{parse_stub_zones, Config};
use rd_dns::hosts::HostsSource;
use rd_dns::packet::{DnsMessage, RCODE_NOERROR, RCODE_NXDOMAIN, RCODE_REFUSED};
use rd_dns::records::{DnsRecord, RData, RecordType};
use rd_dns::server::handle_query;
use tokio_util::sync::CancellationToken;

async fn hosts_from(content: &str) -> HostsSource {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hosts");
    std::fs::write(&path, content).unwrap();
    let cancel = CancellationToken::new();
    let source = HostsSource::from_file(&path, Duration::ZERO, &cancel)
        .await
        .unwrap();
    drop(dir);
    source
}

#[tokio::test]
async fn local_a_record_from_hosts() {
    let hosts = hosts_from("10.0.0.5 foo.local\n").await;
    let state = make_state(Config::default(), hosts);

    let reply = handle_query(&state, &query_bytes(0x0101, "foo.local", RecordType::A), false)
        .await
        .unwrap();
    let reply = DnsMessage::parse(&reply).unwrap();

    assert_eq!(reply.id, 0x0101);
    assert_eq!(reply.rcode(), RCODE_NOERROR);
    assert!(reply.authoritative());
    assert!(reply.recursion_available());
    assert_eq!(reply.questions[0].name, "foo.local");
    assert_eq!(reply.answers.len(), 1);
    match &reply.answers[0].rdata {
        RData::A(ip) => assert_eq!(*ip, Ipv4Addr::new(10, 0, 0, 5)),
        other => panic!("expected A rdata, got {:?}", other),
    }
}

#[tokio::test]
async fn reverse_ptr_from_hosts() {
    let hosts = hosts_from("10.0.0.5 foo.local\n").await;
    let state = make_state(Config::default(), hosts);

    let reply = handle_query(
        &state,
        &query_bytes(0x0202, "5.0.0.10.in-addr.arpa", RecordType::Ptr),
        false,
    )
    .await
    .unwrap();
    let reply = DnsMessage::parse(&reply).unwrap();

    assert_eq!(reply.rcode(), RCODE_NOERROR);
    assert!(!reply.authoritative());
    assert!(reply.recursion_available());
    assert_eq!(reply.answers.len(), 1);
    match &reply.answers[0].rdata {
        RData::Ptr(target) => assert_eq!(target, "foo.local"),
        other => panic!("expected PTR rdata, got {:?}", other),
    }
}

#[tokio::test]
async fn search_expansion_synthesizes_cname() {
    let upstream = MockUpstream::start(HashMap::from([(
        "wiki.corp.test".to_string(),
        Script::Answer(vec![DnsRecord::a(
            "wiki.corp.test",
            Ipv4Addr::new(1, 2, 3, 4),
            300,
        )]),
    )]))
    .await;

    let config = Config {
        nameservers: vec![upstream.addr],
        search_domains: vec!["corp.test".to_string()],
        enable_search: true,
        ndots: 5,
        ..Config::default()
    };
    let state = make_state(config, HostsSource::empty());

    let reply = handle_query(&state, &query_bytes(0x0303, "wiki", RecordType::A), false)
        .await
        .unwrap();
    let reply = DnsMessage::parse(&reply).unwrap();

    assert_eq!(reply.id, 0x0303);
    assert_eq!(reply.rcode(), RCODE_NOERROR);
    assert_eq!(reply.questions[0].name, "wiki");
    assert_eq!(reply.answers.len(), 2);

    assert_eq!(reply.answers[0].name, "wiki");
    assert_eq!(reply.answers[0].ttl, 360);
    match &reply.answers[0].rdata {
        RData::Cname(target) => assert_eq!(target, "wiki.corp.test"),
        other => panic!("expected CNAME rdata, got {:?}", other),
    }
    match &reply.answers[1].rdata {
        RData::A(ip) => assert_eq!(*ip, Ipv4Addr::new(1, 2, 3, 4)),
        other => panic!("expected A rdata, got {:?}", other),
    }

    // Only the expanded name was ever sent upstream.
    assert_eq!(upstream.query_count(), 1);
}

#[tokio::test]
async fn search_returns_nodata_after_nxdomain_chain() {
    let upstream = MockUpstream::start(HashMap::from([
        (
            "host.example.com".to_string(),
            Script::Rcode(RCODE_NXDOMAIN),
        ),
        (
            "host.example.com.a.test".to_string(),
            Script::Rcode(RCODE_NXDOMAIN),
        ),
        ("host.example.com.b.test".to_string(), Script::NoData),
    ]))
    .await;

    let config = Config {
        nameservers: vec![upstream.addr],
        search_domains: vec!["a.test".to_string(), "b.test".to_string()],
        enable_search: true,
        ndots: 1,
        fwd_ndots: 1,
        ..Config::default()
    };
    let state = make_state(config, HostsSource::empty());

    let reply = handle_query(
        &state,
        &query_bytes(0x0404, "host.example.com", RecordType::A),
        false,
    )
    .await
    .unwrap();
    let reply = DnsMessage::parse(&reply).unwrap();

    assert_eq!(reply.rcode(), RCODE_NOERROR);
    assert!(reply.answers.is_empty());
    assert_eq!(reply.questions[0].name, "host.example.com");
    // Absolute lookup plus one per search domain.
    assert_eq!(upstream.query_count(), 3);
}

#[tokio::test]
async fn search_skips_domains_already_suffixing_the_name() {
    let upstream = MockUpstream::start(HashMap::new()).await;

    let config = Config {
        nameservers: vec![upstream.addr],
        search_domains: vec!["corp.test".to_string()],
        enable_search: true,
        ndots: 1,
        ..Config::default()
    };
    let state = make_state(config, HostsSource::empty());

    let reply = handle_query(
        &state,
        &query_bytes(0x0505, "a.corp.test", RecordType::A),
        false,
    )
    .await
    .unwrap();
    let reply = DnsMessage::parse(&reply).unwrap();

    assert_eq!(reply.rcode(), RCODE_NXDOMAIN);
    // Only the absolute lookup went out; a.corp.test.corp.test was never
    // attempted.
    assert_eq!(upstream.query_count(), 1);
}

#[tokio::test]
async fn stub_zone_overrides_default_upstreams() {
    let stub = MockUpstream::start(HashMap::from([(
        "db.corp.example".to_string(),
        Script::Answer(vec![DnsRecord::aaaa(
            "db.corp.example",
            "fd00::5".parse::<Ipv6Addr>().unwrap(),
            120,
        )]),
    )]))
    .await;
    let default = MockUpstream::start(HashMap::new()).await;

    let config = Config {
        nameservers: vec![default.addr],
        stub_zones: parse_stub_zones(&[format!("corp.example/{}", stub.addr)]).unwrap(),
        ..Config::default()
    };
    let state = make_state(config, HostsSource::empty());

    let reply = handle_query(
        &state,
        &query_bytes(0x0606, "db.corp.example", RecordType::Aaaa),
        false,
    )
    .await
    .unwrap();
    let reply = DnsMessage::parse(&reply).unwrap();

    assert_eq!(reply.rcode(), RCODE_NOERROR);
    assert_eq!(reply.answers.len(), 1);
    assert_eq!(stub.query_count(), 1);
    assert_eq!(default.query_count(), 0);
    assert_eq!(state.stats.stub_forward_count.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn cache_hit_skips_the_upstream() {
    let upstream = MockUpstream::start(HashMap::from([(
        "example.com".to_string(),
        Script::Answer(vec![DnsRecord::a(
            "example.com",
            Ipv4Addr::new(93, 184, 216, 34),
            300,
        )]),
    )]))
    .await;

    let config = Config {
        nameservers: vec![upstream.addr],
        rcache_cap: 100,
        rcache_ttl: Duration::from_secs(60),
        ..Config::default()
    };
    let state = make_state(config, HostsSource::empty());

    let first = handle_query(
        &state,
        &query_bytes(0x0701, "example.com", RecordType::A),
        false,
    )
    .await
    .unwrap();
    let first = DnsMessage::parse(&first).unwrap();
    assert_eq!(first.id, 0x0701);
    assert_eq!(first.answers.len(), 1);

    let second = handle_query(
        &state,
        &query_bytes(0x0702, "example.com", RecordType::A),
        false,
    )
    .await
    .unwrap();
    let second = DnsMessage::parse(&second).unwrap();

    // The cached reply carries the new query id, same answers.
    assert_eq!(second.id, 0x0702);
    assert_eq!(second.answers.len(), 1);

    assert_eq!(upstream.query_count(), 1);
    assert_eq!(state.stats.cache_hit.load(Ordering::Relaxed), 1);
    assert_eq!(state.stats.cache_miss.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn recursion_disabled_refuses_without_exchange() {
    let upstream = MockUpstream::start(HashMap::new()).await;

    let config = Config {
        nameservers: vec![upstream.addr],
        no_rec: true,
        ..Config::default()
    };
    let state = make_state(config, HostsSource::empty());

    let reply = handle_query(
        &state,
        &query_bytes(0x0808, "example.com", RecordType::A),
        false,
    )
    .await
    .unwrap();
    let reply = DnsMessage::parse(&reply).unwrap();

    assert_eq!(reply.rcode(), RCODE_REFUSED);
    assert!(reply.answers.is_empty());
    assert_eq!(upstream.query_count(), 0);
    assert_eq!(state.stats.forward_count.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn round_robin_rotates_overlay_answers() {
    let hosts = hosts_from("10.0.0.1 multi.local\n10.0.0.2 multi.local\n").await;
    let config = Config {
        round_robin: true,
        ..Config::default()
    };
    let state = make_state(config, hosts);

    let mut first_ips = Vec::new();
    let mut second_ips = Vec::new();
    for (id, ips) in [(1u16, &mut first_ips), (2, &mut second_ips)] {
        let reply = handle_query(&state, &query_bytes(id, "multi.local", RecordType::A), false)
            .await
            .unwrap();
        let reply = DnsMessage::parse(&reply).unwrap();
        for record in &reply.answers {
            match &record.rdata {
                RData::A(ip) => ips.push(*ip),
                other => panic!("expected A rdata, got {:?}", other),
            }
        }
    }

    assert_eq!(
        first_ips,
        vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)]
    );
    assert_eq!(
        second_ips,
        vec![Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 1)]
    );
}

#[tokio::test]
async fn aaaa_query_for_v4_only_name_is_forwarded() {
    let upstream = MockUpstream::start(HashMap::from([(
        "foo.local".to_string(),
        Script::NoData,
    )]))
    .await;

    let hosts = hosts_from("10.0.0.5 foo.local\n").await;
    let config = Config {
        nameservers: vec![upstream.addr],
        ..Config::default()
    };
    let state = make_state(config, hosts);

    let reply = handle_query(
        &state,
        &query_bytes(0x0909, "foo.local", RecordType::Aaaa),
        false,
    )
    .await
    .unwrap();
    let reply = DnsMessage::parse(&reply).unwrap();

    assert_eq!(reply.rcode(), RCODE_NOERROR);
    assert!(reply.answers.is_empty());
    assert_eq!(upstream.query_count(), 1);
}

#[tokio::test]
async fn malformed_query_is_dropped() {
    let state = make_state(Config::default(), HostsSource::empty());
    assert!(handle_query(&state, &[0x00, 0x01, 0x02], false).await.is_none());
}
