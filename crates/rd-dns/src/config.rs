//! Server configuration and spec parsing.
//!
//! A `Config` is assembled once at startup and immutable afterwards. The
//! parse helpers turn the flag syntaxes (`host[:port]` lists,
//! `domain[,domain]/host[:port][,host[:port]]` stub specs) into typed
//! values, failing with a `ConfigError` that is fatal at startup.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Default DNS port used when a spec omits one.
pub const DEFAULT_DNS_PORT: u16 = 53;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid listen address '{0}'")]
    InvalidListenAddr(String),
    #[error("invalid nameserver '{0}'")]
    InvalidNameserver(String),
    #[error("invalid search domain '{0}'")]
    InvalidSearchDomain(String),
    #[error("invalid stub zone spec '{0}'")]
    InvalidStubZone(String),
}

/// A suffix-matched routing rule overriding the default upstreams.
#[derive(Debug, Clone)]
pub struct StubZone {
    /// Zone suffix, lowercased, no trailing dot.
    pub zone: String,
    pub servers: Vec<SocketAddr>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    /// Ordered default upstreams.
    pub nameservers: Vec<SocketAddr>,
    pub stub_zones: Vec<StubZone>,
    /// Lowercased, no trailing dot.
    pub search_domains: Vec<String>,
    /// Minimum label count (minus one) before an initial absolute lookup.
    pub ndots: usize,
    /// Minimum label count (minus one) before forwarding at all.
    pub fwd_ndots: usize,
    pub enable_search: bool,
    pub no_rec: bool,
    pub round_robin: bool,
    /// Per-exchange upstream timeout.
    pub read_timeout: Duration,
    /// Response cache capacity; 0 disables caching.
    pub rcache_cap: usize,
    /// Upper bound for response cache entry lifetime.
    pub rcache_ttl: Duration,
    /// TTL stamped on answers served from the hosts overlay.
    pub host_ttl: u32,
    pub hostsfile: Option<PathBuf>,
    pub hostsfile_dir: Option<PathBuf>,
    /// Hosts change-detection interval; zero disables polling.
    pub poll_interval: Duration,
    /// Register this resolver in /etc/resolv.conf for the lifetime of the
    /// process.
    pub default_resolver: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], DEFAULT_DNS_PORT)),
            nameservers: Vec::new(),
            stub_zones: Vec::new(),
            search_domains: Vec::new(),
            ndots: 1,
            fwd_ndots: 0,
            enable_search: false,
            no_rec: false,
            round_robin: false,
            read_timeout: Duration::from_secs(2),
            rcache_cap: 0,
            rcache_ttl: Duration::from_secs(60),
            host_ttl: 3600,
            hostsfile: None,
            hostsfile_dir: None,
            poll_interval: Duration::ZERO,
            default_resolver: false,
        }
    }
}

/// Parse a listen address: `host[:port]`, port defaulting to 53.
pub fn parse_listen(spec: &str) -> Result<SocketAddr, ConfigError> {
    parse_host_port(spec).ok_or_else(|| ConfigError::InvalidListenAddr(spec.to_string()))
}

/// Parse comma-separated `host[:port]` nameserver specs.
pub fn parse_nameservers(specs: &[String]) -> Result<Vec<SocketAddr>, ConfigError> {
    let mut servers = Vec::new();
    for item in split_list(specs) {
        let addr =
            parse_host_port(&item).ok_or_else(|| ConfigError::InvalidNameserver(item.clone()))?;
        servers.push(addr);
    }
    Ok(servers)
}

/// Parse comma-separated search domains, normalized to lowercase without a
/// trailing dot.
pub fn parse_search_domains(specs: &[String]) -> Result<Vec<String>, ConfigError> {
    let mut domains = Vec::new();
    for item in split_list(specs) {
        let domain = item.trim_end_matches('.').to_lowercase();
        if domain.is_empty() || domain.split('.').any(|label| label.is_empty()) {
            return Err(ConfigError::InvalidSearchDomain(item));
        }
        domains.push(domain);
    }
    Ok(domains)
}

/// Parse stub zone specs: `domain[,domain]/host[:port][,host[:port]]`.
pub fn parse_stub_zones(specs: &[String]) -> Result<Vec<StubZone>, ConfigError> {
    let mut zones = Vec::new();
    for item in specs.iter().filter(|s| !s.trim().is_empty()) {
        let (domains_part, servers_part) = item
            .split_once('/')
            .ok_or_else(|| ConfigError::InvalidStubZone(item.clone()))?;

        let mut servers = Vec::new();
        for spec in servers_part.split(',').filter(|s| !s.trim().is_empty()) {
            let addr = parse_host_port(spec.trim())
                .ok_or_else(|| ConfigError::InvalidStubZone(item.clone()))?;
            servers.push(addr);
        }
        if servers.is_empty() {
            return Err(ConfigError::InvalidStubZone(item.clone()));
        }

        let mut got_domain = false;
        for domain in domains_part.split(',').filter(|s| !s.trim().is_empty()) {
            let zone = domain.trim().trim_end_matches('.').to_lowercase();
            if zone.is_empty() {
                return Err(ConfigError::InvalidStubZone(item.clone()));
            }
            zones.push(StubZone {
                zone,
                servers: servers.clone(),
            });
            got_domain = true;
        }
        if !got_domain {
            return Err(ConfigError::InvalidStubZone(item.clone()));
        }
    }
    Ok(zones)
}

fn split_list(specs: &[String]) -> Vec<String> {
    specs
        .iter()
        .flat_map(|s| s.split(','))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse `host[:port]` into a socket address, defaulting the port to 53.
/// Accepts `1.1.1.1`, `1.1.1.1:53`, `2606:4700::1111`, `[2606:4700::1111]:53`.
fn parse_host_port(spec: &str) -> Option<SocketAddr> {
    let spec = spec.trim();
    if spec.is_empty() {
        return None;
    }
    if let Some(inner) = spec.strip_prefix('[') {
        if let Some(addr) = inner.strip_suffix(']') {
            return format!("[{}]:{}", addr, DEFAULT_DNS_PORT).parse().ok();
        }
        // [v6]:port
        return spec.parse().ok();
    }
    match spec.matches(':').count() {
        0 => format!("{}:{}", spec, DEFAULT_DNS_PORT).parse().ok(),
        1 => spec.parse().ok(),
        // Bare IPv6 address
        _ => format!("[{}]:{}", spec, DEFAULT_DNS_PORT).parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nameservers_get_default_port() {
        let servers =
            parse_nameservers(&["1.1.1.1,8.8.8.8:5353".to_string()]).unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0], "1.1.1.1:53".parse().unwrap());
        assert_eq!(servers[1], "8.8.8.8:5353".parse().unwrap());
    }

    #[test]
    fn nameservers_accept_ipv6_forms() {
        let servers = parse_nameservers(&[
            "2606:4700::1111".to_string(),
            "[2606:4700::1001]:553".to_string(),
        ])
        .unwrap();
        assert_eq!(servers[0], "[2606:4700::1111]:53".parse().unwrap());
        assert_eq!(servers[1], "[2606:4700::1001]:553".parse().unwrap());
    }

    #[test]
    fn bad_nameserver_is_rejected() {
        assert!(matches!(
            parse_nameservers(&["not-an-ip".to_string()]),
            Err(ConfigError::InvalidNameserver(_))
        ));
    }

    #[test]
    fn search_domains_are_normalized() {
        let domains =
            parse_search_domains(&["Corp.Example.,lab.test".to_string()]).unwrap();
        assert_eq!(domains, vec!["corp.example", "lab.test"]);
    }

    #[test]
    fn empty_search_domain_is_rejected() {
        assert!(parse_search_domains(&["a..b".to_string()]).is_err());
    }

    #[test]
    fn stub_zone_spec_parses_multiple_domains_and_servers() {
        let zones = parse_stub_zones(&[
            "corp.example,corp.test/10.0.0.1,10.0.0.2:5300".to_string(),
        ])
        .unwrap();
        assert_eq!(zones.len(), 2);
        assert_eq!(zones[0].zone, "corp.example");
        assert_eq!(zones[1].zone, "corp.test");
        assert_eq!(zones[0].servers[0], "10.0.0.1:53".parse().unwrap());
        assert_eq!(zones[0].servers[1], "10.0.0.2:5300".parse().unwrap());
    }

    #[test]
    fn stub_zone_without_servers_is_rejected() {
        assert!(parse_stub_zones(&["corp.example/".to_string()]).is_err());
        assert!(parse_stub_zones(&["corp.example".to_string()]).is_err());
    }

    #[test]
    fn listen_defaults_port() {
        assert_eq!(
            parse_listen("127.0.0.1").unwrap(),
            "127.0.0.1:53".parse().unwrap()
        );
        assert_eq!(
            parse_listen("0.0.0.0:5353").unwrap(),
            "0.0.0.0:5353".parse().unwrap()
        );
    }
}
