//! Caching recursive DNS proxy engine.
//!
//! Queries are answered from a hosts-file overlay, a bounded TTL response
//! cache, or configured upstream recursive resolvers, with search-domain
//! expansion and stub-zone routing. The binary crate wires this engine to
//! the command line and the host system.

pub mod cache;
pub mod config;
pub mod forward;
pub mod hosts;
pub mod packet;
pub mod records;
pub mod server;
pub mod stats;
pub mod upstream;

pub use config::Config;

use std::sync::atomic::AtomicUsize;
use std::time::Instant;

use cache::ResponseCache;
use hosts::HostsSource;
use packet::DnsMessage;
use stats::Stats;
use upstream::UpstreamClients;

pub type BeforeResolve = Box<dyn Fn(&DnsMessage) + Send + Sync>;
pub type AfterResolve = Box<dyn Fn(&DnsMessage, &DnsMessage) + Send + Sync>;

/// Optional callbacks around resolution; absent hooks are bypassed.
#[derive(Default)]
pub struct Hooks {
    pub before_resolve: Option<BeforeResolve>,
    pub after_resolve: Option<AfterResolve>,
}

/// Everything a query handler needs, created once at startup and shared as
/// `Arc<ServerState>`. The config is immutable after start; the cache, the
/// hosts source and the counters are internally synchronized.
pub struct ServerState {
    pub config: Config,
    pub hosts: HostsSource,
    pub cache: ResponseCache,
    pub upstream: UpstreamClients,
    pub stats: Stats,
    pub hooks: Hooks,
    pub(crate) rr_counter: AtomicUsize,
    pub started_at: Instant,
    pub version: String,
}

impl ServerState {
    pub fn new(config: Config, hosts: HostsSource, hooks: Hooks, version: &str) -> Self {
        let cache = ResponseCache::new(config.rcache_cap, config.rcache_ttl);
        let upstream = UpstreamClients::new(config.read_timeout);
        Self {
            config,
            hosts,
            cache,
            upstream,
            stats: Stats::new(),
            hooks,
            rr_counter: AtomicUsize::new(0),
            started_at: Instant::now(),
            version: version.to_string(),
        }
    }
}
