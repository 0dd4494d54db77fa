//! Forwarding engine.
//!
//! Decides whether and how a query reaches the upstream resolvers: refusal
//! preconditions, stub-zone selection, retry across upstreams, and the
//! search-domain expansion loop with its absolute-name fallback ordering.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;

use anyhow::Result;
use tracing::{debug, warn};

use crate::packet::{
    rcode_name, DnsMessage, RCODE_FORMERR, RCODE_NOERROR, RCODE_NOTIMP, RCODE_NXDOMAIN,
    RCODE_REFUSED, RCODE_SERVFAIL,
};
use crate::records::DnsRecord;
use crate::ServerState;

/// TTL of the synthetic CNAME linking a search-expanded answer back to the
/// name the client asked for.
const SEARCH_CNAME_TTL: u32 = 360;

/// Upstream attempts per lookup.
const MAX_ATTEMPTS: usize = 2;

/// Resolve `req` through the upstreams, returning exactly one reply.
pub async fn forward(state: &ServerState, req: &DnsMessage, tcp: bool) -> DnsMessage {
    let name = req.questions[0].name.clone();
    let dots = label_dots(&name);
    let config = &state.config;

    let refuse_reason = if config.no_rec {
        Some("recursion disabled")
    } else if config.nameservers.is_empty() {
        Some("no nameservers configured")
    } else if dots < config.fwd_ndots && !config.enable_search {
        Some("name too short to forward")
    } else {
        None
    };
    if let Some(reason) = refuse_reason {
        debug!("[{:#06x}] refusing query for '{}': {}", req.id, name, reason);
        return DnsMessage::error_reply(req, RCODE_REFUSED);
    }

    state.stats.forward_count.fetch_add(1, Ordering::Relaxed);

    let search_enabled = config.enable_search && !config.search_domains.is_empty();

    let mut did_absolute = false;
    let mut absolute: Option<Result<DnsMessage>> = None;

    // With enough dots in the name, try the literal name first.
    if dots >= config.ndots {
        if dots >= config.fwd_ndots {
            debug!("[{:#06x}] initial absolute lookup for '{}'", req.id, name);
            match forward_query(state, req, tcp).await {
                Ok(r) if r.rcode() == RCODE_NOERROR => {
                    debug!(
                        "[{:#06x}] absolute lookup answered: {}",
                        req.id,
                        rcode_name(r.rcode())
                    );
                    return finalize(r, req);
                }
                other => {
                    if let Err(e) = &other {
                        warn!(
                            "[{:#06x}] absolute lookup for '{}' failed: {:#}",
                            req.id, name, e
                        );
                    }
                    absolute = Some(other);
                }
            }
            did_absolute = true;
        } else {
            debug!(
                "[{:#06x}] skipping absolute lookup, '{}' too short",
                req.id, name
            );
        }
    }

    let absolute_failed = matches!(&absolute, Some(Err(_)));

    // At least one level of search when enabled and the upstreams were
    // reachable so far.
    let mut did_search = false;
    let mut search: Option<Result<DnsMessage>> = None;
    if !absolute_failed && search_enabled {
        debug!("[{:#06x}] search lookup for '{}'", req.id, name);
        match forward_search(state, req, tcp).await {
            Ok(r) if r.rcode() == RCODE_NOERROR => {
                debug!(
                    "[{:#06x}] search lookup answered: {}",
                    req.id,
                    rcode_name(r.rcode())
                );
                return finalize(r, req);
            }
            other => {
                if let Err(e) = &other {
                    warn!(
                        "[{:#06x}] search lookup for '{}' failed: {:#}",
                        req.id, name, e
                    );
                }
                search = Some(other);
            }
        }
        did_search = true;
    }

    let search_failed = matches!(&search, Some(Err(_)));

    // Absolute lookup last if search came first and didn't fail outright.
    if !search_failed && !did_absolute {
        if dots >= config.fwd_ndots {
            debug!("[{:#06x}] absolute lookup for '{}'", req.id, name);
            match forward_query(state, req, tcp).await {
                Ok(r) if r.rcode() == RCODE_NOERROR => {
                    debug!(
                        "[{:#06x}] absolute lookup answered: {}",
                        req.id,
                        rcode_name(r.rcode())
                    );
                    return finalize(r, req);
                }
                other => {
                    if let Err(e) = &other {
                        warn!(
                            "[{:#06x}] absolute lookup for '{}' failed: {:#}",
                            req.id, name, e
                        );
                    }
                    absolute = Some(other);
                }
            }
            did_absolute = true;
        } else {
            debug!(
                "[{:#06x}] skipping absolute lookup, '{}' too short",
                req.id, name
            );
        }
    }

    // No positive result. Prefer the absolute outcome, then a no-data
    // style reply carrying the last search rcode, then SERVFAIL.
    if did_absolute {
        if let Some(Ok(r)) = absolute {
            debug!(
                "[{:#06x}] returning absolute result: {}",
                req.id,
                rcode_name(r.rcode())
            );
            return finalize(r, req);
        }
    }

    if did_search {
        if let Some(Ok(r)) = search {
            debug!(
                "[{:#06x}] returning no-data response: {}",
                req.id,
                rcode_name(r.rcode())
            );
            return DnsMessage::error_reply(req, r.rcode());
        }
    }

    debug!("[{:#06x}] unable to forward query, returning SERVFAIL", req.id);
    DnsMessage::error_reply(req, RCODE_SERVFAIL)
}

/// Resolve by suffixing the name with each search domain in turn.
async fn forward_search(state: &ServerState, req: &DnsMessage, tcp: bool) -> Result<DnsMessage> {
    let name = req.questions[0].name.clone();
    let mut req_copy = req.clone();
    let mut nodata: Option<DnsMessage> = None;
    let mut search_name = String::new();
    let mut last: Option<Result<DnsMessage>> = None;

    for domain in &state.config.search_domains {
        if has_plain_suffix(&name, domain) {
            continue;
        }
        search_name = format!("{}.{}", name, domain);
        req_copy.questions[0].name = search_name.clone();

        match forward_query(state, &req_copy, tcp).await {
            Err(e) => {
                // No server currently reachable, give up.
                last = Some(Err(e));
                break;
            }
            Ok(r) => {
                let rcode = r.rcode();
                if rcode == RCODE_NOERROR && r.answers.is_empty() && !r.truncated() {
                    // NO_DATA: keep searching, otherwise a wildcard entry
                    // could hide the answer higher in the search list.
                    nodata = Some(r.clone());
                    last = Some(Ok(r));
                    continue;
                }
                let done = !matches!(rcode, RCODE_NXDOMAIN | RCODE_SERVFAIL);
                last = Some(Ok(r));
                if done {
                    break;
                }
            }
        }
    }

    // Every configured domain was already a suffix of the name.
    let Some(outcome) = last else {
        return Ok(DnsMessage::error_reply(req, RCODE_NXDOMAIN));
    };

    match outcome {
        Ok(mut r) => {
            if r.rcode() == RCODE_NOERROR {
                if !r.answers.is_empty() {
                    // The client asked about `name`; link it to the
                    // expanded form it was answered under.
                    r.answers
                        .insert(0, DnsRecord::cname(&name, &search_name, SEARCH_CNAME_TTL));
                }
            } else if let Some(nd) = nodata.take() {
                r = nd;
            }
            restore_question(&mut r, req);
            Ok(r)
        }
        Err(e) => match nodata.take() {
            Some(mut nd) => {
                restore_question(&mut nd, req);
                Ok(nd)
            }
            None => Err(e),
        },
    }
}

/// Exchange `req` with the selected upstreams, retrying once.
async fn forward_query(state: &ServerState, req: &DnsMessage, tcp: bool) -> Result<DnsMessage> {
    let name = &req.questions[0].name;
    let (servers, stub) = select_upstreams(state, name);
    if stub {
        state.stats.stub_forward_count.fetch_add(1, Ordering::Relaxed);
    }

    let mut ns_idx = 0;
    let mut last: Result<DnsMessage> = Err(anyhow::anyhow!("no upstream attempted"));

    for _ in 0..MAX_ATTEMPTS {
        let server = servers[ns_idx];
        debug!(
            "[{:#06x}] querying upstream {} for '{}'",
            req.id, server, name
        );

        last = state.upstream.exchange(req, server, tcp).await;
        match &last {
            Ok(r) => {
                debug!(
                    "[{:#06x}] rcode from {}: {}",
                    req.id,
                    server,
                    rcode_name(r.rcode())
                );
                match r.rcode() {
                    // Authoritative outcomes; SERVFAIL is worth a retry.
                    RCODE_NOERROR | RCODE_NXDOMAIN | RCODE_FORMERR | RCODE_REFUSED
                    | RCODE_NOTIMP => return last,
                    _ => {}
                }
            }
            Err(e) => {
                debug!(
                    "[{:#06x}] upstream {} failed for '{}': {:#}",
                    req.id, server, name, e
                );
            }
        }

        ns_idx = if ns_idx + 1 < servers.len() {
            ns_idx + 1
        } else {
            0
        };
    }

    last
}

/// Pick the upstream list for a name: the longest matching stub zone, or
/// the default nameservers. Returns whether a stub zone matched.
fn select_upstreams<'a>(state: &'a ServerState, name: &str) -> (&'a [SocketAddr], bool) {
    let mut best: Option<&'a crate::config::StubZone> = None;
    for stub in &state.config.stub_zones {
        if !is_suffix(name, &stub.zone) {
            continue;
        }
        match best {
            Some(b) if b.zone.len() >= stub.zone.len() => {}
            _ => best = Some(stub),
        }
    }
    match best {
        Some(stub) => (&stub.servers, true),
        None => (&state.config.nameservers, false),
    }
}

/// Number of dots in a name (label count minus one for absolute names).
fn label_dots(name: &str) -> usize {
    name.matches('.').count()
}

/// Raw string-suffix test used to skip search domains the name already
/// ends with. No label-boundary requirement: `notcorp.test` already ends
/// with `corp.test` and is never expanded to `notcorp.test.corp.test`.
fn has_plain_suffix(name: &str, domain: &str) -> bool {
    name.ends_with(domain)
}

/// True when `domain` equals `name` or is a parent of it on a label
/// boundary: `example.com` covers `x.example.com` but not `badexample.com`.
/// Stub-zone routing matches on label boundaries, unlike the search skip.
fn is_suffix(name: &str, domain: &str) -> bool {
    if name.len() == domain.len() {
        return name.eq_ignore_ascii_case(domain);
    }
    match name.len().checked_sub(domain.len() + 1) {
        Some(split) => {
            name.as_bytes()[split] == b'.' && name[split + 1..].eq_ignore_ascii_case(domain)
        }
        None => false,
    }
}

/// Upstream replies come back with the searched or echoed question; hand
/// the client back the question it actually asked.
fn restore_question(msg: &mut DnsMessage, req: &DnsMessage) {
    if let Some(original) = req.questions.first() {
        if msg.questions.is_empty() {
            msg.questions.push(original.clone());
        } else {
            msg.questions[0] = original.clone();
        }
    }
}

fn finalize(mut msg: DnsMessage, req: &DnsMessage) -> DnsMessage {
    msg.id = req.id;
    restore_question(&mut msg, req);
    msg
}
