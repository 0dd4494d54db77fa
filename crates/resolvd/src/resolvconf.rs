//! `/etc/resolv.conf` integration.
//!
//! Reads the system resolver config for fallback nameservers, search
//! domains and ndots, and can register this resolver as the system
//! default. Lines we add carry a sentinel comment and existing nameserver
//! lines are commented out with another, so teardown is exact.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

pub const RESOLV_CONF_PATH: &str = "/etc/resolv.conf";

const COMMENT_ADD: &str = "# added by resolvd";
const COMMENT_OUT: &str = "# disabled by resolvd #";

/// The parts of a resolv.conf file this resolver cares about.
#[derive(Debug, Default, Clone)]
pub struct ResolvConf {
    pub nameservers: Vec<SocketAddr>,
    pub search: Vec<String>,
    pub ndots: Option<usize>,
}

pub fn read(path: &Path) -> std::io::Result<ResolvConf> {
    let content = std::fs::read_to_string(path)?;
    Ok(parse(&content))
}

fn parse(content: &str) -> ResolvConf {
    let mut conf = ResolvConf::default();
    for line in content.lines() {
        let line = line
            .split(['#', ';'])
            .next()
            .unwrap_or("")
            .trim();
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("nameserver") => {
                if let Some(ip) = fields.next().and_then(|s| s.parse::<IpAddr>().ok()) {
                    conf.nameservers.push(SocketAddr::new(ip, 53));
                }
            }
            // Last of domain/search wins, as in glibc.
            Some("domain") => {
                if let Some(domain) = fields.next() {
                    conf.search = vec![domain.trim_end_matches('.').to_lowercase()];
                }
            }
            Some("search") => {
                conf.search = fields
                    .map(|d| d.trim_end_matches('.').to_lowercase())
                    .collect();
            }
            Some("options") => {
                for opt in fields {
                    if let Some(n) = opt.strip_prefix("ndots:") {
                        if let Ok(n) = n.parse() {
                            conf.ndots = Some(n);
                        }
                    }
                }
            }
            _ => {}
        }
    }
    conf
}

/// Make `address` the system nameserver: remove any line we added before,
/// prepend ours, comment out other active nameserver lines.
pub fn register(address: IpAddr, path: &Path) -> Result<()> {
    info!("setting host nameserver to {}", address);
    let entry = format!("nameserver {} {}\n", address, COMMENT_ADD);
    rewrite(Some(&entry), path).with_context(|| format!("updating {}", path.display()))
}

/// Undo `register`: drop the line we added and uncomment the lines we
/// disabled.
pub fn unregister(path: &Path) -> Result<()> {
    rewrite(None, path).with_context(|| format!("restoring {}", path.display()))
}

fn rewrite(insert: Option<&str>, path: &Path) -> Result<()> {
    let orig = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if insert.is_none() {
                return Ok(());
            }
            String::new()
        }
        Err(e) => return Err(e.into()),
    };

    let mut out = String::with_capacity(orig.len() + 64);
    if let Some(entry) = insert {
        out.push_str(entry);
    }

    for line in orig.lines() {
        if line.contains(COMMENT_ADD) {
            continue;
        }
        match insert {
            Some(_) => {
                let trimmed = line.trim_start();
                if trimmed.to_lowercase().starts_with("nameserver")
                    && !line.contains(COMMENT_OUT)
                {
                    out.push_str(COMMENT_OUT);
                    out.push(' ');
                }
                out.push_str(line);
            }
            None => {
                match line.strip_prefix(COMMENT_OUT) {
                    Some(rest) => out.push_str(rest.trim_start()),
                    None => out.push_str(line),
                }
            }
        }
        out.push('\n');
    }

    std::fs::write(path, out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_picks_up_nameservers_search_and_ndots() {
        let conf = parse(
            "# generated\n\
             nameserver 1.1.1.1\n\
             nameserver 8.8.8.8 ; trailing\n\
             search corp.example lab.test.\n\
             options ndots:3 timeout:2\n",
        );
        assert_eq!(conf.nameservers.len(), 2);
        assert_eq!(conf.nameservers[0], "1.1.1.1:53".parse().unwrap());
        assert_eq!(conf.search, vec!["corp.example", "lab.test"]);
        assert_eq!(conf.ndots, Some(3));
    }

    #[test]
    fn search_supersedes_domain() {
        let conf = parse("domain old.example\nsearch new.example\n");
        assert_eq!(conf.search, vec!["new.example"]);
    }

    #[test]
    fn register_then_unregister_restores_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        let original = "# my resolver setup\nnameserver 192.168.1.1\nsearch home.lan\n";
        std::fs::write(&path, original).unwrap();

        register("127.0.0.1".parse().unwrap(), &path).unwrap();
        let modified = std::fs::read_to_string(&path).unwrap();
        assert!(modified.starts_with("nameserver 127.0.0.1 # added by resolvd\n"));
        assert!(modified.contains("# disabled by resolvd # nameserver 192.168.1.1"));
        assert!(modified.contains("search home.lan"));

        // A second register must not stack entries.
        register("127.0.0.1".parse().unwrap(), &path).unwrap();
        let twice = std::fs::read_to_string(&path).unwrap();
        assert_eq!(twice.matches("# added by resolvd").count(), 1);

        unregister(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), original);
    }

    #[test]
    fn unregister_without_file_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        assert!(unregister(&dir.path().join("missing")).is_ok());
    }
}
