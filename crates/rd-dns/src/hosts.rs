//! Hosts-file overlay.
//!
//! Parses `/etc/hosts`-format content into an indexed [`HostList`] and
//! serves lookups from a [`HostsSource`] that watches a single file or a
//! directory of files for changes. Reloads are all-or-nothing: a new list
//! is built fully before being swapped in under the write lock, so readers
//! see either the old or the new list, never a partial one.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One hosts-file entry. Immutable once in a list.
#[derive(Debug, Clone)]
pub struct HostEntry {
    pub ip: IpAddr,
    /// Lowercased, no trailing dot.
    pub domain: String,
}

/// Ordered host entries plus a name index.
#[derive(Default)]
pub struct HostList {
    entries: Vec<HostEntry>,
    index: FxHashMap<String, Vec<IpAddr>>,
}

impl HostList {
    /// Parse `/etc/hosts`-format content: `IP name [alias...]` per line,
    /// `#` starts a comment. Malformed lines are skipped.
    pub fn parse(content: &str) -> Self {
        let mut list = Self::default();
        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let Some(ip_field) = fields.next() else {
                continue;
            };
            let Ok(ip) = ip_field.parse::<IpAddr>() else {
                debug!("skipping malformed hosts line: {}", line);
                continue;
            };
            let mut got_name = false;
            for name in fields {
                list.add(ip, name);
                got_name = true;
            }
            if !got_name {
                debug!("skipping hosts line without names: {}", line);
            }
        }
        list
    }

    pub fn add(&mut self, ip: IpAddr, domain: &str) {
        let domain = normalize_name(domain);
        self.index.entry(domain.clone()).or_default().push(ip);
        self.entries.push(HostEntry { ip, domain });
    }

    fn merge(&mut self, other: HostList) {
        for entry in other.entries {
            self.add(entry.ip, &entry.domain);
        }
    }

    /// All addresses for an exact domain match, case- and
    /// trailing-dot-insensitive, in insertion order.
    pub fn find_hosts(&self, name: &str) -> Vec<IpAddr> {
        self.index
            .get(&normalize_name(name))
            .cloned()
            .unwrap_or_default()
    }

    /// First entry (insertion order) whose reverse pointer name matches.
    pub fn find_reverse(&self, ptr_name: &str) -> Option<String> {
        let ptr_name = normalize_name(ptr_name);
        self.entries
            .iter()
            .find(|entry| reverse_name(entry.ip) == ptr_name)
            .map(|entry| entry.domain.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_lowercase()
}

/// Render the reverse-lookup name for an address:
/// `4.3.2.1.in-addr.arpa` for IPv4, nibble form under `ip6.arpa` for IPv6.
pub fn reverse_name(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.{}.in-addr.arpa", o[3], o[2], o[1], o[0])
        }
        IpAddr::V6(v6) => {
            let mut nibbles = Vec::with_capacity(32);
            for octet in v6.octets().iter().rev() {
                nibbles.push(format!("{:x}", octet & 0xF));
                nibbles.push(format!("{:x}", octet >> 4));
            }
            format!("{}.ip6.arpa", nibbles.join("."))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FileStat {
    mtime: SystemTime,
    size: u64,
}

/// Shared overlay lookups backed by a single file or a directory of files.
///
/// Constructed once at startup; an optional poll task reloads the list when
/// the backing files change and exits when the cancellation token fires.
#[derive(Clone)]
pub struct HostsSource {
    list: Arc<RwLock<HostList>>,
}

impl HostsSource {
    /// A source with no backing file; lookups always miss.
    pub fn empty() -> Self {
        Self {
            list: Arc::new(RwLock::new(HostList::default())),
        }
    }

    /// Load a single hosts file, polling it for `(mtime, size)` changes
    /// every `poll` period when `poll` is non-zero.
    pub async fn from_file(
        path: impl Into<PathBuf>,
        poll: Duration,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let path = path.into();
        let (list, stat) = load_file(&path)
            .await
            .with_context(|| format!("loading hosts file {}", path.display()))?;
        debug!("loaded {} host entries from {}", list.len(), path.display());

        let source = Self {
            list: Arc::new(RwLock::new(list)),
        };
        if !poll.is_zero() {
            spawn_file_poller(source.list.clone(), path, stat, poll, cancel.clone());
        }
        Ok(source)
    }

    /// Load every regular file in a directory (non-recursive). When polling
    /// is enabled, any changed, added or removed file triggers one reload
    /// of the whole directory.
    pub async fn from_dir(
        path: impl Into<PathBuf>,
        poll: Duration,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let path = path.into();
        let (list, files) = load_dir(&path)
            .await
            .with_context(|| format!("loading hosts directory {}", path.display()))?;
        debug!(
            "loaded {} host entries from {} files in {}",
            list.len(),
            files.len(),
            path.display()
        );

        let source = Self {
            list: Arc::new(RwLock::new(list)),
        };
        if !poll.is_zero() {
            spawn_dir_poller(source.list.clone(), path, files, poll, cancel.clone());
        }
        Ok(source)
    }

    pub async fn find_hosts(&self, name: &str) -> Vec<IpAddr> {
        self.list.read().await.find_hosts(name)
    }

    pub async fn find_reverse(&self, ptr_name: &str) -> Option<String> {
        self.list.read().await.find_reverse(ptr_name)
    }

    pub async fn len(&self) -> usize {
        self.list.read().await.len()
    }
}

async fn file_stat(path: &Path) -> std::io::Result<FileStat> {
    let meta = tokio::fs::metadata(path).await?;
    Ok(FileStat {
        mtime: meta.modified()?,
        size: meta.len(),
    })
}

async fn load_file(path: &Path) -> std::io::Result<(HostList, FileStat)> {
    let stat = file_stat(path).await?;
    let content = tokio::fs::read_to_string(path).await?;
    Ok((HostList::parse(&content), stat))
}

async fn load_dir(path: &Path) -> std::io::Result<(HostList, FxHashMap<String, FileStat>)> {
    let mut list = HostList::default();
    let mut files = FxHashMap::default();

    let mut dir = tokio::fs::read_dir(path).await?;
    while let Some(entry) = dir.next_entry().await? {
        let meta = entry.metadata().await?;
        if !meta.is_file() {
            continue;
        }
        let content = tokio::fs::read_to_string(entry.path()).await?;
        list.merge(HostList::parse(&content));
        files.insert(
            entry.file_name().to_string_lossy().into_owned(),
            FileStat {
                mtime: meta.modified()?,
                size: meta.len(),
            },
        );
    }
    Ok((list, files))
}

async fn dir_stats(path: &Path) -> std::io::Result<FxHashMap<String, FileStat>> {
    let mut files = FxHashMap::default();
    let mut dir = tokio::fs::read_dir(path).await?;
    while let Some(entry) = dir.next_entry().await? {
        let meta = entry.metadata().await?;
        if !meta.is_file() {
            continue;
        }
        files.insert(
            entry.file_name().to_string_lossy().into_owned(),
            FileStat {
                mtime: meta.modified()?,
                size: meta.len(),
            },
        );
    }
    Ok(files)
}

fn spawn_file_poller(
    list: Arc<RwLock<HostList>>,
    path: PathBuf,
    mut stat: FileStat,
    poll: Duration,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let current = match file_stat(&path).await {
                Ok(s) => s,
                Err(e) => {
                    warn!("stat of hosts file {} failed: {}", path.display(), e);
                    continue;
                }
            };
            if current == stat {
                continue;
            }

            match load_file(&path).await {
                Ok((new_list, new_stat)) => {
                    debug!(
                        "hosts file {} changed, reloaded {} entries",
                        path.display(),
                        new_list.len()
                    );
                    *list.write().await = new_list;
                    stat = new_stat;
                }
                Err(e) => warn!("reload of hosts file {} failed: {}", path.display(), e),
            }
        }
        debug!("hosts file poller for {} stopped", path.display());
    });
}

fn spawn_dir_poller(
    list: Arc<RwLock<HostList>>,
    path: PathBuf,
    mut files: FxHashMap<String, FileStat>,
    poll: Duration,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let current = match dir_stats(&path).await {
                Ok(s) => s,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(
                        "hosts directory {} is gone, keeping last loaded list",
                        path.display()
                    );
                    return;
                }
                Err(e) => {
                    warn!("listing hosts directory {} failed: {}", path.display(), e);
                    continue;
                }
            };
            if current == files {
                continue;
            }

            match load_dir(&path).await {
                Ok((new_list, new_files)) => {
                    debug!(
                        "hosts directory {} changed, reloaded {} entries from {} files",
                        path.display(),
                        new_list.len(),
                        new_files.len()
                    );
                    *list.write().await = new_list;
                    files = new_files;
                }
                Err(e) => warn!(
                    "reload of hosts directory {} failed: {}",
                    path.display(),
                    e
                ),
            }
        }
        debug!("hosts directory poller for {} stopped", path.display());
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    const SAMPLE: &str = "\
# comment line
10.0.0.5   foo.local foo  # trailing comment

not-an-ip  bar.local
10.0.0.6   BAR.Local
fd00::1    six.local
";

    #[test]
    fn parse_skips_comments_and_malformed_lines() {
        let list = HostList::parse(SAMPLE);
        assert_eq!(list.len(), 4);
        assert_eq!(
            list.find_hosts("foo.local"),
            vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))]
        );
        assert!(list.find_hosts("not-an-ip").is_empty());
    }

    #[test]
    fn lookup_is_case_and_trailing_dot_insensitive() {
        let list = HostList::parse(SAMPLE);
        assert_eq!(
            list.find_hosts("Bar.LOCAL."),
            vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 6))]
        );
    }

    #[test]
    fn reverse_lookup_v4() {
        let list = HostList::parse(SAMPLE);
        assert_eq!(
            list.find_reverse("5.0.0.10.in-addr.arpa."),
            Some("foo.local".to_string())
        );
        assert_eq!(list.find_reverse("9.0.0.10.in-addr.arpa."), None);
    }

    #[test]
    fn reverse_lookup_v6() {
        let list = HostList::parse(SAMPLE);
        let ptr = reverse_name(IpAddr::V6("fd00::1".parse::<Ipv6Addr>().unwrap()));
        assert_eq!(list.find_reverse(&ptr), Some("six.local".to_string()));
    }

    #[test]
    fn reverse_name_forms() {
        assert_eq!(
            reverse_name(IpAddr::V4(Ipv4Addr::new(10, 2, 3, 4))),
            "4.3.2.10.in-addr.arpa"
        );
        let v6 = reverse_name(IpAddr::V6("2001:db8::1".parse().unwrap()));
        assert!(v6.ends_with(".ip6.arpa"));
        assert!(v6.starts_with("1.0.0.0."));
        assert_eq!(v6.split('.').count(), 34);
    }

    #[test]
    fn first_reverse_match_wins() {
        let mut list = HostList::default();
        list.add(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), "first.local");
        list.add(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), "second.local");
        assert_eq!(
            list.find_reverse("1.0.0.10.in-addr.arpa"),
            Some("first.local".to_string())
        );
    }

    #[tokio::test]
    async fn directory_source_unions_all_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), "10.0.0.1 one.local\n").unwrap();
        std::fs::write(dir.path().join("b"), "10.0.0.2 two.local\n").unwrap();

        let cancel = CancellationToken::new();
        let source = HostsSource::from_dir(dir.path(), Duration::ZERO, &cancel)
            .await
            .unwrap();
        assert_eq!(source.len().await, 2);
        assert_eq!(
            source.find_hosts("one.local").await,
            vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))]
        );
        assert_eq!(
            source.find_hosts("two.local").await,
            vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))]
        );
    }

    #[tokio::test]
    async fn file_source_reloads_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "10.0.0.1 old.local\n").unwrap();

        let cancel = CancellationToken::new();
        let source = HostsSource::from_file(&path, Duration::from_millis(25), &cancel)
            .await
            .unwrap();
        assert!(source.find_hosts("new.local").await.is_empty());

        std::fs::write(&path, "10.0.0.1 old.local\n10.0.0.2 new.local\n").unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(
            source.find_hosts("new.local").await,
            vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))]
        );
        cancel.cancel();
    }

    #[tokio::test]
    async fn missing_configured_file_is_an_error() {
        let cancel = CancellationToken::new();
        let result =
            HostsSource::from_file("/nonexistent/hosts-path", Duration::ZERO, &cancel).await;
        assert!(result.is_err());
    }
}
