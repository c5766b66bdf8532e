//! Pre-authorization IP reputation. The lookup itself is an external
//! collaborator behind `ReputationChecker`; the guard bounds it with a
//! hard timeout and defaults to permit on any inconclusive result, so a
//! collaborator outage never blocks legitimate players.

use std::collections::HashSet;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;

use crate::telemetry::logging;

pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);
const VERDICT_CACHE_SIZE: usize = 1024;

pub trait ReputationChecker: Send + Sync {
    /// True means the address is known-malicious. Errors are treated as
    /// inconclusive by the caller.
    fn is_blacklisted(&self, ip: IpAddr) -> Result<bool, String>;
}

/// Permits everything; used when no blacklist is configured.
pub struct AllowAll;

impl ReputationChecker for AllowAll {
    fn is_blacklisted(&self, _ip: IpAddr) -> Result<bool, String> {
        Ok(false)
    }
}

/// Flat-file blacklist, one address per line.
pub struct FileBlacklist {
    addrs: HashSet<IpAddr>,
}

impl FileBlacklist {
    pub fn load(root: &Path) -> Result<Option<Self>, String> {
        let path = root.join("save").join("ipblacklist.txt");
        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(format!(
                    "ip blacklist read failed for {}: {}",
                    path.display(),
                    err
                ))
            }
        };
        let mut addrs = HashSet::new();
        for (line_no, line) in data.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let addr: IpAddr = line
                .parse()
                .map_err(|err| format!("ip blacklist line {} bad address: {}", line_no + 1, err))?;
            addrs.insert(addr);
        }
        Ok(Some(Self { addrs }))
    }

    pub fn from_addrs(addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            addrs: addrs.into_iter().collect(),
        }
    }
}

impl ReputationChecker for FileBlacklist {
    fn is_blacklisted(&self, ip: IpAddr) -> Result<bool, String> {
        Ok(self.addrs.contains(&ip))
    }
}

pub struct ReputationGuard {
    checker: Arc<dyn ReputationChecker>,
    cache: Mutex<LruCache<IpAddr, bool>>,
    timeout: Duration,
}

impl ReputationGuard {
    pub fn new(checker: Arc<dyn ReputationChecker>, timeout: Duration) -> Self {
        Self {
            checker,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(VERDICT_CACHE_SIZE).expect("cache size"),
            )),
            timeout,
        }
    }

    pub fn permissive() -> Self {
        Self::new(Arc::new(AllowAll), DEFAULT_LOOKUP_TIMEOUT)
    }

    /// Returns true if the address is known-malicious. The lookup runs on
    /// its own thread and is abandoned past the timeout; timeouts and
    /// errors log and permit. Only conclusive verdicts are cached.
    pub fn is_malicious(&self, ip: IpAddr) -> bool {
        if let Some(verdict) = self.cache.lock().expect("verdict cache lock").get(&ip) {
            return *verdict;
        }

        let (tx, rx) = mpsc::channel();
        let checker = Arc::clone(&self.checker);
        std::thread::spawn(move || {
            let _ = tx.send(checker.is_blacklisted(ip));
        });

        match rx.recv_timeout(self.timeout) {
            Ok(Ok(verdict)) => {
                self.cache
                    .lock()
                    .expect("verdict cache lock")
                    .put(ip, verdict);
                verdict
            }
            Ok(Err(err)) => {
                logging::log_error(&format!("reputation lookup failed for {}: {}", ip, err));
                false
            }
            Err(_) => {
                logging::log_lag(&format!(
                    "reputation lookup timed out for {} after {:?}",
                    ip, self.timeout
                ));
                false
            }
        }
    }
}
