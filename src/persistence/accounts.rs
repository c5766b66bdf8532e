//! Flat-file account registry and ban list, loaded once at startup.
//! Passwords are stored as base64-encoded SHA-1 digests.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64_ENGINE;
use base64::Engine as _;
use sha1::{Digest, Sha1};

#[derive(Debug, Clone)]
pub struct AccountRecord {
    pub name: String,
    pub password_digest: String,
    pub gamemaster: bool,
}

#[derive(Debug, Clone, Default)]
pub struct AccountRegistry {
    accounts: HashMap<String, AccountRecord>,
}

impl AccountRegistry {
    pub fn load(root: &Path) -> Result<Option<Self>, String> {
        let path = root.join("save").join("accounts.txt");
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(format!(
                    "account registry read failed for {}: {}",
                    path.display(),
                    err
                ))
            }
        };
        Ok(Some(Self {
            accounts: parse_accounts(&data)?,
        }))
    }

    pub fn from_records(records: impl IntoIterator<Item = AccountRecord>) -> Self {
        let mut accounts = HashMap::new();
        for record in records {
            accounts.insert(normalize_account_name(&record.name), record);
        }
        Self { accounts }
    }

    pub fn exists(&self, name: &str) -> bool {
        self.accounts.contains_key(&normalize_account_name(name))
    }

    pub fn verify(&self, name: &str, password: &str) -> Option<&AccountRecord> {
        let key = normalize_account_name(name);
        let record = self.accounts.get(&key)?;
        if record.password_digest == password_digest(password) {
            Some(record)
        } else {
            None
        }
    }
}

pub fn password_digest(password: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    BASE64_ENGINE.encode(hasher.finalize())
}

fn normalize_account_name(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

/// One account per line: `name:digest[:gm]`. Blank lines and `#` comments
/// are skipped.
fn parse_accounts(data: &str) -> Result<HashMap<String, AccountRecord>, String> {
    let mut accounts = HashMap::new();
    for (line_no, line) in data.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.splitn(3, ':');
        let name = parts
            .next()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| format!("account line {} missing name", line_no + 1))?;
        let digest = parts
            .next()
            .filter(|digest| !digest.is_empty())
            .ok_or_else(|| format!("account line {} missing digest", line_no + 1))?;
        let gamemaster = parts.next().map(|flag| flag.trim() == "gm").unwrap_or(false);
        accounts.insert(
            normalize_account_name(name),
            AccountRecord {
                name: name.to_string(),
                password_digest: digest.to_string(),
                gamemaster,
            },
        );
    }
    Ok(accounts)
}

#[derive(Debug, Clone)]
pub struct BanRecord {
    pub name: String,
    pub expires_at: Option<SystemTime>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BanList {
    bans: HashMap<String, BanRecord>,
}

impl BanList {
    pub fn load(root: &Path) -> Result<Option<Self>, String> {
        let path = root.join("save").join("banlist.txt");
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(format!(
                    "ban list read failed for {}: {}",
                    path.display(),
                    err
                ))
            }
        };
        Ok(Some(Self {
            bans: parse_bans(&data)?,
        }))
    }

    pub fn from_records(records: impl IntoIterator<Item = BanRecord>) -> Self {
        let mut bans = HashMap::new();
        for record in records {
            bans.insert(normalize_account_name(&record.name), record);
        }
        Self { bans }
    }

    pub fn is_banned(&self, name: &str, now: SystemTime) -> bool {
        match self.bans.get(&normalize_account_name(name)) {
            Some(record) => match record.expires_at {
                Some(expires_at) => now < expires_at,
                None => true,
            },
            None => false,
        }
    }
}

/// One ban per line: `name[:expires_epoch_secs[:reason]]`. A zero or
/// missing expiry is permanent.
fn parse_bans(data: &str) -> Result<HashMap<String, BanRecord>, String> {
    let mut bans = HashMap::new();
    for (line_no, line) in data.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.splitn(3, ':');
        let name = parts
            .next()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| format!("ban line {} missing name", line_no + 1))?;
        let expires_at = match parts.next() {
            Some(value) if !value.trim().is_empty() => {
                let secs: u64 = value.trim().parse().map_err(|err| {
                    format!("ban line {} bad expiry: {}", line_no + 1, err)
                })?;
                if secs == 0 {
                    None
                } else {
                    Some(UNIX_EPOCH + Duration::from_secs(secs))
                }
            }
            _ => None,
        };
        let reason = parts.next().map(|reason| reason.trim().to_string());
        bans.insert(
            normalize_account_name(name),
            BanRecord {
                name: name.to_string(),
                expires_at,
                reason,
            },
        );
    }
    Ok(bans)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_accepts_matching_digest() {
        let registry = AccountRegistry::from_records([AccountRecord {
            name: "Aine".to_string(),
            password_digest: password_digest("hunter2"),
            gamemaster: false,
        }]);
        assert!(registry.verify("aine", "hunter2").is_some());
        assert!(registry.verify("Aine", "wrong").is_none());
        assert!(registry.verify("nobody", "hunter2").is_none());
    }

    #[test]
    fn parse_accounts_skips_comments_and_reads_flags() {
        let data = "# staff\nbran:abc123:gm\n\naine:def456\n";
        let accounts = parse_accounts(data).expect("parse");
        assert_eq!(accounts.len(), 2);
        assert!(accounts["bran"].gamemaster);
        assert!(!accounts["aine"].gamemaster);
    }

    #[test]
    fn expired_bans_no_longer_apply() {
        let now = SystemTime::now();
        let past = now - Duration::from_secs(60);
        let future = now + Duration::from_secs(60);
        let bans = BanList::from_records([
            BanRecord {
                name: "old".to_string(),
                expires_at: Some(past),
                reason: None,
            },
            BanRecord {
                name: "fresh".to_string(),
                expires_at: Some(future),
                reason: None,
            },
            BanRecord {
                name: "forever".to_string(),
                expires_at: None,
                reason: Some("rmt".to_string()),
            },
        ]);
        assert!(!bans.is_banned("old", now));
        assert!(bans.is_banned("fresh", now));
        assert!(bans.is_banned("forever", now));
        assert!(!bans.is_banned("unknown", now));
    }

    #[test]
    fn parse_bans_reads_expiry_and_reason() {
        let data = "cheat:0:speed hacks\ntemp:4102444800\n";
        let bans = parse_bans(data).expect("parse");
        assert_eq!(bans["cheat"].expires_at, None);
        assert_eq!(bans["cheat"].reason.as_deref(), Some("speed hacks"));
        assert!(bans["temp"].expires_at.is_some());
    }
}
