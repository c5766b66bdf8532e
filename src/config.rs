use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug)]
pub struct AppConfig {
    pub root: PathBuf,
    pub bind_addr: String,
    pub max_sessions: usize,
    pub autosave_interval: Duration,
}

impl AppConfig {
    pub fn from_args(args: &[String]) -> Result<Self, String> {
        if args.len() < 2 {
            return Err(
                "usage: runegate <data-root> [bind_addr] [max_sessions] [autosave_secs]"
                    .to_string(),
            );
        }

        let root = Path::new(&args[1]).to_path_buf();
        let bind_addr = if args.len() > 2 {
            args[2].clone()
        } else {
            env_string("RUNEGATE_BIND").unwrap_or_else(|| "0.0.0.0:2610".to_string())
        };
        let max_sessions = if args.len() > 3 {
            parse_count(&args[3], "max_sessions")?
        } else {
            match env_string("RUNEGATE_MAX_SESSIONS") {
                Some(value) => parse_count(&value, "RUNEGATE_MAX_SESSIONS")?,
                None => 512,
            }
        };
        let autosave_secs = if args.len() > 4 {
            parse_count(&args[4], "autosave_secs")? as u64
        } else {
            match env_string("RUNEGATE_AUTOSAVE_SECS") {
                Some(value) => parse_count(&value, "RUNEGATE_AUTOSAVE_SECS")? as u64,
                None => 300,
            }
        };

        Ok(Self {
            root,
            bind_addr,
            max_sessions,
            autosave_interval: Duration::from_secs(autosave_secs),
        })
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn parse_count(value: &str, what: &str) -> Result<usize, String> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|err| format!("{} must be a non-negative integer: {}", what, err))
}
