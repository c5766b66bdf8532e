//! Env-gated per-connection packet hex dump for protocol debugging.

use std::fmt::Write as FmtWrite;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

const TRACE_ENV: &str = "RUNEGATE_PACKET_TRACE";
const TRACE_MAX_BYTES: usize = 4096;

static TRACE_COUNTER: AtomicUsize = AtomicUsize::new(1);

pub struct PacketTrace {
    file: std::fs::File,
}

impl PacketTrace {
    pub fn new(root: Option<&PathBuf>, session_id: u32, peer: Option<std::net::SocketAddr>) -> Option<Self> {
        if !trace_enabled() {
            return None;
        }
        let root = root?;
        let id = TRACE_COUNTER.fetch_add(1, Ordering::SeqCst);
        let file_name = format!("packet_trace_{id}_session_{session_id}.log");
        let path = root.join("log").join(file_name);
        let mut file = OpenOptions::new().create(true).append(true).open(path).ok()?;
        let timestamp = unix_millis();
        let peer = peer
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let header = format!("# packet trace {id} session={session_id} peer={peer} ts={timestamp}\n");
        let _ = file.write_all(header.as_bytes());
        Some(Self { file })
    }

    pub fn record(&mut self, direction: &str, opcode: u8, payload: &[u8]) {
        let ts = unix_millis();
        let len = payload.len();
        let max = TRACE_MAX_BYTES.min(len);
        let mut line = String::with_capacity(64 + max * 3);
        line.push_str(&format!("{ts} {direction} op={opcode:02x} len={len}"));
        if len > TRACE_MAX_BYTES {
            line.push_str(&format!(" trunc={}", len - TRACE_MAX_BYTES));
        }
        line.push_str(" data=");
        for (idx, byte) in payload[..max].iter().enumerate() {
            if idx > 0 {
                line.push(' ');
            }
            let _ = write!(line, "{:02x}", byte);
        }
        line.push('\n');
        let _ = self.file.write_all(line.as_bytes());
        let _ = self.file.flush();
    }
}

fn trace_enabled() -> bool {
    match std::env::var(TRACE_ENV) {
        Ok(value) => {
            let value = value.trim().to_ascii_lowercase();
            !value.is_empty() && value != "0" && value != "false" && value != "off"
        }
        Err(_) => false,
    }
}

fn unix_millis() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}
