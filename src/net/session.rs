//! One live client connection: transport handle, authorization state,
//! liveness timestamps, negotiated cipher, and the owned entity reference.

use std::collections::HashMap;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::entities::player::PlayerId;
use crate::net::codec::{serialize_frame, NullCipher, PacketCipher};
use crate::net::trace::PacketTrace;

pub type SessionId = u32;

/// Write half of a connection. The read half stays with the connection
/// thread; this side is shared through the session for ticks, broadcasts,
/// and handlers.
pub trait SessionTransport: Send {
    fn peer_addr(&self) -> Option<SocketAddr>;
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), String>;
    fn shutdown(&mut self);
}

pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }
}

impl SessionTransport for TcpTransport {
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<(), String> {
        use std::io::Write;
        self.stream
            .write_all(frame)
            .map_err(|err| format!("frame write failed: {}", err))
    }

    fn shutdown(&mut self) {
        // Best effort; the goal is reclamation, not signaling.
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Dispatch,
    Drop,
}

#[derive(Debug)]
struct RateWindow {
    last: Instant,
    dropped_last: bool,
}

#[derive(Debug, Clone)]
pub struct Notice {
    pub text: String,
    pub queued_at: Instant,
}

pub struct Session {
    id: SessionId,
    peer: Option<SocketAddr>,
    transport: Mutex<Option<Box<dyn SessionTransport>>>,
    trace: Mutex<Option<PacketTrace>>,
    closed: AtomicBool,
    authorized: AtomicBool,
    authenticated: AtomicBool,
    world_map_open: AtomicBool,
    idle_warned: AtomicBool,
    entity: Mutex<Option<PlayerId>>,
    cipher: Mutex<Arc<dyn PacketCipher>>,
    redirect_token: Mutex<Option<u32>>,
    last_message: Mutex<Instant>,
    last_active: Mutex<Instant>,
    last_heartbeat_sent: Mutex<Instant>,
    rate_windows: Mutex<HashMap<u8, RateWindow>>,
    notices: Mutex<Vec<Notice>>,
}

impl Session {
    pub fn new(id: SessionId, transport: Box<dyn SessionTransport>) -> Self {
        let now = Instant::now();
        let peer = transport.peer_addr();
        Self {
            id,
            peer,
            transport: Mutex::new(Some(transport)),
            trace: Mutex::new(None),
            closed: AtomicBool::new(false),
            authorized: AtomicBool::new(false),
            authenticated: AtomicBool::new(false),
            world_map_open: AtomicBool::new(false),
            idle_warned: AtomicBool::new(false),
            entity: Mutex::new(None),
            cipher: Mutex::new(Arc::new(NullCipher)),
            redirect_token: Mutex::new(None),
            last_message: Mutex::new(now),
            last_active: Mutex::new(now),
            last_heartbeat_sent: Mutex::new(now),
            rate_windows: Mutex::new(HashMap::new()),
            notices: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn install_trace(&self, trace: PacketTrace) {
        *self.trace.lock().expect("trace lock") = Some(trace);
    }

    pub fn record_trace(&self, direction: &str, opcode: u8, payload: &[u8]) {
        if let Ok(mut guard) = self.trace.lock() {
            if let Some(trace) = guard.as_mut() {
                trace.record(direction, opcode, payload);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn set_authorized(&self) {
        self.authorized.store(true, Ordering::SeqCst);
    }

    pub fn is_authorized(&self) -> bool {
        self.authorized.load(Ordering::SeqCst)
    }

    pub fn set_authenticated(&self) {
        self.authenticated.store(true, Ordering::SeqCst);
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    pub fn set_world_map_open(&self, open: bool) {
        self.world_map_open.store(open, Ordering::SeqCst);
    }

    pub fn is_world_map_open(&self) -> bool {
        self.world_map_open.load(Ordering::SeqCst)
    }

    /// The entity reference is set exactly once per login.
    pub fn bind_entity(&self, player_id: PlayerId) -> Result<(), String> {
        let mut entity = self.entity.lock().expect("entity lock");
        if entity.is_some() {
            return Err(format!("session {} already owns an entity", self.id));
        }
        *entity = Some(player_id);
        Ok(())
    }

    pub fn entity(&self) -> Option<PlayerId> {
        *self.entity.lock().expect("entity lock")
    }

    pub fn take_entity(&self) -> Option<PlayerId> {
        self.entity.lock().expect("entity lock").take()
    }

    pub fn install_cipher(&self, cipher: Arc<dyn PacketCipher>) {
        *self.cipher.lock().expect("cipher lock") = cipher;
    }

    /// Undoes the negotiated payload obfuscation for an inbound packet.
    pub fn decipher(&self, opcode: u8, payload: &mut [u8]) {
        if crate::net::codec::is_plaintext_opcode(opcode) {
            return;
        }
        let cipher = Arc::clone(&self.cipher.lock().expect("cipher lock"));
        cipher.apply(opcode, payload);
    }

    pub fn set_redirect_token(&self, token: u32) {
        *self.redirect_token.lock().expect("redirect token lock") = Some(token);
    }

    pub fn take_redirect_token(&self) -> Option<u32> {
        self.redirect_token.lock().expect("redirect token lock").take()
    }

    /// Serializes and writes one outbound frame through the negotiated
    /// cipher. Errors from a closed or broken transport are terminal for
    /// the caller to handle.
    pub fn send(&self, opcode: u8, payload: &[u8]) -> Result<(), String> {
        if self.is_closed() {
            return Err("session is closed".to_string());
        }
        let cipher = Arc::clone(&self.cipher.lock().expect("cipher lock"));
        let frame = serialize_frame(opcode, payload, cipher.as_ref())?;
        self.record_trace("out", opcode, payload);
        let mut guard = self.transport.lock().expect("transport lock");
        match guard.as_mut() {
            Some(transport) => transport.write_frame(&frame),
            None => Err("session transport detached".to_string()),
        }
    }

    /// Idempotent close: the first call shuts the socket down, later calls
    /// (and concurrent ones) are no-ops.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let transport = self.transport.lock().expect("transport lock").take();
        if let Some(mut transport) = transport {
            transport.shutdown();
        }
    }

    pub fn touch(&self, now: Instant, heartbeat: bool) {
        *self.last_message.lock().expect("last message lock") = now;
        if !heartbeat {
            *self.last_active.lock().expect("last active lock") = now;
            self.idle_warned.store(false, Ordering::SeqCst);
        }
    }

    pub fn last_message(&self) -> Instant {
        *self.last_message.lock().expect("last message lock")
    }

    /// Last inbound message that was not a heartbeat.
    pub fn last_active(&self) -> Instant {
        *self.last_active.lock().expect("last active lock")
    }

    /// Returns true the first time the session crosses the idle threshold;
    /// the flag rearms on the next non-heartbeat message.
    pub fn mark_idle_warned(&self) -> bool {
        !self.idle_warned.swap(true, Ordering::SeqCst)
    }

    /// Per-opcode rate gate. A packet inside the minimum interval updates
    /// the window and is dropped; the next one still inside the window
    /// updates the window and is dispatched, so bursts coalesce instead of
    /// locking the opcode out.
    pub fn rate_gate(&self, opcode: u8, min_interval: Duration, now: Instant) -> RateDecision {
        let mut windows = self.rate_windows.lock().expect("rate window lock");
        match windows.get_mut(&opcode) {
            Some(window) => {
                let too_fast = now.duration_since(window.last) < min_interval;
                window.last = now;
                if too_fast && !window.dropped_last {
                    window.dropped_last = true;
                    RateDecision::Drop
                } else {
                    window.dropped_last = false;
                    RateDecision::Dispatch
                }
            }
            None => {
                windows.insert(
                    opcode,
                    RateWindow {
                        last: now,
                        dropped_last: false,
                    },
                );
                RateDecision::Dispatch
            }
        }
    }

    pub fn queue_notice(&self, text: impl Into<String>) {
        self.notices.lock().expect("notice lock").push(Notice {
            text: text.into(),
            queued_at: Instant::now(),
        });
    }

    pub fn take_notices(&self) -> Vec<Notice> {
        std::mem::take(&mut *self.notices.lock().expect("notice lock"))
    }

    /// Checks whether an outbound heartbeat is due and advances the stamp
    /// when it is.
    pub fn heartbeat_due(&self, interval: Duration, now: Instant) -> bool {
        let mut last = self.last_heartbeat_sent.lock().expect("heartbeat lock");
        if now.duration_since(*last) >= interval {
            *last = now;
            true
        } else {
            false
        }
    }
}
