//! The game server proper: listener setup, the accept loop, per-connection
//! read threads, shared server context, and the disconnect path everything
//! funnels through.

use std::io::Read;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::net::connection::Reassembler;
use crate::net::dispatch::{self, DispatchTable};
use crate::net::handlers::build_dispatch_table;
use crate::net::registry::SessionRegistry;
use crate::net::reputation::{FileBlacklist, ReputationChecker, ReputationGuard};
use crate::net::session::{Session, TcpTransport};
use crate::net::ticker;
use crate::net::trace::PacketTrace;
use crate::persistence::accounts::{AccountRegistry, BanList};
use crate::persistence::store::{PlayerRecord, SaveStore};
use crate::telemetry::logging;
use crate::world::state::World;

const ACCEPT_IDLE_SLEEP: Duration = Duration::from_millis(50);

const SIGNAL_RUNNING: u8 = 0;
const SIGNAL_SHUTDOWN: u8 = 1;
const SIGNAL_FAULT: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerExit {
    Shutdown,
    Fault,
}

/// Shared run/stop signal. A fault sticks: once set it is never downgraded
/// back to a plain shutdown.
pub struct ServerControl {
    signal: AtomicU8,
}

impl ServerControl {
    pub fn new() -> Self {
        Self {
            signal: AtomicU8::new(SIGNAL_RUNNING),
        }
    }

    pub fn request_shutdown(&self) {
        let _ = self.signal.compare_exchange(
            SIGNAL_RUNNING,
            SIGNAL_SHUTDOWN,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn mark_fault(&self) {
        self.signal.store(SIGNAL_FAULT, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.signal.load(Ordering::SeqCst) == SIGNAL_RUNNING
    }

    pub fn exit_reason(&self) -> ServerExit {
        if self.signal.load(Ordering::SeqCst) == SIGNAL_FAULT {
            ServerExit::Fault
        } else {
            ServerExit::Shutdown
        }
    }
}

impl Default for ServerControl {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct GameServerConfig {
    pub bind_addr: String,
    pub root: Option<PathBuf>,
    pub max_sessions: usize,
    pub max_packet: usize,
    pub client_version: u16,
    pub read_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub notice_max_age: Duration,
    pub idle_warning_after: Duration,
    pub idle_disconnect_after: Duration,
    pub autosave_interval: Duration,
    pub respawn_delay: Duration,
    pub fast_interval: Duration,
    pub normal_interval: Duration,
    pub slow_interval: Duration,
    pub reputation_timeout: Duration,
}

impl Default for GameServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:2610".to_string(),
            root: None,
            max_sessions: 512,
            max_packet: 0x0fff,
            client_version: 85,
            read_timeout: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(5),
            notice_max_age: Duration::from_secs(30),
            idle_warning_after: Duration::from_secs(13 * 60),
            idle_disconnect_after: Duration::from_secs(15 * 60),
            autosave_interval: Duration::from_secs(300),
            respawn_delay: Duration::from_secs(10),
            fast_interval: Duration::from_millis(40),
            normal_interval: Duration::from_millis(80),
            slow_interval: Duration::from_millis(120),
            reputation_timeout: crate::net::reputation::DEFAULT_LOOKUP_TIMEOUT,
        }
    }
}

/// Everything the accept loop, the handlers, and the tick loops share.
pub struct ServerContext {
    pub config: GameServerConfig,
    pub registry: SessionRegistry,
    pub world: World,
    pub store: Option<SaveStore>,
    pub accounts: Option<AccountRegistry>,
    pub bans: Option<BanList>,
    pub reputation: ReputationGuard,
    pub control: Arc<ServerControl>,
    pub dispatch: DispatchTable,
    last_autosave: Mutex<Instant>,
}

impl ServerContext {
    /// Loads the data root (accounts, bans, ip blacklist) when one is
    /// configured and builds the dispatch table. Without a root the server
    /// runs open and unpersisted.
    pub fn new(
        config: GameServerConfig,
        control: Arc<ServerControl>,
    ) -> Result<Arc<Self>, String> {
        let dispatch = build_dispatch_table()?;

        let (store, accounts, bans, reputation) = match &config.root {
            Some(root) => {
                let store = SaveStore::from_root(root);
                let accounts = AccountRegistry::load(root)?;
                let bans = BanList::load(root)?;
                let reputation = match FileBlacklist::load(root)? {
                    Some(blacklist) => ReputationGuard::new(
                        Arc::new(blacklist) as Arc<dyn ReputationChecker>,
                        config.reputation_timeout,
                    ),
                    None => ReputationGuard::permissive(),
                };
                (Some(store), accounts, bans, reputation)
            }
            None => (None, None, None, ReputationGuard::permissive()),
        };

        Ok(Arc::new(Self {
            config,
            registry: SessionRegistry::new(),
            world: World::bootstrap(),
            store,
            accounts,
            bans,
            reputation,
            control,
            dispatch,
            last_autosave: Mutex::new(Instant::now()),
        }))
    }

    /// Checks whether a periodic save is due and advances the stamp when it
    /// is. A zero interval disables autosaving.
    pub fn autosave_due(&self, now: Instant) -> bool {
        if self.config.autosave_interval.is_zero() {
            return false;
        }
        let mut last = self.last_autosave.lock().expect("autosave lock");
        if now.duration_since(*last) >= self.config.autosave_interval {
            *last = now;
            true
        } else {
            false
        }
    }
}

pub fn run_game_server(
    config: GameServerConfig,
    control: Arc<ServerControl>,
) -> Result<ServerExit, String> {
    let listener = TcpListener::bind(&config.bind_addr)
        .map_err(|err| format!("bind to {} failed: {}", config.bind_addr, err))?;
    let ctx = ServerContext::new(config, control)?;
    run_with_listener(ctx, listener)
}

/// The accept loop. The listener is non-blocking so the loop can observe
/// the control signal between accepts.
pub fn run_with_listener(
    ctx: Arc<ServerContext>,
    listener: TcpListener,
) -> Result<ServerExit, String> {
    listener
        .set_nonblocking(true)
        .map_err(|err| format!("listener nonblocking mode failed: {}", err))?;
    let local = listener
        .local_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| ctx.config.bind_addr.clone());
    println!("runegate listening on {}", local);
    logging::log_net(&format!("listening on {}", local));

    let tick_handles = ticker::spawn_tick_loops(Arc::clone(&ctx));

    while ctx.control.is_running() {
        match listener.accept() {
            Ok((stream, addr)) => accept_connection(&ctx, stream, addr),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_IDLE_SLEEP);
            }
            Err(err) => {
                logging::log_error(&format!("accept failed: {}", err));
                thread::sleep(ACCEPT_IDLE_SLEEP);
            }
        }
    }

    for session in ctx.registry.snapshot() {
        disconnect_session(&ctx, &session);
    }
    for handle in tick_handles {
        let _ = handle.join();
    }

    let exit = ctx.control.exit_reason();
    logging::log_net(&format!("server stopped: {:?}", exit));
    Ok(exit)
}

fn accept_connection(ctx: &Arc<ServerContext>, stream: TcpStream, addr: SocketAddr) {
    if ctx.registry.len() >= ctx.config.max_sessions {
        logging::log_net(&format!(
            "refusing {}: session ceiling {} reached",
            addr, ctx.config.max_sessions
        ));
        return;
    }

    let writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(err) => {
            logging::log_error(&format!("stream clone failed for {}: {}", addr, err));
            return;
        }
    };

    let id = ctx.registry.allocate_id();
    let session = Arc::new(Session::new(id, Box::new(TcpTransport::new(writer))));
    if let Some(trace) = PacketTrace::new(ctx.config.root.as_ref(), id, Some(addr)) {
        session.install_trace(trace);
    }
    if let Err(err) = ctx.registry.add(Arc::clone(&session)) {
        logging::log_error(&err);
        session.close();
        return;
    }
    logging::log_net(&format!("session {} accepted from {}", id, addr));

    let ctx = Arc::clone(ctx);
    thread::spawn(move || {
        if let Err(err) = handle_connection(&ctx, &session, stream, addr) {
            logging::log_net(&format!("session {} dropped: {}", session.id(), err));
        }
        disconnect_session(&ctx, &session);
    });
}

/// Owns the read half of one connection until the socket closes, the
/// session is closed elsewhere, or the server stops.
fn handle_connection(
    ctx: &Arc<ServerContext>,
    session: &Arc<Session>,
    mut stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), String> {
    // Pre-authorization reputation check; inconclusive results permit.
    if ctx.reputation.is_malicious(addr.ip()) {
        logging::log_net(&format!(
            "session {} refused: {} is blacklisted",
            session.id(),
            addr.ip()
        ));
        return Ok(());
    }
    session.set_authorized();

    // The accepted stream inherits the listener's non-blocking flag.
    stream
        .set_nonblocking(false)
        .map_err(|err| format!("blocking mode failed: {}", err))?;
    stream
        .set_read_timeout(Some(ctx.config.read_timeout))
        .map_err(|err| format!("read timeout failed: {}", err))?;

    let mut reassembler = Reassembler::new(ctx.config.max_packet);
    let mut buf = [0u8; 2048];

    loop {
        if session.is_closed() || !ctx.control.is_running() {
            return Ok(());
        }
        match stream.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => {
                let packets = reassembler.feed(&buf[..n])?;
                for packet in packets {
                    dispatch::dispatch(ctx, session, &packet);
                    if session.is_closed() {
                        return Ok(());
                    }
                }
            }
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(err) => return Err(format!("read failed: {}", err)),
        }
    }
}

/// The single teardown path. Safe to call from any thread, any number of
/// times: socket close, entity detach, final save, and registry removal
/// are each idempotent.
pub fn disconnect_session(ctx: &ServerContext, session: &Arc<Session>) {
    session.close();
    if let Some(player_id) = session.take_entity() {
        if let Some(player) = ctx.world.detach_player(player_id) {
            if let Some(store) = &ctx.store {
                if let Err(err) = store.save(&PlayerRecord::from_player(&player)) {
                    logging::log_error(&format!("logout save failed for {}: {}", player.name, err));
                }
            }
            logging::log_game(&format!("{} left the world", player.name));
        }
    }
    ctx.registry.remove(session.id());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::player::Player;
    use crate::net::codec::{
        parse_body, serialize_frame, NullCipher, PacketCipher, SaltCipher, FRAME_HEADER_BYTES,
        SALT_BYTES,
    };
    use crate::net::handlers::{
        OPCODE_LOGIN, OPCODE_VERSION, SOPCODE_HANDSHAKE, SOPCODE_WELCOME,
    };
    use crate::net::packet::{PacketReader, PacketWriter};
    use crate::net::session::testing::recording_session;
    use crate::world::map::MapId;
    use crate::world::position::Position;
    use std::io::Write;

    fn test_context() -> Arc<ServerContext> {
        ServerContext::new(GameServerConfig::default(), Arc::new(ServerControl::new()))
            .expect("context")
    }

    #[test]
    fn control_signal_transitions() {
        let control = ServerControl::new();
        assert!(control.is_running());
        control.request_shutdown();
        assert!(!control.is_running());
        assert_eq!(control.exit_reason(), ServerExit::Shutdown);
        // Fault wins over a prior shutdown request.
        control.mark_fault();
        assert_eq!(control.exit_reason(), ServerExit::Fault);
        control.request_shutdown();
        assert_eq!(control.exit_reason(), ServerExit::Fault);
    }

    #[test]
    fn disconnect_is_idempotent_and_detaches_the_entity() {
        let ctx = test_context();
        let (session, _, shutdowns) = recording_session(ctx.registry.allocate_id());
        ctx.registry.add(Arc::clone(&session)).expect("add");

        let player_id = ctx.world.allocate_player_id();
        ctx.world.add_player(Arc::new(Player::new(
            player_id,
            "Aine",
            MapId(1),
            Position::new(4, 4),
        )));
        session.bind_entity(player_id).expect("bind");

        disconnect_session(&ctx, &session);
        disconnect_session(&ctx, &session);
        disconnect_session(&ctx, &session);

        assert!(session.is_closed());
        assert!(!ctx.registry.contains(session.id()));
        assert!(ctx.world.player(player_id).is_none());
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn autosave_due_advances_and_respects_zero() {
        let mut config = GameServerConfig::default();
        config.autosave_interval = Duration::from_millis(10);
        let ctx = ServerContext::new(config, Arc::new(ServerControl::new())).expect("context");
        let later = Instant::now() + Duration::from_millis(20);
        assert!(ctx.autosave_due(later));
        assert!(!ctx.autosave_due(later));

        let mut config = GameServerConfig::default();
        config.autosave_interval = Duration::ZERO;
        let ctx = ServerContext::new(config, Arc::new(ServerControl::new())).expect("context");
        assert!(!ctx.autosave_due(Instant::now() + Duration::from_secs(3600)));
    }

    fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
        let mut header = [0u8; FRAME_HEADER_BYTES];
        stream.read_exact(&mut header).expect("frame header");
        let len = u16::from_be_bytes([header[1], header[2]]) as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).expect("frame body");
        body
    }

    #[test]
    fn loopback_handshake_and_login() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");

        let control = Arc::new(ServerControl::new());
        let ctx = ServerContext::new(GameServerConfig::default(), Arc::clone(&control))
            .expect("context");
        let server_ctx = Arc::clone(&ctx);
        let server = thread::spawn(move || run_with_listener(server_ctx, listener));

        let mut client = TcpStream::connect(addr).expect("connect");
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("timeout");

        // Version check travels in the clear.
        let mut writer = PacketWriter::new();
        writer.write_u16(ctx.config.client_version);
        let frame = serialize_frame(OPCODE_VERSION, &writer.into_vec(), &NullCipher)
            .expect("version frame");
        client.write_all(&frame).expect("send version");

        let body = read_frame(&mut client);
        let reply = parse_body(&body).expect("handshake body");
        assert_eq!(reply.opcode, SOPCODE_HANDSHAKE);
        let mut reader = PacketReader::new(&reply.payload);
        let seed = reader.read_u8().expect("seed");
        let mut salt = [0u8; SALT_BYTES];
        salt.copy_from_slice(reader.read_bytes(SALT_BYTES).expect("salt"));
        let token = reader.read_u32().expect("token");
        let cipher = SaltCipher::new(seed, salt);

        // Login travels under the negotiated cipher.
        let mut writer = PacketWriter::new();
        writer.write_u32(token);
        writer.write_string("Tiernan");
        writer.write_string("secret");
        let frame =
            serialize_frame(OPCODE_LOGIN, &writer.into_vec(), &cipher).expect("login frame");
        client.write_all(&frame).expect("send login");

        let body = read_frame(&mut client);
        let mut reply = parse_body(&body).expect("welcome body");
        assert_eq!(reply.opcode, SOPCODE_WELCOME);
        cipher.apply(SOPCODE_WELCOME, &mut reply.payload);
        let mut reader = PacketReader::new(&reply.payload);
        let _player_id = reader.read_u32().expect("player id");
        assert_eq!(reader.read_u16(), Some(1)); // starter map

        assert!(ctx.world.player_by_name("Tiernan").is_some());

        control.request_shutdown();
        let exit = server.join().expect("join").expect("run");
        assert_eq!(exit, ServerExit::Shutdown);
        assert_eq!(ctx.registry.len(), 0);
        assert!(ctx.world.player_by_name("Tiernan").is_none());
    }
}
