//! Per-opcode packet handlers and the startup registration list.
//!
//! Handlers return `Err` for protocol violations; the dispatcher turns
//! that into a logged disconnect of the offending session. Anything a
//! well-behaved client can trigger is handled without an error.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::net::codec::derive_handshake;
use crate::net::dispatch::{DispatchTable, PacketHandler};
use crate::net::packet::{PacketReader, PacketWriter};
use crate::net::server::{disconnect_session, ServerContext};
use crate::net::session::Session;
use crate::persistence::store::PlayerRecord;
use crate::telemetry::logging;
use crate::world::map::MapId;
use crate::world::position::{Direction, Position};

// Client-to-server opcodes.
pub const OPCODE_VERSION: u8 = 0x00;
pub const OPCODE_LOGIN: u8 = 0x03;
pub const OPCODE_MOVE: u8 = 0x06;
pub const OPCODE_EXIT: u8 = 0x0b;
pub const OPCODE_PROFILE_REQUEST: u8 = 0x2d;
pub const OPCODE_REFRESH: u8 = 0x38;
pub const OPCODE_WORLD_MAP_CLICK: u8 = 0x3e;
pub const OPCODE_TOGGLE_WORLD_MAP: u8 = 0x3f;
pub const OPCODE_HEARTBEAT: u8 = 0x45;
pub const OPCODE_OPTIONS_PANEL: u8 = 0x4b;

// Server-to-client opcodes.
pub const SOPCODE_NOTICE: u8 = 0x0a;
pub const SOPCODE_WELCOME: u8 = 0x17;
pub const SOPCODE_MOVE_CONFIRM: u8 = 0x1c;
pub const SOPCODE_REFRESH_DONE: u8 = 0x22;
pub const SOPCODE_PROFILE: u8 = 0x34;
pub const SOPCODE_HEARTBEAT: u8 = 0x3b;
pub const SOPCODE_WORLD_MAP: u8 = 0x2e;
pub const SOPCODE_WARP: u8 = 0x2f;
pub const SOPCODE_OPTIONS_ACK: u8 = 0x4c;
pub const SOPCODE_HANDSHAKE: u8 = 0x7e;

const MAX_NAME_LEN: usize = 30;

/// Every handler the server answers to, registered once at startup.
pub fn build_dispatch_table() -> Result<DispatchTable, String> {
    DispatchTable::build(&[
        PacketHandler {
            opcode: OPCODE_VERSION,
            name: "version",
            handler: handle_version,
        },
        PacketHandler {
            opcode: OPCODE_LOGIN,
            name: "login",
            handler: handle_login,
        },
        PacketHandler {
            opcode: OPCODE_MOVE,
            name: "move",
            handler: handle_move,
        },
        PacketHandler {
            opcode: OPCODE_EXIT,
            name: "exit",
            handler: handle_exit,
        },
        PacketHandler {
            opcode: OPCODE_PROFILE_REQUEST,
            name: "profile_request",
            handler: handle_profile_request,
        },
        PacketHandler {
            opcode: OPCODE_REFRESH,
            name: "refresh",
            handler: handle_refresh,
        },
        PacketHandler {
            opcode: OPCODE_WORLD_MAP_CLICK,
            name: "world_map_click",
            handler: handle_world_map_click,
        },
        PacketHandler {
            opcode: OPCODE_TOGGLE_WORLD_MAP,
            name: "toggle_world_map",
            handler: handle_toggle_world_map,
        },
        PacketHandler {
            opcode: OPCODE_HEARTBEAT,
            name: "heartbeat",
            handler: handle_heartbeat,
        },
        PacketHandler {
            opcode: OPCODE_OPTIONS_PANEL,
            name: "options_panel",
            handler: handle_options_panel,
        },
    ])
}

/// First packet of a connection: client version check, then the cipher
/// handshake. The reply travels before the new cipher is installed, so the
/// client reads it with the null cipher it still has.
fn handle_version(
    ctx: &ServerContext,
    session: &Arc<Session>,
    reader: &mut PacketReader,
) -> Result<(), String> {
    if !session.is_authorized() {
        return Err("version packet before authorization".to_string());
    }
    let version = reader
        .read_u16()
        .ok_or_else(|| "version packet too short".to_string())?;
    if version != ctx.config.client_version {
        return Err(format!(
            "unsupported client version {} (want {})",
            version, ctx.config.client_version
        ));
    }

    let nonce = unix_nanos();
    let cipher = derive_handshake(session.id(), nonce);
    let token = (nonce as u32) ^ session.id();

    let mut writer = PacketWriter::with_capacity(32);
    writer.write_u8(cipher.seed());
    writer.write_bytes(cipher.salt());
    writer.write_u32(token);
    session.send(SOPCODE_HANDSHAKE, &writer.into_vec())?;

    session.install_cipher(Arc::new(cipher));
    session.set_redirect_token(token);
    Ok(())
}

fn handle_login(
    ctx: &ServerContext,
    session: &Arc<Session>,
    reader: &mut PacketReader,
) -> Result<(), String> {
    let token = reader
        .read_u32()
        .ok_or_else(|| "login packet too short".to_string())?;
    match session.take_redirect_token() {
        Some(expected) if expected == token => {}
        _ => return Err("login token mismatch".to_string()),
    }

    let name = reader
        .read_string_limited(MAX_NAME_LEN)
        .ok_or_else(|| "login packet missing name".to_string())?;
    let password = reader
        .read_string()
        .ok_or_else(|| "login packet missing password".to_string())?;
    if name.trim().is_empty() {
        return Err("login name is empty".to_string());
    }

    if let Some(bans) = &ctx.bans {
        if bans.is_banned(&name, SystemTime::now()) {
            logging::log_game(&format!("banned account {} refused", name));
            return Err(format!("account {} is banned", name));
        }
    }
    if let Some(accounts) = &ctx.accounts {
        if accounts.verify(&name, &password).is_none() {
            return Err(format!("bad credentials for {}", name));
        }
    }

    // A second login for the same character evicts the older session.
    if let Some(existing) = ctx.world.player_by_name(&name) {
        for other in ctx.registry.snapshot() {
            if other.id() != session.id() && other.entity() == Some(existing.id) {
                logging::log_game(&format!(
                    "{} logged in again; evicting session {}",
                    name,
                    other.id()
                ));
                disconnect_session(ctx, &other);
            }
        }
    }

    let record = match &ctx.store {
        Some(store) => store
            .load(&name)?
            .unwrap_or_else(|| PlayerRecord::starter(&name)),
        None => PlayerRecord::starter(&name),
    };
    let player_id = ctx.world.allocate_player_id();
    let player = Arc::new(record.into_player(player_id));

    session.bind_entity(player_id)?;
    ctx.world.add_player(Arc::clone(&player));
    session.set_authenticated();

    let placement = player.placement();
    let mut writer = PacketWriter::with_capacity(16);
    writer.write_u32(player_id.0);
    writer.write_u16(placement.map.0);
    writer.write_u16(placement.position.x);
    writer.write_u16(placement.position.y);
    writer.write_string(&player.name);
    session.send(SOPCODE_WELCOME, &writer.into_vec())?;

    logging::log_game(&format!("{} entered the world", player.name));
    Ok(())
}

fn handle_move(
    ctx: &ServerContext,
    session: &Arc<Session>,
    reader: &mut PacketReader,
) -> Result<(), String> {
    let player = owned_player(ctx, session)?;
    // Movement during a warp is stale client input, not a violation.
    if player.is_warping() {
        return Ok(());
    }
    let direction = reader
        .read_u8()
        .and_then(Direction::from_u8)
        .ok_or_else(|| "move packet has no valid direction".to_string())?;
    let next = ctx.world.move_player(&player, direction)?;

    let mut writer = PacketWriter::with_capacity(8);
    writer.write_u16(next.x);
    writer.write_u16(next.y);
    writer.write_u8(direction.to_u8());
    session.send(SOPCODE_MOVE_CONFIRM, &writer.into_vec())
}

fn handle_refresh(
    ctx: &ServerContext,
    session: &Arc<Session>,
    _reader: &mut PacketReader,
) -> Result<(), String> {
    let player = owned_player(ctx, session)?;
    let placement = player.placement();
    let mut writer = PacketWriter::with_capacity(8);
    writer.write_u16(placement.map.0);
    writer.write_u16(placement.position.x);
    writer.write_u16(placement.position.y);
    session.send(SOPCODE_REFRESH_DONE, &writer.into_vec())
}

fn handle_profile_request(
    ctx: &ServerContext,
    session: &Arc<Session>,
    _reader: &mut PacketReader,
) -> Result<(), String> {
    let player = owned_player(ctx, session)?;
    let status = player.status();
    let mut writer = PacketWriter::with_capacity(32);
    writer.write_string(&player.name);
    writer.write_u16(status.level);
    writer.write_u32(status.hp);
    writer.write_u32(status.max_hp);
    writer.write_u32(status.threat);
    session.send(SOPCODE_PROFILE, &writer.into_vec())
}

fn handle_options_panel(
    _ctx: &ServerContext,
    session: &Arc<Session>,
    reader: &mut PacketReader,
) -> Result<(), String> {
    let option = reader
        .read_u8()
        .ok_or_else(|| "options packet too short".to_string())?;
    session.send(SOPCODE_OPTIONS_ACK, &[option])
}

/// Past gate six a heartbeat carries no state; the optional echo value is
/// client diagnostics only.
fn handle_heartbeat(
    _ctx: &ServerContext,
    _session: &Arc<Session>,
    _reader: &mut PacketReader,
) -> Result<(), String> {
    Ok(())
}

fn handle_toggle_world_map(
    ctx: &ServerContext,
    session: &Arc<Session>,
    _reader: &mut PacketReader,
) -> Result<(), String> {
    owned_player(ctx, session)?;
    let open = !session.is_world_map_open();
    session.set_world_map_open(open);
    session.send(SOPCODE_WORLD_MAP, &[open as u8])
}

/// Warp request from the full-map overlay. The warping flag brackets the
/// placement change so tick updates skip the avatar mid-transition, and the
/// overlay closes on completion.
fn handle_world_map_click(
    ctx: &ServerContext,
    session: &Arc<Session>,
    reader: &mut PacketReader,
) -> Result<(), String> {
    if !session.is_world_map_open() {
        return Err("world map click without the overlay open".to_string());
    }
    let player = owned_player(ctx, session)?;
    let map_id = MapId(
        reader
            .read_u16()
            .ok_or_else(|| "world map click too short".to_string())?,
    );
    let x = reader
        .read_u16()
        .ok_or_else(|| "world map click too short".to_string())?;
    let y = reader
        .read_u16()
        .ok_or_else(|| "world map click too short".to_string())?;
    let map = ctx
        .world
        .map(map_id)
        .ok_or_else(|| format!("warp to unknown map {}", map_id.0))?;

    player.begin_warp();
    let target = map.clamp(Position::new(x, y));
    player.set_placement(map_id, target);
    player.end_warp();
    session.set_world_map_open(false);

    let mut writer = PacketWriter::with_capacity(8);
    writer.write_u16(map_id.0);
    writer.write_u16(target.x);
    writer.write_u16(target.y);
    session.send(SOPCODE_WARP, &writer.into_vec())
}

/// Orderly logout: the farewell is best effort, the save and teardown are
/// the same path an abrupt disconnect takes.
fn handle_exit(
    ctx: &ServerContext,
    session: &Arc<Session>,
    _reader: &mut PacketReader,
) -> Result<(), String> {
    let mut writer = PacketWriter::new();
    writer.write_string("Farewell.");
    let _ = session.send(SOPCODE_NOTICE, &writer.into_vec());
    disconnect_session(ctx, session);
    Ok(())
}

fn owned_player(
    ctx: &ServerContext,
    session: &Arc<Session>,
) -> Result<Arc<crate::entities::player::Player>, String> {
    let player_id = session
        .entity()
        .ok_or_else(|| "packet requires a logged-in character".to_string())?;
    ctx.world
        .player(player_id)
        .ok_or_else(|| format!("entity {} is not in the world", player_id.0))
}

fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
