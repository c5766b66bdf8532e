//! Opcode dispatch: a fixed 256-entry table built once at startup by
//! explicit registration, plus the pre-dispatch gates every inbound packet
//! passes through in order.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::net::codec::Packet;
use crate::net::handlers::{
    OPCODE_HEARTBEAT, OPCODE_MOVE, OPCODE_OPTIONS_PANEL, OPCODE_PROFILE_REQUEST, OPCODE_REFRESH,
    OPCODE_TOGGLE_WORLD_MAP, OPCODE_WORLD_MAP_CLICK,
};
use crate::net::packet::PacketReader;
use crate::net::server::{disconnect_session, ServerContext};
use crate::net::session::{RateDecision, Session};
use crate::telemetry::logging;

pub type HandlerFn = fn(&ServerContext, &Arc<Session>, &mut PacketReader) -> Result<(), String>;

#[derive(Clone, Copy)]
pub struct PacketHandler {
    pub opcode: u8,
    pub name: &'static str,
    pub handler: HandlerFn,
}

pub struct DispatchTable {
    entries: [Option<PacketHandler>; 256],
}

impl DispatchTable {
    /// Built once at startup. A duplicate registration is a configuration
    /// bug and fails startup instead of silently shadowing a handler.
    pub fn build(handlers: &[PacketHandler]) -> Result<Self, String> {
        let mut entries = [None; 256];
        for handler in handlers {
            let slot = &mut entries[handler.opcode as usize];
            if slot.is_some() {
                return Err(format!(
                    "duplicate handler registration for opcode 0x{:02x} ({})",
                    handler.opcode, handler.name
                ));
            }
            *slot = Some(*handler);
        }
        Ok(Self { entries })
    }

    pub fn get(&self, opcode: u8) -> Option<&PacketHandler> {
        self.entries[opcode as usize].as_ref()
    }

    pub fn bound_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_some()).count()
    }
}

/// Minimum intervals for opcodes clients are known to spam. Everything
/// else dispatches unthrottled.
const RATE_LIMITS: &[(u8, Duration)] = &[
    (OPCODE_MOVE, Duration::from_millis(250)),
    (OPCODE_REFRESH, Duration::from_millis(1000)),
    (OPCODE_OPTIONS_PANEL, Duration::from_millis(500)),
    (OPCODE_PROFILE_REQUEST, Duration::from_millis(1000)),
];

fn rate_limit_for(opcode: u8) -> Option<Duration> {
    RATE_LIMITS
        .iter()
        .find(|(limited, _)| *limited == opcode)
        .map(|(_, min)| *min)
}

/// Opcodes still accepted while the full-map overlay is open.
const WORLD_MAP_ALLOWED: &[u8] = &[
    OPCODE_WORLD_MAP_CLICK,
    OPCODE_TOGGLE_WORLD_MAP,
    OPCODE_HEARTBEAT,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    DroppedUnknown,
    DroppedUnregistered,
    DroppedModal,
    DroppedRateLimited,
    Disconnected,
}

/// Runs the gates in order, then the handler inside a per-packet failure
/// boundary. A handler error or panic disconnects this session only.
pub fn dispatch(ctx: &ServerContext, session: &Arc<Session>, packet: &Packet) -> DispatchOutcome {
    // Unknown opcodes are protocol gaps, not errors.
    let Some(handler) = ctx.dispatch.get(packet.opcode) else {
        return DispatchOutcome::DroppedUnknown;
    };

    // A packet can race ahead of socket teardown; the registry is the
    // authority for liveness.
    if !ctx.registry.contains(session.id()) {
        return DispatchOutcome::DroppedUnregistered;
    }

    if session.is_world_map_open() && !WORLD_MAP_ALLOWED.contains(&packet.opcode) {
        return DispatchOutcome::DroppedModal;
    }

    if session.id() == 0 {
        logging::log_net("packet from session id zero; disconnecting");
        disconnect_session(ctx, session);
        return DispatchOutcome::Disconnected;
    }

    let now = Instant::now();
    if let Some(min_interval) = rate_limit_for(packet.opcode) {
        if session.rate_gate(packet.opcode, min_interval, now) == RateDecision::Drop {
            return DispatchOutcome::DroppedRateLimited;
        }
    }

    session.touch(now, packet.opcode == OPCODE_HEARTBEAT);

    let mut payload = packet.payload.clone();
    session.decipher(packet.opcode, &mut payload);
    session.record_trace("in", packet.opcode, &payload);

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let mut reader = PacketReader::new(&payload);
        (handler.handler)(ctx, session, &mut reader)
    }));

    match outcome {
        Ok(Ok(())) => DispatchOutcome::Handled,
        Ok(Err(err)) => {
            logging::log_error(&format!(
                "handler {} (opcode 0x{:02x}) failed for session {}: {}",
                handler.name,
                packet.opcode,
                session.id(),
                err
            ));
            disconnect_session(ctx, session);
            DispatchOutcome::Disconnected
        }
        Err(_) => {
            logging::log_error(&format!(
                "handler {} (opcode 0x{:02x}) panicked for session {}",
                handler.name,
                packet.opcode,
                session.id()
            ));
            disconnect_session(ctx, session);
            DispatchOutcome::Disconnected
        }
    }
}
