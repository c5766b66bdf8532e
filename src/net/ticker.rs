//! The three concurrent tick loops. Each loop owns its own clock and
//! measures real elapsed time per iteration, so updates scale with wall
//! time instead of assuming the nominal interval. A failing item is logged
//! and abandoned for that tick; a failing loop driver stops the server.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::entities::monster::{idle_behavior, Monster};
use crate::net::handlers::{SOPCODE_HEARTBEAT, SOPCODE_NOTICE};
use crate::net::packet::PacketWriter;
use crate::net::server::{disconnect_session, ServerContext};
use crate::net::session::Session;
use crate::telemetry::logging;

/// Per-loop elapsed-time source. `tick` advances by exactly the span it
/// returns, so a late iteration yields a proportionally larger elapsed and
/// the clock never drifts from wall time.
#[derive(Debug, Clone, Copy)]
pub struct TickClock {
    last: Instant,
}

impl TickClock {
    pub fn new(now: Instant) -> Self {
        Self { last: now }
    }

    pub fn tick(&mut self, now: Instant) -> Duration {
        let elapsed = now.duration_since(self.last);
        self.last += elapsed;
        elapsed
    }

    pub fn reset(&mut self, now: Instant) {
        self.last = now;
    }
}

pub fn spawn_tick_loops(ctx: Arc<ServerContext>) -> Vec<JoinHandle<()>> {
    vec![
        spawn_loop("fast", ctx.config.fast_interval, Arc::clone(&ctx), fast_pass),
        spawn_loop(
            "normal",
            ctx.config.normal_interval,
            Arc::clone(&ctx),
            normal_pass,
        ),
        spawn_loop("slow", ctx.config.slow_interval, ctx, slow_pass),
    ]
}

fn spawn_loop(
    name: &'static str,
    interval: Duration,
    ctx: Arc<ServerContext>,
    pass: fn(&ServerContext, Duration),
) -> JoinHandle<()> {
    thread::spawn(move || {
        let driver = catch_unwind(AssertUnwindSafe(|| {
            let mut clock = TickClock::new(Instant::now());
            while ctx.control.is_running() {
                let elapsed = clock.tick(Instant::now());
                if elapsed > interval * 4 && !interval.is_zero() {
                    logging::log_lag(&format!(
                        "{} loop fell behind: {:?} elapsed for a {:?} interval",
                        name, elapsed, interval
                    ));
                }
                pass(&ctx, elapsed);
                thread::sleep(interval);
            }
        }));
        if driver.is_err() {
            logging::log_error(&format!("{} loop driver failed; stopping server", name));
            eprintln!("runegate: {} loop driver failed; stopping server", name);
            ctx.control.mark_fault();
        }
    })
}

/// Fast loop: connection liveness. Outbound heartbeats, queued notice
/// delivery and expiry, idle warnings and disconnects, and the periodic
/// save trigger.
pub fn fast_pass(ctx: &ServerContext, _elapsed: Duration) {
    for session in ctx.registry.snapshot() {
        let result = catch_unwind(AssertUnwindSafe(|| fast_update_session(ctx, &session)));
        if result.is_err() {
            logging::log_error(&format!(
                "liveness update failed for session {}",
                session.id()
            ));
        }
    }

    if ctx.autosave_due(Instant::now()) {
        if let Some(store) = &ctx.store {
            let players = ctx.world.players_snapshot();
            for player in &players {
                store.quick_save(player);
            }
            logging::log_game(&format!("autosave queued for {} players", players.len()));
        }
    }
}

fn fast_update_session(ctx: &ServerContext, session: &Arc<Session>) {
    let now = Instant::now();

    let idle = now.duration_since(session.last_active());
    if idle >= ctx.config.idle_disconnect_after {
        logging::log_net(&format!(
            "session {} idle for {:?}; disconnecting",
            session.id(),
            idle
        ));
        disconnect_session(ctx, session);
        return;
    }
    if idle >= ctx.config.idle_warning_after && session.mark_idle_warned() {
        let mut writer = PacketWriter::new();
        writer.write_string("You have been idle and will be disconnected soon.");
        if session.send(SOPCODE_NOTICE, &writer.into_vec()).is_err() {
            disconnect_session(ctx, session);
            return;
        }
    }

    for notice in session.take_notices() {
        // Stale notices are dropped rather than delivered late.
        if notice.queued_at.elapsed() > ctx.config.notice_max_age {
            continue;
        }
        let mut writer = PacketWriter::new();
        writer.write_string(&notice.text);
        if session.send(SOPCODE_NOTICE, &writer.into_vec()).is_err() {
            disconnect_session(ctx, session);
            return;
        }
    }

    if session.heartbeat_due(ctx.config.heartbeat_interval, now)
        && session.send(SOPCODE_HEARTBEAT, &[]).is_err()
    {
        disconnect_session(ctx, session);
    }
}

/// Normal loop: simulation. Player status decay, monster behavior scripts,
/// trap activation, and death handling.
pub fn normal_pass(ctx: &ServerContext, elapsed: Duration) {
    for session in ctx.registry.snapshot() {
        let result = catch_unwind(AssertUnwindSafe(|| {
            let Some(player_id) = session.entity() else {
                return;
            };
            let Some(player) = ctx.world.player(player_id) else {
                return;
            };
            // Mid-warp avatars are in placement flux; skip this tick.
            if player.is_warping() {
                return;
            }
            player.update_status(elapsed);
        }));
        if result.is_err() {
            logging::log_error(&format!(
                "player update failed for session {}",
                session.id()
            ));
        }
    }

    for (map_id, monsters) in ctx.world.monsters_by_map() {
        for monster in monsters {
            let result =
                catch_unwind(AssertUnwindSafe(|| update_monster(ctx, &monster, elapsed)));
            if result.is_err() {
                logging::log_error(&format!(
                    "monster update failed for {} {} on map {}",
                    monster.kind, monster.id.0, map_id.0
                ));
            }
        }
    }
}

fn update_monster(ctx: &ServerContext, monster: &Arc<Monster>, elapsed: Duration) {
    monster.run_behavior(elapsed);
    monster.decay_statuses(elapsed);

    let trap_damage = ctx.world.with_traps(|traps| {
        let position = monster.position();
        let mut total = 0;
        for trap in traps.iter_mut() {
            if trap.armed && trap.map == monster.map && trap.position == position {
                trap.armed = false;
                total += trap.damage;
            }
        }
        total
    });
    if trap_damage > 0 {
        monster.apply_damage(trap_damage);
    }

    // Exactly one tick wins the skull claim and runs death side effects.
    if monster.claim_skull() {
        ctx.world
            .handle_monster_death(monster, ctx.config.respawn_delay);
        logging::log_game(&format!("{} was slain on map {}", monster.kind, monster.map.0));
    }
}

/// Slow loop: background work. NPC ambient scripts and respawn countdowns.
pub fn slow_pass(ctx: &ServerContext, elapsed: Duration) {
    for npc in ctx.world.npcs_snapshot() {
        let result = catch_unwind(AssertUnwindSafe(|| npc.run_ambient(elapsed)));
        if result.is_err() {
            logging::log_error(&format!("ambient script failed for {}", npc.name));
        }
    }

    for map in ctx.world.maps_snapshot() {
        let result = catch_unwind(AssertUnwindSafe(|| {
            for entry in map.tick_respawns(elapsed) {
                ctx.world
                    .spawn_monster(&entry.kind, map.id, entry.position, entry.hp, idle_behavior);
                logging::log_game(&format!(
                    "{} respawned on map {}",
                    entry.kind, map.id.0
                ));
            }
        }));
        if result.is_err() {
            logging::log_error(&format!("respawn pass failed for map {}", map.id.0));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::status::TimedStatus;
    use crate::net::codec::{parse_body, FRAME_HEADER_BYTES};
    use crate::net::server::{GameServerConfig, ServerControl};
    use crate::net::session::testing::recording_session;
    use crate::world::map::MapId;
    use crate::world::position::Position;

    fn context_with(config: GameServerConfig) -> Arc<ServerContext> {
        ServerContext::new(config, Arc::new(ServerControl::new())).expect("context")
    }

    fn opcodes(frames: &std::sync::Mutex<Vec<Vec<u8>>>) -> Vec<u8> {
        frames
            .lock()
            .expect("frames")
            .iter()
            .map(|frame| parse_body(&frame[FRAME_HEADER_BYTES..]).expect("body").opcode)
            .collect()
    }

    #[test]
    fn tick_clock_returns_real_elapsed_time() {
        let t0 = Instant::now();
        let mut clock = TickClock::new(t0);
        // On schedule.
        assert_eq!(clock.tick(t0 + Duration::from_millis(40)), Duration::from_millis(40));
        // A delayed iteration reports the full span, not the nominal one.
        assert_eq!(
            clock.tick(t0 + Duration::from_millis(40 + 250)),
            Duration::from_millis(250)
        );
        // Back on schedule afterwards, with no accumulated drift.
        assert_eq!(
            clock.tick(t0 + Duration::from_millis(40 + 250 + 40)),
            Duration::from_millis(40)
        );
    }

    #[test]
    fn tick_clock_reset_discards_the_gap() {
        let t0 = Instant::now();
        let mut clock = TickClock::new(t0);
        clock.reset(t0 + Duration::from_secs(60));
        assert_eq!(
            clock.tick(t0 + Duration::from_secs(60) + Duration::from_millis(5)),
            Duration::from_millis(5)
        );
    }

    #[test]
    fn fast_pass_sends_due_heartbeats() {
        let mut config = GameServerConfig::default();
        config.heartbeat_interval = Duration::ZERO;
        let ctx = context_with(config);
        let (session, frames, _) = recording_session(ctx.registry.allocate_id());
        ctx.registry.add(Arc::clone(&session)).expect("add");

        fast_pass(&ctx, Duration::from_millis(40));
        assert!(opcodes(&frames).contains(&SOPCODE_HEARTBEAT));
        assert!(!session.is_closed());
    }

    #[test]
    fn fast_pass_disconnects_idle_sessions() {
        let mut config = GameServerConfig::default();
        config.idle_disconnect_after = Duration::ZERO;
        let ctx = context_with(config);
        let (session, _, _) = recording_session(ctx.registry.allocate_id());
        ctx.registry.add(Arc::clone(&session)).expect("add");

        fast_pass(&ctx, Duration::from_millis(40));
        assert!(session.is_closed());
        assert!(!ctx.registry.contains(session.id()));
    }

    #[test]
    fn fast_pass_warns_idle_sessions_once() {
        let mut config = GameServerConfig::default();
        config.idle_warning_after = Duration::ZERO;
        let ctx = context_with(config);
        let (session, frames, _) = recording_session(ctx.registry.allocate_id());
        ctx.registry.add(Arc::clone(&session)).expect("add");

        fast_pass(&ctx, Duration::from_millis(40));
        fast_pass(&ctx, Duration::from_millis(40));
        let notices = opcodes(&frames)
            .into_iter()
            .filter(|opcode| *opcode == SOPCODE_NOTICE)
            .count();
        assert_eq!(notices, 1);
        assert!(!session.is_closed());
    }

    #[test]
    fn fast_pass_delivers_fresh_notices_and_drops_stale_ones() {
        let mut config = GameServerConfig::default();
        config.notice_max_age = Duration::from_secs(30);
        let ctx = context_with(config);
        let (session, frames, _) = recording_session(ctx.registry.allocate_id());
        ctx.registry.add(Arc::clone(&session)).expect("add");

        session.queue_notice("The realm save is complete.");
        fast_pass(&ctx, Duration::from_millis(40));
        assert_eq!(opcodes(&frames), vec![SOPCODE_NOTICE]);

        let mut config = GameServerConfig::default();
        config.notice_max_age = Duration::ZERO;
        let ctx = context_with(config);
        let (session, frames, _) = recording_session(ctx.registry.allocate_id());
        ctx.registry.add(Arc::clone(&session)).expect("add");

        session.queue_notice("too late");
        std::thread::sleep(Duration::from_millis(5));
        fast_pass(&ctx, Duration::from_millis(40));
        assert!(opcodes(&frames).is_empty());
    }

    #[test]
    fn normal_pass_decays_player_buffs_but_skips_warping_avatars() {
        let ctx = context_with(GameServerConfig::default());
        let (active, _, _) = recording_session(ctx.registry.allocate_id());
        let (warping, _, _) = recording_session(ctx.registry.allocate_id());
        ctx.registry.add(Arc::clone(&active)).expect("add");
        ctx.registry.add(Arc::clone(&warping)).expect("add");

        for (session, name) in [(&active, "Aine"), (&warping, "Bran")] {
            let id = ctx.world.allocate_player_id();
            let player = Arc::new(crate::entities::player::Player::new(
                id,
                name,
                MapId(1),
                Position::new(4, 4),
            ));
            player.apply_buff(TimedStatus::new("haste", Duration::from_millis(50), 10));
            ctx.world.add_player(player);
            session.bind_entity(id).expect("bind");
        }
        let warping_player = ctx.world.player(warping.entity().expect("id")).expect("player");
        warping_player.begin_warp();

        normal_pass(&ctx, Duration::from_millis(100));

        let active_player = ctx.world.player(active.entity().expect("id")).expect("player");
        assert!(active_player.status().buffs.is_empty());
        assert_eq!(warping_player.status().buffs.len(), 1);
    }

    #[test]
    fn normal_pass_contains_a_panicking_behavior_script() {
        fn berserk(_monster: &Monster, _elapsed: Duration) {
            panic!("script bug");
        }
        let ctx = context_with(GameServerConfig::default());
        ctx.world
            .spawn_monster("gremlin", MapId(1), Position::new(2, 2), 10, berserk);
        let witness =
            ctx.world
                .spawn_monster("wisp", MapId(1), Position::new(3, 3), 10, idle_behavior);
        witness.apply_status(TimedStatus::new("poison", Duration::from_millis(50), 0));

        normal_pass(&ctx, Duration::from_millis(100));

        // The panic stayed contained and every other monster still updated.
        assert_eq!(witness.status_count(), 0);
    }

    #[test]
    fn normal_pass_handles_death_exactly_once() {
        let ctx = context_with(GameServerConfig::default());
        let map = ctx.world.map(MapId(1)).expect("map");
        let victim =
            ctx.world
                .spawn_monster("rat", MapId(1), Position::new(6, 6), 5, idle_behavior);
        victim.apply_damage(10);
        let live_before = ctx.world.monster_count();

        normal_pass(&ctx, Duration::from_millis(80));
        assert_eq!(ctx.world.monster_count(), live_before - 1);
        assert_eq!(map.pending_respawns(), 1);

        normal_pass(&ctx, Duration::from_millis(80));
        assert_eq!(map.pending_respawns(), 1);
    }

    #[test]
    fn traps_fire_once_per_arming() {
        let ctx = context_with(GameServerConfig::default());
        let monster = ctx.world.spawn_monster(
            "bait",
            MapId(1),
            Position::new(32, 32),
            100,
            idle_behavior,
        );
        normal_pass(&ctx, Duration::from_millis(80));
        assert_eq!(monster.hp(), 90);
        normal_pass(&ctx, Duration::from_millis(80));
        assert_eq!(monster.hp(), 90);
    }

    #[test]
    fn slow_pass_respawns_due_entries() {
        let ctx = context_with(GameServerConfig::default());
        let victim =
            ctx.world
                .spawn_monster("wisp", MapId(1), Position::new(8, 8), 5, idle_behavior);
        victim.apply_damage(10);
        assert!(victim.claim_skull());
        ctx.world
            .handle_monster_death(&victim, Duration::from_millis(50));
        let live_before = ctx.world.monster_count();

        // Not due yet.
        slow_pass(&ctx, Duration::from_millis(20));
        assert_eq!(ctx.world.monster_count(), live_before);

        slow_pass(&ctx, Duration::from_millis(100));
        assert_eq!(ctx.world.monster_count(), live_before + 1);
    }

    #[test]
    fn autosave_writes_player_records() {
        let root = std::env::temp_dir().join(format!(
            "runegate-autosave-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&root);
        std::fs::create_dir_all(&root).expect("root");

        let mut config = GameServerConfig::default();
        config.root = Some(root.clone());
        config.autosave_interval = Duration::from_millis(1);
        let ctx = context_with(config);

        let id = ctx.world.allocate_player_id();
        ctx.world.add_player(Arc::new(crate::entities::player::Player::new(
            id,
            "AutoAine",
            MapId(1),
            Position::new(4, 4),
        )));

        std::thread::sleep(Duration::from_millis(5));
        fast_pass(&ctx, Duration::from_millis(40));
        // quick_save is fire and forget; give the writer thread a moment.
        std::thread::sleep(Duration::from_millis(200));

        let store = ctx.store.as_ref().expect("store");
        assert!(store.load("AutoAine").expect("load").is_some());
        let _ = std::fs::remove_dir_all(&root);
    }
}
