//! The world simulation container: concurrent collections of players,
//! monsters, NPCs, and maps, plus the single advisory lock around the
//! global trap list. Update bodies are external game content; the shapes
//! here exist so the tick loops and handlers have real state to drive.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::entities::monster::{idle_behavior, BehaviorHook, CreatureId, Monster};
use crate::entities::npc::{silent_ambient, Npc};
use crate::entities::player::{Player, PlayerId};
use crate::world::map::{MapId, MapInstance, RespawnEntry, Trap};
use crate::world::position::{Direction, Position};

pub struct World {
    players: RwLock<HashMap<PlayerId, Arc<Player>>>,
    monsters: RwLock<HashMap<CreatureId, Arc<Monster>>>,
    npcs: RwLock<HashMap<CreatureId, Arc<Npc>>>,
    maps: RwLock<HashMap<MapId, Arc<MapInstance>>>,
    traps: Mutex<Vec<Trap>>,
    next_creature_id: AtomicU32,
    next_player_id: AtomicU32,
}

impl World {
    pub fn new() -> Self {
        Self {
            players: RwLock::new(HashMap::new()),
            monsters: RwLock::new(HashMap::new()),
            npcs: RwLock::new(HashMap::new()),
            maps: RwLock::new(HashMap::new()),
            traps: Mutex::new(Vec::new()),
            next_creature_id: AtomicU32::new(1),
            next_player_id: AtomicU32::new(1),
        }
    }

    /// Starter world: one town map with a handful of monsters, NPCs, and
    /// traps so a fresh data root is playable.
    pub fn bootstrap() -> Self {
        let world = Self::new();
        let map = Arc::new(MapInstance::new(MapId(1), "Emberfall Crossing", 64, 64));
        world.add_map(Arc::clone(&map));
        for (kind, x, y, hp) in [
            ("wisp", 10u16, 12u16, 20),
            ("marsh rat", 30, 8, 35),
            ("bog stalker", 44, 50, 80),
        ] {
            world.spawn_monster(kind, MapId(1), Position::new(x, y), hp, idle_behavior);
        }
        world.add_npc("Brennan the Smith", MapId(1), Position::new(20, 20));
        world.add_npc("Sister Maeve", MapId(1), Position::new(5, 40));
        world.with_traps(|traps| {
            traps.push(Trap {
                map: MapId(1),
                position: Position::new(32, 32),
                damage: 10,
                armed: true,
            });
        });
        world
    }

    pub fn allocate_player_id(&self) -> PlayerId {
        PlayerId(self.next_player_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn allocate_creature_id(&self) -> CreatureId {
        CreatureId(self.next_creature_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn add_map(&self, map: Arc<MapInstance>) {
        self.maps.write().expect("maps lock").insert(map.id, map);
    }

    pub fn map(&self, id: MapId) -> Option<Arc<MapInstance>> {
        self.maps.read().expect("maps lock").get(&id).cloned()
    }

    pub fn maps_snapshot(&self) -> Vec<Arc<MapInstance>> {
        self.maps.read().expect("maps lock").values().cloned().collect()
    }

    pub fn add_player(&self, player: Arc<Player>) {
        self.players
            .write()
            .expect("players lock")
            .insert(player.id, player);
    }

    pub fn player(&self, id: PlayerId) -> Option<Arc<Player>> {
        self.players.read().expect("players lock").get(&id).cloned()
    }

    pub fn player_by_name(&self, name: &str) -> Option<Arc<Player>> {
        self.players
            .read()
            .expect("players lock")
            .values()
            .find(|player| player.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn players_snapshot(&self) -> Vec<Arc<Player>> {
        self.players
            .read()
            .expect("players lock")
            .values()
            .cloned()
            .collect()
    }

    /// Removes the avatar from world-visible state. Must run before the
    /// owning session is discarded so no one holds a dangling reference.
    pub fn detach_player(&self, id: PlayerId) -> Option<Arc<Player>> {
        self.players.write().expect("players lock").remove(&id)
    }

    pub fn spawn_monster(
        &self,
        kind: &str,
        map: MapId,
        position: Position,
        hp: i32,
        behavior: BehaviorHook,
    ) -> Arc<Monster> {
        let monster = Arc::new(Monster::new(
            self.allocate_creature_id(),
            kind,
            map,
            position,
            hp,
            behavior,
        ));
        self.monsters
            .write()
            .expect("monsters lock")
            .insert(monster.id, Arc::clone(&monster));
        monster
    }

    pub fn monster(&self, id: CreatureId) -> Option<Arc<Monster>> {
        self.monsters.read().expect("monsters lock").get(&id).cloned()
    }

    pub fn remove_monster(&self, id: CreatureId) -> Option<Arc<Monster>> {
        self.monsters.write().expect("monsters lock").remove(&id)
    }

    pub fn monster_count(&self) -> usize {
        self.monsters.read().expect("monsters lock").len()
    }

    /// Snapshot of live monsters grouped by the map they belong to, the
    /// iteration unit of the normal loop.
    pub fn monsters_by_map(&self) -> HashMap<MapId, Vec<Arc<Monster>>> {
        let monsters = self.monsters.read().expect("monsters lock");
        let mut grouped: HashMap<MapId, Vec<Arc<Monster>>> = HashMap::new();
        for monster in monsters.values() {
            grouped.entry(monster.map).or_default().push(Arc::clone(monster));
        }
        grouped
    }

    pub fn add_npc(&self, name: &str, map: MapId, position: Position) -> Arc<Npc> {
        let npc = Arc::new(Npc::new(
            self.allocate_creature_id(),
            name,
            map,
            position,
            silent_ambient,
        ));
        self.npcs
            .write()
            .expect("npcs lock")
            .insert(npc.id, Arc::clone(&npc));
        npc
    }

    pub fn npcs_snapshot(&self) -> Vec<Arc<Npc>> {
        self.npcs.read().expect("npcs lock").values().cloned().collect()
    }

    /// Runs `body` under the global trap list lock.
    pub fn with_traps<R>(&self, body: impl FnOnce(&mut Vec<Trap>) -> R) -> R {
        let mut traps = self.traps.lock().expect("trap list lock");
        body(&mut traps)
    }

    /// One step for a player: clamps to the map and records the facing.
    pub fn move_player(&self, player: &Player, direction: Direction) -> Result<Position, String> {
        let placement = player.placement();
        let map = self
            .map(placement.map)
            .ok_or_else(|| format!("player {} is on unknown map {}", player.id.0, placement.map.0))?;
        let next = map.clamp(direction.step_from(placement.position));
        player.set_position(next);
        player.set_direction(direction);
        Ok(next)
    }

    /// Death side effects for a monster whose skull was just claimed:
    /// remove it from the live set and schedule its respawn on the map.
    pub fn handle_monster_death(&self, monster: &Monster, respawn_delay: Duration) {
        self.remove_monster(monster.id);
        if let Some(map) = self.map(monster.map) {
            map.schedule_respawn(RespawnEntry {
                kind: monster.kind.clone(),
                position: monster.position(),
                hp: monster.max_hp(),
                remaining: respawn_delay,
            });
        }
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}
