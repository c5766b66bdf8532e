use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::world::position::Position;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MapId(pub u16);

/// A pending monster respawn owned by its map, counted down by the slow
/// loop.
#[derive(Debug, Clone)]
pub struct RespawnEntry {
    pub kind: String,
    pub position: Position,
    pub hp: i32,
    pub remaining: Duration,
}

/// A floor trap. The global trap list lock lives in `World`; entries only
/// carry data.
#[derive(Debug, Clone)]
pub struct Trap {
    pub map: MapId,
    pub position: Position,
    pub damage: i32,
    pub armed: bool,
}

pub struct MapInstance {
    pub id: MapId,
    pub name: String,
    pub width: u16,
    pub height: u16,
    respawns: Mutex<Vec<RespawnEntry>>,
}

impl MapInstance {
    pub fn new(id: MapId, name: impl Into<String>, width: u16, height: u16) -> Self {
        Self {
            id,
            name: name.into(),
            width,
            height,
            respawns: Mutex::new(Vec::new()),
        }
    }

    pub fn contains(&self, position: Position) -> bool {
        position.x < self.width && position.y < self.height
    }

    pub fn clamp(&self, position: Position) -> Position {
        Position::new(
            position.x.min(self.width.saturating_sub(1)),
            position.y.min(self.height.saturating_sub(1)),
        )
    }

    pub fn schedule_respawn(&self, entry: RespawnEntry) {
        self.respawns.lock().expect("respawn lock").push(entry);
    }

    pub fn pending_respawns(&self) -> usize {
        self.respawns.lock().expect("respawn lock").len()
    }

    /// Counts pending respawns down by `elapsed` and returns the entries
    /// that came due.
    pub fn tick_respawns(&self, elapsed: Duration) -> Vec<RespawnEntry> {
        let mut respawns = self.respawns.lock().expect("respawn lock");
        let mut due = Vec::new();
        let mut idx = 0;
        while idx < respawns.len() {
            respawns[idx].remaining = respawns[idx].remaining.saturating_sub(elapsed);
            if respawns[idx].remaining.is_zero() {
                due.push(respawns.remove(idx));
            } else {
                idx += 1;
            }
        }
        due
    }
}
