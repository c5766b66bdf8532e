use std::sync::Mutex;
use std::time::Duration;

use crate::entities::monster::CreatureId;
use crate::world::map::MapId;
use crate::world::position::Position;

/// Ambient script hook for the slow loop. Script content is external;
/// only the scheduling contract lives here.
pub type AmbientHook = fn(&Npc, Duration);

pub fn silent_ambient(_npc: &Npc, _elapsed: Duration) {}

pub struct Npc {
    pub id: CreatureId,
    pub name: String,
    pub map: MapId,
    position: Mutex<Position>,
    ambient: AmbientHook,
}

impl Npc {
    pub fn new(
        id: CreatureId,
        name: impl Into<String>,
        map: MapId,
        position: Position,
        ambient: AmbientHook,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            map,
            position: Mutex::new(position),
            ambient,
        }
    }

    pub fn position(&self) -> Position {
        *self.position.lock().expect("position lock")
    }

    pub fn set_position(&self, position: Position) {
        *self.position.lock().expect("position lock") = position;
    }

    pub fn run_ambient(&self, elapsed: Duration) {
        (self.ambient)(self, elapsed);
    }
}
