use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::entities::status::{decay_statuses, TimedStatus};
use crate::world::map::MapId;
use crate::world::position::{Direction, Position};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub map: MapId,
    pub position: Position,
}

/// The mutable status block. Buff decay and threat recomputation happen
/// together under this one lock; threat must never be observed halfway
/// through a recompute.
#[derive(Debug, Clone)]
pub struct StatusBlock {
    pub hp: u32,
    pub max_hp: u32,
    pub level: u16,
    pub buffs: Vec<TimedStatus>,
    pub threat: u32,
}

impl StatusBlock {
    fn recompute_threat(&mut self) {
        let base = self.level as u32 + self.hp / 10;
        let bonus: u32 = self.buffs.iter().map(|buff| buff.threat_bonus).sum();
        self.threat = base + bonus;
    }
}

/// A player's simulated avatar. Placement is guarded for composite reads;
/// direction is a lone display-affecting byte and tolerates the narrow
/// race of an unsynchronized store.
pub struct Player {
    pub id: PlayerId,
    pub name: String,
    placement: Mutex<Placement>,
    direction: AtomicU8,
    warping: AtomicBool,
    status: Mutex<StatusBlock>,
}

impl Player {
    pub fn new(id: PlayerId, name: impl Into<String>, map: MapId, position: Position) -> Self {
        Self {
            id,
            name: name.into(),
            placement: Mutex::new(Placement { map, position }),
            direction: AtomicU8::new(Direction::South.to_u8()),
            warping: AtomicBool::new(false),
            status: Mutex::new(StatusBlock {
                hp: 100,
                max_hp: 100,
                level: 1,
                buffs: Vec::new(),
                threat: 0,
            }),
        }
    }

    pub fn placement(&self) -> Placement {
        *self.placement.lock().expect("placement lock")
    }

    pub fn set_placement(&self, map: MapId, position: Position) {
        *self.placement.lock().expect("placement lock") = Placement { map, position };
    }

    pub fn set_position(&self, position: Position) {
        self.placement.lock().expect("placement lock").position = position;
    }

    pub fn direction(&self) -> Direction {
        Direction::from_u8(self.direction.load(Ordering::Relaxed)).unwrap_or(Direction::South)
    }

    pub fn set_direction(&self, direction: Direction) {
        self.direction.store(direction.to_u8(), Ordering::Relaxed);
    }

    pub fn begin_warp(&self) {
        self.warping.store(true, Ordering::SeqCst);
    }

    pub fn end_warp(&self) {
        self.warping.store(false, Ordering::SeqCst);
    }

    pub fn is_warping(&self) -> bool {
        self.warping.load(Ordering::SeqCst)
    }

    pub fn apply_buff(&self, buff: TimedStatus) {
        let mut status = self.status.lock().expect("status lock");
        status.buffs.push(buff);
        status.recompute_threat();
    }

    /// Decays buffs and recomputes threat in one atomic step.
    pub fn update_status(&self, elapsed: Duration) {
        let mut status = self.status.lock().expect("status lock");
        decay_statuses(&mut status.buffs, elapsed);
        status.recompute_threat();
    }

    pub fn status(&self) -> StatusBlock {
        self.status.lock().expect("status lock").clone()
    }

    pub fn set_vitals(&self, hp: u32, max_hp: u32, level: u16) {
        let mut status = self.status.lock().expect("status lock");
        status.hp = hp.min(max_hp);
        status.max_hp = max_hp;
        status.level = level;
        status.recompute_threat();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buff_decay_and_threat_move_together() {
        let player = Player::new(PlayerId(1), "Aine", MapId(1), Position::new(4, 4));
        player.set_vitals(100, 100, 5);
        let base_threat = player.status().threat;

        player.apply_buff(TimedStatus::new("battle cry", Duration::from_millis(100), 40));
        assert_eq!(player.status().threat, base_threat + 40);

        player.update_status(Duration::from_millis(200));
        let status = player.status();
        assert!(status.buffs.is_empty());
        assert_eq!(status.threat, base_threat);
    }

    #[test]
    fn warp_flag_roundtrip() {
        let player = Player::new(PlayerId(2), "Bran", MapId(1), Position::new(0, 0));
        assert!(!player.is_warping());
        player.begin_warp();
        assert!(player.is_warping());
        player.end_warp();
        assert!(!player.is_warping());
    }
}
