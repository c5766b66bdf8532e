use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::entities::status::{decay_statuses, TimedStatus};
use crate::world::map::MapId;
use crate::world::position::Position;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CreatureId(pub u32);

/// Behavior script hook, run once per normal-loop pass. The script body is
/// game content; the engine only guarantees it runs with the measured
/// elapsed time and that its failures stay contained to this monster.
pub type BehaviorHook = fn(&Monster, Duration);

pub fn idle_behavior(_monster: &Monster, _elapsed: Duration) {}

#[derive(Debug, Clone)]
pub struct MonsterState {
    pub hp: i32,
    pub max_hp: i32,
    pub skulled: bool,
    pub statuses: Vec<TimedStatus>,
}

pub struct Monster {
    pub id: CreatureId,
    pub kind: String,
    pub map: MapId,
    position: Mutex<Position>,
    state: Mutex<MonsterState>,
    behavior: BehaviorHook,
}

impl Monster {
    pub fn new(
        id: CreatureId,
        kind: impl Into<String>,
        map: MapId,
        position: Position,
        hp: i32,
        behavior: BehaviorHook,
    ) -> Self {
        Self {
            id,
            kind: kind.into(),
            map,
            position: Mutex::new(position),
            state: Mutex::new(MonsterState {
                hp,
                max_hp: hp,
                skulled: false,
                statuses: Vec::new(),
            }),
            behavior,
        }
    }

    pub fn position(&self) -> Position {
        *self.position.lock().expect("position lock")
    }

    pub fn set_position(&self, position: Position) {
        *self.position.lock().expect("position lock") = position;
    }

    pub fn hp(&self) -> i32 {
        self.state.lock().expect("state lock").hp
    }

    pub fn max_hp(&self) -> i32 {
        self.state.lock().expect("state lock").max_hp
    }

    pub fn apply_damage(&self, amount: i32) -> i32 {
        let mut state = self.state.lock().expect("state lock");
        state.hp -= amount;
        state.hp
    }

    pub fn is_dead(&self) -> bool {
        self.state.lock().expect("state lock").hp <= 0
    }

    pub fn is_skulled(&self) -> bool {
        self.state.lock().expect("state lock").skulled
    }

    /// One-shot death claim: returns true exactly once, for the caller
    /// that flips the skulled flag on a dead monster. Death side effects
    /// must only run for that caller.
    pub fn claim_skull(&self) -> bool {
        let mut state = self.state.lock().expect("state lock");
        if state.hp <= 0 && !state.skulled {
            state.skulled = true;
            true
        } else {
            false
        }
    }

    pub fn apply_status(&self, status: TimedStatus) {
        self.state.lock().expect("state lock").statuses.push(status);
    }

    pub fn decay_statuses(&self, elapsed: Duration) {
        let mut state = self.state.lock().expect("state lock");
        decay_statuses(&mut state.statuses, elapsed);
    }

    pub fn status_count(&self) -> usize {
        self.state.lock().expect("state lock").statuses.len()
    }

    pub fn run_behavior(&self, elapsed: Duration) {
        (self.behavior)(self, elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monster(hp: i32) -> Monster {
        Monster::new(
            CreatureId(1),
            "wisp",
            MapId(1),
            Position::new(3, 3),
            hp,
            idle_behavior,
        )
    }

    #[test]
    fn skull_claims_exactly_once() {
        let subject = monster(10);
        assert!(!subject.claim_skull());
        subject.apply_damage(15);
        assert!(subject.is_dead());
        assert!(subject.claim_skull());
        assert!(!subject.claim_skull());
        assert!(subject.is_skulled());
    }

    #[test]
    fn concurrent_skull_claims_yield_one_winner() {
        let subject = std::sync::Arc::new(monster(1));
        subject.apply_damage(5);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let subject = std::sync::Arc::clone(&subject);
            handles.push(std::thread::spawn(move || subject.claim_skull()));
        }
        let wins: usize = handles
            .into_iter()
            .map(|handle| handle.join().expect("join") as usize)
            .sum();
        assert_eq!(wins, 1);
    }

    #[test]
    fn statuses_decay_with_elapsed_time() {
        let subject = monster(10);
        subject.apply_status(TimedStatus::new("poison", Duration::from_millis(150), 0));
        subject.decay_statuses(Duration::from_millis(80));
        assert_eq!(subject.status_count(), 1);
        subject.decay_statuses(Duration::from_millis(80));
        assert_eq!(subject.status_count(), 0);
    }
}
