use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub x: u16,
    pub y: u16,
}

impl Position {
    pub fn new(x: u16, y: u16) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    North,
    East,
    South,
    West,
}

impl Direction {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::North),
            1 => Some(Self::East),
            2 => Some(Self::South),
            3 => Some(Self::West),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::North => 0,
            Self::East => 1,
            Self::South => 2,
            Self::West => 3,
        }
    }

    /// One step in this direction, saturating at the origin edge. The far
    /// edge is clamped by the map.
    pub fn step_from(self, position: Position) -> Position {
        match self {
            Self::North => Position::new(position.x, position.y.saturating_sub(1)),
            Self::East => Position::new(position.x.saturating_add(1), position.y),
            Self::South => Position::new(position.x, position.y.saturating_add(1)),
            Self::West => Position::new(position.x.saturating_sub(1), position.y),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_roundtrip() {
        for value in 0..4u8 {
            let direction = Direction::from_u8(value).expect("direction");
            assert_eq!(direction.to_u8(), value);
        }
        assert_eq!(Direction::from_u8(4), None);
    }

    #[test]
    fn steps_saturate_at_origin() {
        let origin = Position::new(0, 0);
        assert_eq!(Direction::North.step_from(origin), origin);
        assert_eq!(Direction::West.step_from(origin), origin);
        assert_eq!(Direction::South.step_from(origin), Position::new(0, 1));
        assert_eq!(Direction::East.step_from(origin), Position::new(1, 0));
    }
}
