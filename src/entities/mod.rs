pub mod monster;
pub mod npc;
pub mod player;
pub mod status;
