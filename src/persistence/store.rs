//! File-backed avatar persistence. The core calls `load`, `save`, and
//! `quick_save` at lifecycle points (login, autosave, logout); the storage
//! format behind them is not part of the engine contract.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::entities::player::{Player, PlayerId};
use crate::telemetry::logging;
use crate::world::map::MapId;
use crate::world::position::{Direction, Position};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub name: String,
    pub map: u16,
    pub x: u16,
    pub y: u16,
    pub direction: u8,
    pub hp: u32,
    pub max_hp: u32,
    pub level: u16,
}

impl PlayerRecord {
    pub fn starter(name: &str) -> Self {
        Self {
            name: name.to_string(),
            map: 1,
            x: 16,
            y: 16,
            direction: Direction::South.to_u8(),
            hp: 100,
            max_hp: 100,
            level: 1,
        }
    }

    pub fn from_player(player: &Player) -> Self {
        let placement = player.placement();
        let status = player.status();
        Self {
            name: player.name.clone(),
            map: placement.map.0,
            x: placement.position.x,
            y: placement.position.y,
            direction: player.direction().to_u8(),
            hp: status.hp,
            max_hp: status.max_hp,
            level: status.level,
        }
    }

    pub fn into_player(self, id: PlayerId) -> Player {
        let player = Player::new(
            id,
            self.name,
            MapId(self.map),
            Position::new(self.x, self.y),
        );
        if let Some(direction) = Direction::from_u8(self.direction) {
            player.set_direction(direction);
        }
        player.set_vitals(self.hp, self.max_hp, self.level);
        player
    }
}

#[derive(Debug, Clone)]
pub struct SaveStore {
    root: PathBuf,
}

impl SaveStore {
    pub fn from_root(root: &Path) -> Self {
        Self {
            root: root.join("save"),
        }
    }

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn player_path(&self, name: &str) -> PathBuf {
        self.root
            .join("players")
            .join(format!("{}.yaml", normalize_name(name)))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.player_path(name).is_file()
    }

    pub fn load(&self, name: &str) -> Result<Option<PlayerRecord>, String> {
        let path = self.player_path(name);
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(format!(
                    "player save read failed for {}: {}",
                    path.display(),
                    err
                ))
            }
        };
        let record: PlayerRecord = serde_yaml::from_str(&data).map_err(|err| {
            format!("player save parse failed for {}: {}", path.display(), err)
        })?;
        Ok(Some(record))
    }

    /// Writes through a temp file then renames, so a crash mid-save never
    /// truncates the previous save.
    pub fn save(&self, record: &PlayerRecord) -> Result<(), String> {
        let path = self.player_path(&record.name);
        let dir = path
            .parent()
            .ok_or_else(|| "player save path has no parent".to_string())?;
        fs::create_dir_all(dir)
            .map_err(|err| format!("save directory create failed: {}", err))?;
        let data = serde_yaml::to_string(record)
            .map_err(|err| format!("player save serialize failed: {}", err))?;
        let tmp_path = path.with_extension("yaml.tmp");
        fs::write(&tmp_path, data)
            .map_err(|err| format!("player save write failed: {}", err))?;
        fs::rename(&tmp_path, &path)
            .map_err(|err| format!("player save rename failed: {}", err))?;
        Ok(())
    }

    /// Fire-and-forget periodic save; failures are logged, never surfaced
    /// to the tick loop that triggered them.
    pub fn quick_save(&self, player: &Arc<Player>) {
        let store = self.clone();
        let record = PlayerRecord::from_player(player);
        std::thread::spawn(move || {
            if let Err(err) = store.save(&record) {
                logging::log_error(&format!("quick save failed for {}: {}", record.name, err));
            }
        });
    }
}

fn normalize_name(name: &str) -> String {
    name.trim()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect::<String>()
        .to_ascii_lowercase()
}
