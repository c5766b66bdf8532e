//! Runegate, a multiplayer game server. One thread per connection feeds a
//! length-prefixed, encrypted packet protocol into a fixed dispatch table;
//! three tick loops at different rates drive liveness, simulation, and
//! background work over the shared world.

pub mod config;
pub mod entities;
pub mod net;
pub mod persistence;
pub mod telemetry;
pub mod world;

use std::sync::Arc;

use config::AppConfig;
use net::server::{run_game_server, GameServerConfig, ServerControl, ServerExit};
use telemetry::logging;

pub fn run(args: &[String]) -> Result<(), String> {
    let app = AppConfig::from_args(args)?;
    logging::init(&app.root)?;

    let mut config = GameServerConfig::default();
    config.bind_addr = app.bind_addr;
    config.max_sessions = app.max_sessions;
    config.autosave_interval = app.autosave_interval;
    config.root = Some(app.root);

    logging::log_game("runegate starting");
    let control = Arc::new(ServerControl::new());
    match run_game_server(config, control)? {
        ServerExit::Shutdown => {
            logging::log_game("runegate stopped");
            Ok(())
        }
        ServerExit::Fault => Err("server stopped after a tick loop fault".to_string()),
    }
}
