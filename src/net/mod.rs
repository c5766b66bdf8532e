pub mod codec;
pub mod connection;
pub mod dispatch;
pub mod handlers;
pub mod packet;
pub mod registry;
pub mod reputation;
pub mod server;
pub mod session;
pub mod ticker;
pub mod trace;
