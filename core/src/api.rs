//! WebSocket transport: warp server with one JSON-RPC endpoint per
//! registered path, plus a health route.

pub mod configuration;
pub mod server;
pub mod ws;
