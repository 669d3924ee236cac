//! PostgreSQL stored-function backend: signature discovery, the pooled
//! execution backend and the JSON-RPC proxy delegate built on top of them.

pub mod backend;
pub mod proxy;
pub mod signature;
