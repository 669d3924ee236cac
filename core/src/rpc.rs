//! JSON-RPC 2.0 protocol state machine, method registry and parameter binding.

pub mod binding;
pub mod dispatcher;
pub mod envelope;
pub mod registry;
pub mod stream;
