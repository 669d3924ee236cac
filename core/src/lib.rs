pub mod api;
pub mod db;
pub mod rpc;
pub mod utils;

pub use api::server::{Authenticate, NoAuth, Server};
pub use db::{
	backend::{Backend, PgBackend},
	proxy::PostgresRpc,
	signature::SignatureCache,
};
pub use rpc::{
	dispatcher::{Dispatcher, Disposition, Frame, Session, Sessions},
	envelope::RpcError,
	registry::{Endpoint, Registry},
};
