//! WebSocket server for JSON-RPC dispatch.
//!
//! # Endpoints
//!
//! * `/health` - liveness probe
//! * `/ws/{path}` - WebSocket upgrade for each registered endpoint path

use async_trait::async_trait;
use color_eyre::eyre::{Result, WrapErr};
use futures::Future;
use serde_json::Value;
use std::{convert::Infallible, net::SocketAddr, str::FromStr, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::info;
use warp::{Filter, Rejection, Reply};

use super::{configuration::APIConfig, ws};
use crate::rpc::{dispatcher::Sessions, registry::Registry};

/// Resolves the opaque caller identity before the connection is handed to
/// its dispatcher. The token is the `Authorization` header, when present.
#[async_trait]
pub trait Authenticate: Send + Sync {
	async fn authenticate(&self, token: Option<&str>) -> Option<Value>;
}

/// Admits every connection as anonymous.
pub struct NoAuth;

#[async_trait]
impl Authenticate for NoAuth {
	async fn authenticate(&self, _token: Option<&str>) -> Option<Value> {
		None
	}
}

pub struct Server {
	pub registry: Arc<Registry>,
	pub auth: Arc<dyn Authenticate>,
	pub sessions: Sessions,
	pub shutdown: CancellationToken,
}

fn health_route() -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
	warp::head()
		.or(warp::get())
		.and(warp::path("health"))
		.map(|_| warp::reply::with_status("", warp::http::StatusCode::OK))
}

fn with_registry(
	registry: Arc<Registry>,
) -> impl Filter<Extract = (Arc<Registry>,), Error = Infallible> + Clone {
	warp::any().map(move || registry.clone())
}

fn with_auth(
	auth: Arc<dyn Authenticate>,
) -> impl Filter<Extract = (Arc<dyn Authenticate>,), Error = Infallible> + Clone {
	warp::any().map(move || auth.clone())
}

pub fn ws_route(
	registry: Arc<Registry>,
	auth: Arc<dyn Authenticate>,
	sessions: Sessions,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
	warp::path!("ws" / String)
		.and(warp::ws())
		.and(warp::header::optional::<String>("authorization"))
		.and(with_registry(registry))
		.and(with_auth(auth))
		.and(warp::any().map(move || sessions.clone()))
		.and_then(handle_upgrade)
}

async fn handle_upgrade(
	path: String,
	ws: warp::ws::Ws,
	token: Option<String>,
	registry: Arc<Registry>,
	auth: Arc<dyn Authenticate>,
	sessions: Sessions,
) -> Result<impl Reply, Rejection> {
	let Some(endpoint) = registry.endpoint(&path) else {
		return Err(warp::reject::not_found());
	};
	let user = auth.authenticate(token.as_deref()).await;
	Ok(ws.on_upgrade(move |web_socket| ws::connect(web_socket, endpoint, user, sessions)))
}

impl Server {
	/// Creates a WebSocket server that needs to be spawned into a runtime
	pub fn bind(self, cfg: APIConfig) -> Result<impl Future<Output = ()>> {
		let host = cfg.ws_server_host.clone();
		let port = cfg.ws_server_port;

		let routes = health_route().or(ws_route(self.registry, self.auth, self.sessions));

		let addr = SocketAddr::from_str(format!("{host}:{port}").as_str())
			.wrap_err("Unable to parse host address from config")?;
		info!("RPC running on ws://{host}:{port}/ws");
		// warp graceful shutdown expects a signal that is [`Future<Output = ()>`]
		let shutdown_signal = self.shutdown.cancelled_owned();
		let (_, server) = warp::serve(routes).bind_with_graceful_shutdown(addr, shutdown_signal);

		Ok(server)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::rpc::{
		envelope::RpcError,
		registry::{Callable, Endpoint, Handler, MethodDescriptor, Outcome},
	};
	use serde_json::json;

	struct TokenAuth;

	#[async_trait]
	impl Authenticate for TokenAuth {
		async fn authenticate(&self, token: Option<&str>) -> Option<Value> {
			token.map(|name| json!({ "name": name }))
		}
	}

	struct Echo;

	#[async_trait]
	impl Callable for Echo {
		async fn call(&self, args: Vec<Value>, _user: Option<&Value>) -> Result<Outcome, RpcError> {
			Ok(Outcome::Value(args.into_iter().next().unwrap_or_default()))
		}
	}

	fn registry() -> Arc<Registry> {
		let mut registry = Registry::default();
		registry.register(Endpoint::new("rpc").method(
			"add",
			&["a", "b"],
			|args| async move {
				let a = args.first().and_then(Value::as_i64).unwrap_or_default();
				let b = args.get(1).and_then(Value::as_i64).unwrap_or_default();
				Ok(Outcome::Value(json!(a + b)))
			},
		));
		registry.register(Endpoint::new("rpc-auth").with_auth().register(
			MethodDescriptor::new("whoami", &["current_user"], Handler::Callable(Arc::new(Echo)))
				.with_user_injection(),
		));
		Arc::new(registry)
	}

	fn route(
	) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
		ws_route(registry(), Arc::new(TokenAuth), Sessions::default())
	}

	#[tokio::test]
	async fn health_route_responds() {
		let response = warp::test::request()
			.method("GET")
			.path("/health")
			.reply(&health_route())
			.await;
		assert_eq!(response.status(), 200);
	}

	#[tokio::test]
	async fn ws_round_trip() {
		let mut client = warp::test::ws()
			.path("/ws/rpc")
			.handshake(route())
			.await
			.expect("handshake");
		client
			.send_text(r#"{"jsonrpc":"2.0","id":1,"method":"add","params":[2,3]}"#)
			.await;
		let message = client.recv().await.unwrap();
		assert_eq!(
			message.to_str().unwrap(),
			r#"{"jsonrpc":"2.0","id":1,"result":5}"#
		);
	}

	#[tokio::test]
	async fn connected_session_receives_broadcast() {
		let sessions = Sessions::default();
		let route = ws_route(registry(), Arc::new(TokenAuth), sessions.clone());
		let mut client = warp::test::ws()
			.path("/ws/rpc")
			.handshake(route)
			.await
			.expect("handshake");
		// a round trip guarantees the session is registered
		client
			.send_text(r#"{"jsonrpc":"2.0","id":1,"method":"add","params":[1,1]}"#)
			.await;
		client.recv().await.unwrap();
		assert_eq!(sessions.count("rpc").await, 1);

		let message = crate::rpc::envelope::Notification::new("refresh", json!({"table": "orders"}));
		assert_eq!(sessions.broadcast("rpc", &message, None).await, 1);
		let received = client.recv().await.unwrap();
		assert_eq!(
			received.to_str().unwrap(),
			r#"{"jsonrpc":"2.0","method":"refresh","params":{"table":"orders"}}"#
		);
	}

	#[tokio::test]
	async fn unknown_endpoint_rejects_handshake() {
		assert!(warp::test::ws()
			.path("/ws/missing")
			.handshake(route())
			.await
			.is_err());
	}

	#[tokio::test]
	async fn unauthenticated_connection_is_closed() {
		let mut client = warp::test::ws()
			.path("/ws/rpc-auth")
			.handshake(route())
			.await
			.expect("handshake");
		client.recv_closed().await.expect("close frame");
	}

	#[tokio::test]
	async fn identity_is_injected_end_to_end() {
		let mut client = warp::test::ws()
			.path("/ws/rpc-auth")
			.header("authorization", "alice")
			.handshake(route())
			.await
			.expect("handshake");
		client
			.send_text(r#"{"jsonrpc":"2.0","id":1,"method":"whoami"}"#)
			.await;
		let message = client.recv().await.unwrap();
		assert_eq!(
			message.to_str().unwrap(),
			r#"{"jsonrpc":"2.0","id":1,"result":{"name":"alice"}}"#
		);
	}
}
