//! Per-connection protocol state machine: one inbound frame in, zero or one
//! response frame out, plus background stream tasks tracked for
//! cancellation on close.

use futures::{Future, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::{
	collections::{HashMap, HashSet},
	sync::Arc,
};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, warn, Instrument};
use uuid::Uuid;

use super::{
	binding::{self, Params},
	envelope::{Request, RequestId, Response, RpcError},
	registry::{Delegate, Endpoint, Handler, Outcome, Resolved},
	stream::RpcStream,
};

/// WebSocket close code for callers lacking the required identity.
/// 4000-4999 is the application-reserved range.
pub const CLOSE_UNAUTHENTICATED: u16 = 4401;

const JSONRPC_PREFIX: &str = "{\"jsonrpc\"";

/// Outbound frame, transport-agnostic. The transport adapter maps these to
/// its own message type.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
	Text(String),
	Close { code: u16, reason: String },
}

pub type FrameSender = mpsc::UnboundedSender<Frame>;

/// What the read loop should do after a frame was handled.
#[derive(Debug, PartialEq)]
pub enum Disposition {
	Continue,
	Close,
}

/// State owned by one connection: identity, outbound channel and the
/// bookkeeping of in-flight requests. Never shared across connections.
pub struct Session {
	pub id: Uuid,
	pub endpoint: Arc<Endpoint>,
	pub user: Option<Value>,
	sender: FrameSender,
	cancel: CancellationToken,
	in_flight: Mutex<HashSet<RequestId>>,
}

impl Session {
	pub fn send_frame(&self, frame: Frame) {
		if self.sender.send(frame).is_err() {
			warn!(session_id = %self.id, "Message sent after close");
		}
	}

	pub fn send_json<T: Serialize>(&self, message: &T) {
		match serde_json::to_string(message) {
			Ok(text) => self.send_frame(Frame::Text(text)),
			Err(error) => error!(session_id = %self.id, %error, "Cannot serialize message"),
		}
	}

	fn close(&self, code: u16, reason: &str) {
		self.send_frame(Frame::Close {
			code,
			reason: reason.to_string(),
		});
	}

	pub async fn in_flight_count(&self) -> usize {
		self.in_flight.lock().await.len()
	}
}

/// Connected sessions grouped by endpoint path. Cloning shares the
/// underlying map; dispatchers built over the same instance register on
/// open and deregister on close, so server-side code can push frames to
/// every connection on a path.
#[derive(Clone, Default)]
pub struct Sessions {
	inner: Arc<RwLock<HashMap<String, HashMap<Uuid, Arc<Session>>>>>,
}

impl Sessions {
	async fn insert(&self, session: Arc<Session>) {
		self.inner
			.write()
			.await
			.entry(session.endpoint.path.clone())
			.or_default()
			.insert(session.id, session);
	}

	async fn remove(&self, session: &Session) {
		let mut inner = self.inner.write().await;
		if let Some(sessions) = inner.get_mut(&session.endpoint.path) {
			sessions.remove(&session.id);
			if sessions.is_empty() {
				inner.remove(&session.endpoint.path);
			}
		}
	}

	pub async fn count(&self, path: &str) -> usize {
		self.inner
			.read()
			.await
			.get(path)
			.map_or(0, HashMap::len)
	}

	/// Sends `message` to every connection on `path`, narrowed to the
	/// listed session ids when given. Returns the number of recipients.
	pub async fn broadcast<T: Serialize + Sync>(
		&self,
		path: &str,
		message: &T,
		session_ids: Option<&[Uuid]>,
	) -> usize {
		let inner = self.inner.read().await;
		let Some(sessions) = inner.get(path) else {
			return 0;
		};
		let mut sent = 0;
		for session in sessions.values() {
			if let Some(ids) = session_ids {
				if !ids.contains(&session.id) {
					continue;
				}
			}
			session.send_json(message);
			sent += 1;
		}
		sent
	}
}

enum Invocation {
	Callable(Arc<dyn super::registry::Callable>, Vec<Value>),
	Delegate(Arc<dyn Delegate>, String, Params),
}

pub struct Dispatcher {
	session: Arc<Session>,
	sessions: Sessions,
	tasks: TaskTracker,
}

impl Dispatcher {
	pub fn new(endpoint: Arc<Endpoint>, user: Option<Value>, sender: FrameSender) -> Self {
		let session = Arc::new(Session {
			id: Uuid::new_v4(),
			endpoint,
			user,
			sender,
			cancel: CancellationToken::new(),
			in_flight: Mutex::new(HashSet::new()),
		});
		Dispatcher {
			session,
			sessions: Sessions::default(),
			tasks: TaskTracker::new(),
		}
	}

	/// Registers this connection in a shared session map, making it
	/// reachable through [`Sessions::broadcast`] while open.
	pub fn with_sessions(mut self, sessions: Sessions) -> Self {
		self.sessions = sessions;
		self
	}

	pub fn session(&self) -> Arc<Session> {
		self.session.clone()
	}

	/// Registers the session and runs the endpoint open hook. An endpoint
	/// that requires authentication closes unauthenticated connections
	/// outright, without registering them.
	pub async fn open(&self) -> Disposition {
		if self.session.endpoint.requires_auth && self.session.user.is_none() {
			return self.close_unauthenticated();
		}
		self.sessions.insert(self.session.clone()).await;
		if let Some(hook) = self.session.endpoint.on_open.as_ref() {
			hook.call(&self.session).await;
		}
		Disposition::Continue
	}

	/// Deregisters the session, cancels tracked background tasks, waits
	/// them out and runs the close hook. Cancelled streams emit no further
	/// frames.
	pub async fn close(&self) {
		let pending = self.session.in_flight_count().await;
		debug!(session_id = %self.session.id, pending, "Closing session");
		self.sessions.remove(&self.session).await;
		self.session.cancel.cancel();
		self.tasks.close();
		self.tasks.wait().await;
		if let Some(hook) = self.session.endpoint.on_close.as_ref() {
			hook.call(&self.session).await;
		}
	}

	/// Handles one inbound frame. Parsing, validation and method resolution
	/// are synchronous; execution is spawned so requests on one connection
	/// may complete and respond out of order, matched by id only.
	pub async fn handle_frame(&self, frame: String) -> Disposition {
		if let Some(hook) = self.session.endpoint.on_message.as_ref() {
			if !frame.trim_start().starts_with(JSONRPC_PREFIX) {
				let hook = hook.clone();
				let session = self.session.clone();
				self.spawn(async move { hook.call(&session, &frame).await });
				return Disposition::Continue;
			}
		}

		let request = match Request::parse(&frame) {
			Ok(request) => request,
			Err(error) => {
				// parse failures precede any id, so the synthetic id is null
				self.session.send_json(&Response::error(None, &error));
				return Disposition::Continue;
			},
		};
		let id = request.id.clone();

		let method = match request.method_name() {
			Ok(method) => method.to_string(),
			Err(error) => return self.respond_error(id, error),
		};
		let params = match Params::parse(request.params) {
			Ok(params) => params,
			Err(error) => return self.respond_error(id, error),
		};

		let invocation = match self.session.endpoint.resolve(&method) {
			Err(error) => return self.respond_error(id, error),
			Ok(Resolved::Descriptor(descriptor)) => {
				if descriptor.requires_auth && self.session.user.is_none() {
					return self.close_unauthenticated();
				}
				match &descriptor.handler {
					Handler::Callable(callable) => {
						let args = match binding::bind(
							params,
							&descriptor.param_names,
							descriptor.inject_user,
							self.session.user.as_ref(),
						) {
							Ok(args) => args,
							Err(error) => return self.respond_error(id, error),
						};
						Invocation::Callable(callable.clone(), args)
					},
					Handler::Delegate(delegate) => {
						Invocation::Delegate(delegate.clone(), method, params)
					},
				}
			},
			Ok(Resolved::Fallback(delegate)) => {
				Invocation::Delegate(delegate.clone(), method, params)
			},
		};

		if let Some(id) = id.as_ref() {
			self.session.in_flight.lock().await.insert(id.clone());
		}

		let session = self.session.clone();
		self.spawn(invoke(session, invocation, id));
		Disposition::Continue
	}

	fn respond_error(&self, id: Option<RequestId>, error: RpcError) -> Disposition {
		match id {
			Some(id) => self.session.send_json(&Response::error(Some(id), &error)),
			// notifications expect silence even on failure
			None => debug!(session_id = %self.session.id, %error, "Notification failed"),
		}
		Disposition::Continue
	}

	fn close_unauthenticated(&self) -> Disposition {
		warn!(session_id = %self.session.id, "Closing unauthenticated connection");
		self.session
			.close(CLOSE_UNAUTHENTICATED, "not authenticated");
		Disposition::Close
	}

	fn spawn(&self, future: impl Future<Output = ()> + Send + 'static) {
		let cancel = self.session.cancel.clone();
		self.tasks.spawn(
			async move {
				tokio::select! {
					_ = cancel.cancelled() => (),
					_ = future => (),
				}
			}
			.in_current_span(),
		);
	}
}

async fn invoke(session: Arc<Session>, invocation: Invocation, id: Option<RequestId>) {
	let result = match invocation {
		Invocation::Callable(callable, args) => callable.call(args, session.user.as_ref()).await,
		Invocation::Delegate(delegate, method, params) => {
			delegate.call(&method, params, session.user.as_ref()).await
		},
	};

	// The request is settled once a result exists, before its frame is sent.
	if let Some(id) = id.as_ref() {
		session.in_flight.lock().await.remove(id);
	}

	match result {
		Ok(Outcome::Value(value)) => {
			if let Some(id) = id.as_ref() {
				session.send_json(&Response::result(id.clone(), value));
			}
		},
		Ok(Outcome::Stream(stream)) => match id.as_ref() {
			Some(id) => {
				session.send_json(&Response::result(id.clone(), stream.to_result()));
				stream_results(&session, stream).await;
			},
			// without an id the caller never saw the stream id, so the
			// frames would be uncorrelatable
			None => {
				debug!(session_id = %session.id, stream_id = %stream.id, "Stream dropped for notification")
			},
		},
		Err(RpcError::Auth) => {
			warn!(session_id = %session.id, "Closing unauthenticated connection");
			session.close(CLOSE_UNAUTHENTICATED, "not authenticated");
		},
		Err(error) => {
			if let RpcError::Internal(report) = &error {
				error!(session_id = %session.id, "Dispatch failed: {report:#}");
			}
			match id.as_ref() {
				Some(id) => session.send_json(&Response::error(Some(id.clone()), &error)),
				None => debug!(session_id = %session.id, %error, "Notification failed"),
			}
		},
	}
}

/// Emits stream item frames in order, then the terminal count frame. The
/// surrounding task is tied to the session cancellation token, so a closed
/// connection stops the stream before its next frame.
async fn stream_results(session: &Session, stream: RpcStream) {
	let RpcStream { id, mut items } = stream;
	let mut count = 0;
	while let Some(item) = items.next().await {
		session.send_json(&RpcStream::item_frame(id, item));
		count += 1;
	}
	session.send_json(&RpcStream::done_frame(id, count));
}
