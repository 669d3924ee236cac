//! Per-endpoint method registry: named callables, delegating handler
//! objects and connection lifecycle hooks.

use async_trait::async_trait;
use futures::Future;
use serde_json::Value;
use std::{collections::HashMap, fmt, sync::Arc};

use super::{binding::Params, dispatcher::Session, envelope::RpcError, stream::RpcStream};

/// What an invocation produced: a single value, or a lazy sequence of
/// values to be streamed in the background.
pub enum Outcome {
	Value(Value),
	Stream(RpcStream),
}

impl From<Value> for Outcome {
	fn from(value: Value) -> Self {
		Outcome::Value(value)
	}
}

// The boxed stream has no useful representation beyond its id.
impl fmt::Debug for Outcome {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Outcome::Value(value) => f.debug_tuple("Value").field(value).finish(),
			Outcome::Stream(stream) => f.debug_tuple("Stream").field(&stream.id).finish(),
		}
	}
}

/// In-process callable, invoked with a bound positional argument list.
#[async_trait]
pub trait Callable: Send + Sync {
	async fn call(&self, args: Vec<Value>, user: Option<&Value>) -> Result<Outcome, RpcError>;
}

struct FnCallable<F>(F);

#[async_trait]
impl<F, Fut> Callable for FnCallable<F>
where
	F: Fn(Vec<Value>) -> Fut + Send + Sync,
	Fut: Future<Output = Result<Outcome, RpcError>> + Send + 'static,
{
	async fn call(&self, args: Vec<Value>, _user: Option<&Value>) -> Result<Outcome, RpcError> {
		(self.0)(args).await
	}
}

/// Handler object that dispatches by method name itself, binding its own
/// parameters. The database RPC proxy is the delegate in this crate.
#[async_trait]
pub trait Delegate: Send + Sync {
	async fn call(
		&self,
		method: &str,
		params: Params,
		user: Option<&Value>,
	) -> Result<Outcome, RpcError>;
}

#[async_trait]
pub trait LifecycleHook: Send + Sync {
	async fn call(&self, session: &Session);
}

#[async_trait]
pub trait MessageHook: Send + Sync {
	async fn call(&self, session: &Session, frame: &str);
}

pub enum Handler {
	Callable(Arc<dyn Callable>),
	Delegate(Arc<dyn Delegate>),
}

/// Registered method: declared parameter names, identity and auth policy,
/// and the handler. Immutable after registration.
pub struct MethodDescriptor {
	pub name: String,
	pub param_names: Vec<String>,
	pub inject_user: bool,
	pub requires_auth: bool,
	pub handler: Handler,
}

impl MethodDescriptor {
	pub fn new(name: &str, param_names: &[&str], handler: Handler) -> Self {
		MethodDescriptor {
			name: name.to_string(),
			param_names: param_names.iter().map(ToString::to_string).collect(),
			inject_user: false,
			requires_auth: false,
			handler,
		}
	}

	pub fn with_auth(mut self) -> Self {
		self.requires_auth = true;
		self
	}

	/// Declares the first parameter as the injected caller identity.
	pub fn with_user_injection(mut self) -> Self {
		self.inject_user = true;
		self
	}
}

pub enum Resolved<'a> {
	Descriptor(&'a MethodDescriptor),
	Fallback(&'a Arc<dyn Delegate>),
}

/// One logical connection path: its method table, optional fallback
/// delegate and lifecycle hooks.
pub struct Endpoint {
	pub path: String,
	pub requires_auth: bool,
	methods: HashMap<String, MethodDescriptor>,
	fallback: Option<Arc<dyn Delegate>>,
	pub on_open: Option<Arc<dyn LifecycleHook>>,
	pub on_close: Option<Arc<dyn LifecycleHook>>,
	pub on_message: Option<Arc<dyn MessageHook>>,
}

impl Endpoint {
	pub fn new(path: &str) -> Self {
		Endpoint {
			path: path.to_string(),
			requires_auth: false,
			methods: HashMap::new(),
			fallback: None,
			on_open: None,
			on_close: None,
			on_message: None,
		}
	}

	pub fn with_auth(mut self) -> Self {
		self.requires_auth = true;
		self
	}

	/// Registers a plain async function under a method name.
	pub fn method<F, Fut>(self, name: &str, param_names: &[&str], function: F) -> Self
	where
		F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<Outcome, RpcError>> + Send + 'static,
	{
		let handler = Handler::Callable(Arc::new(FnCallable(function)));
		self.register(MethodDescriptor::new(name, param_names, handler))
	}

	pub fn register(mut self, descriptor: MethodDescriptor) -> Self {
		self.methods.insert(descriptor.name.clone(), descriptor);
		self
	}

	/// Installs the fallback delegate consulted when the method table
	/// misses.
	pub fn delegate(mut self, delegate: Arc<dyn Delegate>) -> Self {
		self.fallback = Some(delegate);
		self
	}

	pub fn on_open(mut self, hook: Arc<dyn LifecycleHook>) -> Self {
		self.on_open = Some(hook);
		self
	}

	pub fn on_close(mut self, hook: Arc<dyn LifecycleHook>) -> Self {
		self.on_close = Some(hook);
		self
	}

	pub fn on_message(mut self, hook: Arc<dyn MessageHook>) -> Self {
		self.on_message = Some(hook);
		self
	}

	pub fn resolve(&self, method: &str) -> Result<Resolved, RpcError> {
		if let Some(descriptor) = self.methods.get(method) {
			return Ok(Resolved::Descriptor(descriptor));
		}
		if let Some(delegate) = self.fallback.as_ref() {
			return Ok(Resolved::Fallback(delegate));
		}
		Err(RpcError::MethodNotFound(method.to_string()))
	}
}

/// Maps endpoint paths to their configuration. Built at startup, read-only
/// afterwards.
#[derive(Default)]
pub struct Registry {
	endpoints: HashMap<String, Arc<Endpoint>>,
}

impl Registry {
	pub fn register(&mut self, endpoint: Endpoint) {
		self.endpoints
			.insert(endpoint.path.clone(), Arc::new(endpoint));
	}

	pub fn endpoint(&self, path: &str) -> Option<Arc<Endpoint>> {
		self.endpoints.get(path).cloned()
	}

	pub fn paths(&self) -> impl Iterator<Item = &str> {
		self.endpoints.keys().map(String::as_str)
	}
}
