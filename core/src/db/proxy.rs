//! JSON-RPC delegate that proxies method calls to PostgreSQL stored
//! functions, with optional caller-identity injection.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use super::{
	backend::{Backend, BackendError},
	signature::{SignatureCache, SignatureResolver},
};
use crate::rpc::{
	binding::Params,
	envelope::RpcError,
	registry::{Delegate, Outcome},
};

/// Fallback delegate for an endpoint: any method that misses the endpoint's
/// own table is treated as a stored function in the configured schema.
///
/// The authenticated variant prepends the session user as the first
/// positional argument of every call, so functions can enforce row-level
/// policies on a caller identity the client cannot forge.
pub struct PostgresRpc {
	backend: Arc<dyn Backend>,
	resolver: SignatureResolver,
	schema: String,
	inject_user: bool,
	require_auth: bool,
}

impl PostgresRpc {
	pub fn new(backend: Arc<dyn Backend>, cache: SignatureCache, schema: &str) -> Self {
		PostgresRpc {
			resolver: SignatureResolver::new(backend.clone(), cache, schema),
			backend,
			schema: schema.to_string(),
			inject_user: false,
			require_auth: false,
		}
	}

	/// Turns on identity injection. Calls without a session user terminate
	/// the connection unless `require_auth(false)` is set.
	pub fn authenticated(mut self) -> Self {
		self.inject_user = true;
		self.require_auth = true;
		self
	}

	/// With auth not required, an anonymous caller binds null as the
	/// injected identity instead of being disconnected.
	pub fn require_auth(mut self, required: bool) -> Self {
		self.require_auth = required;
		self
	}

	async fn bind(
		&self,
		method: &str,
		params: Params,
		user: Option<&Value>,
	) -> Result<Vec<Value>, RpcError> {
		let mut args = match params {
			Params::None => Vec::new(),
			Params::Array(items) => items,
			Params::Object(map) => {
				let declared = self.resolver.resolve(method).await.map_err(wire_error)?;
				// With an injected identity the first declared parameter
				// is never bound from the request.
				let skip = usize::from(self.inject_user);
				declared
					.iter()
					.skip(skip)
					.map(|name| {
						map.get(name).cloned().ok_or_else(|| {
							RpcError::InvalidParams(format!(
								"Missing required parameter: {name} for function {method}"
							))
						})
					})
					.collect::<Result<Vec<Value>, RpcError>>()?
			},
		};
		if self.inject_user {
			args.insert(0, user.cloned().unwrap_or(Value::Null));
		}
		Ok(args)
	}
}

#[async_trait]
impl Delegate for PostgresRpc {
	async fn call(
		&self,
		method: &str,
		params: Params,
		user: Option<&Value>,
	) -> Result<Outcome, RpcError> {
		// Private functions and malformed identifiers never reach the
		// backend.
		if method.starts_with('_') || !is_identifier(method) {
			return Err(RpcError::MethodNotFound(method.to_string()));
		}
		if self.inject_user && self.require_auth && user.is_none() {
			return Err(RpcError::Auth);
		}

		let args = self.bind(method, params, user).await?;
		debug!(schema = %self.schema, method, args = args.len(), "Proxying call");
		let value = self
			.backend
			.call(&self.schema, method, args)
			.await
			.map_err(wire_error)?;
		Ok(Outcome::Value(value))
	}
}

fn wire_error(error: BackendError) -> RpcError {
	match error {
		BackendError::NotFound(function) => RpcError::MethodNotFound(function),
		BackendError::Execution(message) => RpcError::Execution(message),
		BackendError::Unavailable(report) => RpcError::Internal(report),
	}
}

fn is_identifier(name: &str) -> bool {
	let mut chars = name.chars();
	match chars.next() {
		Some(first) if first.is_ascii_alphabetic() || first == '_' => {},
		_ => return false,
	}
	chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::db::backend::MockBackend;
	use mockall::predicate::eq;
	use serde_json::json;
	use test_case::test_case;

	fn proxy(backend: MockBackend) -> PostgresRpc {
		PostgresRpc::new(Arc::new(backend), SignatureCache::new(), "public")
	}

	fn value(outcome: Outcome) -> Value {
		match outcome {
			Outcome::Value(value) => value,
			Outcome::Stream(_) => panic!("value expected"),
		}
	}

	#[test_case("_secret" ; "underscore prefix")]
	#[test_case("bad-name" ; "dash")]
	#[test_case("1st" ; "leading digit")]
	#[test_case("drop table; --" ; "sql text")]
	#[tokio::test]
	async fn rejected_before_backend_traffic(method: &str) {
		// No expectations: any backend call would panic the mock.
		let proxy = proxy(MockBackend::new());
		let error = proxy.call(method, Params::None, None).await.unwrap_err();
		assert!(matches!(error, RpcError::MethodNotFound(_)));
	}

	#[tokio::test]
	async fn positional_params_pass_through() {
		let mut backend = MockBackend::new();
		backend
			.expect_call()
			.with(eq("public"), eq("add"), eq(vec![json!(2), json!(3)]))
			.times(1)
			.returning(|_, _, _| Ok(json!(5)));
		let proxy = proxy(backend);

		let params = Params::Array(vec![json!(2), json!(3)]);
		let outcome = proxy.call("add", params, None).await.unwrap();
		assert_eq!(value(outcome), json!(5));
	}

	#[tokio::test]
	async fn named_params_are_reordered_and_signature_cached() {
		let mut backend = MockBackend::new();
		backend
			.expect_signature()
			.with(eq("public"), eq("multiply"))
			.times(1)
			.returning(|_, _| Ok(Some(vec!["x".to_string(), "y".to_string()])));
		backend
			.expect_call()
			.with(eq("public"), eq("multiply"), eq(vec![json!(6), json!(7)]))
			.times(2)
			.returning(|_, _, _| Ok(json!(42)));
		let proxy = proxy(backend);

		for _ in 0..2 {
			let params = Params::Object(
				serde_json::from_value(json!({"y": 7, "x": 6})).unwrap(),
			);
			let outcome = proxy.call("multiply", params, None).await.unwrap();
			assert_eq!(value(outcome), json!(42));
		}
	}

	#[tokio::test]
	async fn missing_named_parameter_is_invalid_params() {
		let mut backend = MockBackend::new();
		backend
			.expect_signature()
			.returning(|_, _| Ok(Some(vec!["x".to_string(), "y".to_string()])));
		let proxy = proxy(backend);

		let params = Params::Object(serde_json::from_value(json!({"x": 6})).unwrap());
		let error = proxy.call("multiply", params, None).await.unwrap_err();
		assert!(matches!(error, RpcError::InvalidParams(message) if message.contains("y")));
	}

	#[tokio::test]
	async fn unknown_function_is_method_not_found() {
		let mut backend = MockBackend::new();
		backend.expect_signature().returning(|_, _| Ok(None));
		let proxy = proxy(backend);

		let params = Params::Object(serde_json::from_value(json!({"x": 1})).unwrap());
		let error = proxy.call("ghost", params, None).await.unwrap_err();
		assert!(matches!(error, RpcError::MethodNotFound(name) if name == "ghost"));
	}

	#[tokio::test]
	async fn backend_diagnostic_is_surfaced() {
		let mut backend = MockBackend::new();
		backend.expect_call().returning(|_, _, _| {
			Err(BackendError::Execution(
				"division by zero".to_string(),
			))
		});
		let proxy = proxy(backend);

		let error = proxy
			.call("divide", Params::Array(vec![json!(1), json!(0)]), None)
			.await
			.unwrap_err();
		assert!(matches!(error, RpcError::Execution(message) if message == "division by zero"));
	}

	#[tokio::test]
	async fn authenticated_proxy_requires_a_user() {
		let proxy = proxy(MockBackend::new()).authenticated();
		let error = proxy.call("whoami", Params::None, None).await.unwrap_err();
		assert!(matches!(error, RpcError::Auth));
	}

	#[tokio::test]
	async fn user_is_prepended_to_positional_params() {
		let user = json!({"id": 7});
		let mut backend = MockBackend::new();
		backend
			.expect_call()
			.with(
				eq("public"),
				eq("get_orders"),
				eq(vec![json!({"id": 7}), json!(2024)]),
			)
			.times(1)
			.returning(|_, _, _| Ok(json!([])));
		let proxy = proxy(backend).authenticated();

		proxy
			.call("get_orders", Params::Array(vec![json!(2024)]), Some(&user))
			.await
			.unwrap();
	}

	#[tokio::test]
	async fn named_params_cannot_override_the_injected_user() {
		let user = json!({"id": 7});
		let mut backend = MockBackend::new();
		backend.expect_signature().returning(|_, _| {
			Ok(Some(vec!["current_user".to_string(), "year".to_string()]))
		});
		backend
			.expect_call()
			.with(
				eq("public"),
				eq("get_orders"),
				eq(vec![json!({"id": 7}), json!(2024)]),
			)
			.times(1)
			.returning(|_, _, _| Ok(json!([])));
		let proxy = proxy(backend).authenticated();

		let params = Params::Object(
			serde_json::from_value(json!({"current_user": {"id": 666}, "year": 2024})).unwrap(),
		);
		proxy.call("get_orders", params, Some(&user)).await.unwrap();
	}

	#[tokio::test]
	async fn optional_auth_binds_null_user() {
		let mut backend = MockBackend::new();
		backend
			.expect_call()
			.with(eq("public"), eq("visit"), eq(vec![Value::Null]))
			.times(1)
			.returning(|_, _, _| Ok(Value::Null));
		let proxy = proxy(backend).authenticated().require_auth(false);

		proxy.call("visit", Params::None, None).await.unwrap();
	}
}
