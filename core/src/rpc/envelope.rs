//! JSON-RPC 2.0 envelopes and the wire error taxonomy.

use color_eyre::Report;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const JSONRPC_VERSION: &str = "2.0";

/// Request identifier, a string or a number. Requests without an identifier
/// are notifications and are never answered.
#[derive(Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Debug)]
#[serde(untagged)]
pub enum RequestId {
	Number(i64),
	String(String),
}

#[derive(Deserialize, Debug)]
pub struct Request {
	pub jsonrpc: String,
	#[serde(default)]
	pub id: Option<RequestId>,
	#[serde(default)]
	pub method: Option<Value>,
	#[serde(default)]
	pub params: Option<Value>,
}

impl Request {
	/// Parses a raw frame. JSON syntax failures are [`RpcError::Parse`],
	/// shape failures are [`RpcError::InvalidRequest`].
	pub fn parse(frame: &str) -> Result<Self, RpcError> {
		let value: Value = serde_json::from_str(frame).map_err(|_| RpcError::Parse)?;
		serde_json::from_value(value).map_err(|error| RpcError::InvalidRequest(error.to_string()))
	}

	/// Method name, present and non-empty, or the request is malformed.
	pub fn method_name(&self) -> Result<&str, RpcError> {
		match self.method.as_ref().and_then(Value::as_str) {
			Some(method) if !method.is_empty() => Ok(method),
			_ => Err(RpcError::InvalidRequest(
				"Method must be a non-empty string".to_string(),
			)),
		}
	}
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorObject {
	pub code: i32,
	pub message: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Response {
	pub jsonrpc: String,
	pub id: Value,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub result: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<ErrorObject>,
}

impl Response {
	pub fn result(id: RequestId, result: Value) -> Self {
		Response {
			jsonrpc: JSONRPC_VERSION.to_string(),
			id: id_value(Some(id)),
			result: Some(result),
			error: None,
		}
	}

	pub fn error(id: Option<RequestId>, error: &RpcError) -> Self {
		Response {
			jsonrpc: JSONRPC_VERSION.to_string(),
			id: id_value(id),
			result: None,
			error: Some(ErrorObject {
				code: error.code(),
				message: error.to_string(),
			}),
		}
	}
}

/// Server-initiated frame carrying no identifier, used for streamed results.
#[derive(Serialize, Deserialize, Debug)]
pub struct Notification {
	pub jsonrpc: String,
	pub method: String,
	pub params: Value,
}

impl Notification {
	pub fn new(method: &str, params: Value) -> Self {
		Notification {
			jsonrpc: JSONRPC_VERSION.to_string(),
			method: method.to_string(),
			params,
		}
	}
}

fn id_value(id: Option<RequestId>) -> Value {
	match id {
		Some(id) => serde_json::to_value(id).expect("Request id is serializable"),
		None => Value::Null,
	}
}

#[derive(Debug, Error)]
pub enum RpcError {
	#[error("Parse error")]
	Parse,
	#[error("Invalid request: {0}")]
	InvalidRequest(String),
	#[error("Method not found: {0}")]
	MethodNotFound(String),
	#[error("Invalid params: {0}")]
	InvalidParams(String),
	/// The invoked callable or backend call failed. The message is the
	/// diagnostic supplied by the target, safe to show to the caller.
	#[error("{0}")]
	Execution(String),
	/// Unclassified failure. The wire message stays generic, the cause is
	/// available for local diagnostics only.
	#[error("Internal error")]
	Internal(Report),
	/// Caller lacks the required identity. Terminates the connection
	/// instead of producing an error frame.
	#[error("Not authenticated")]
	Auth,
}

impl RpcError {
	pub fn code(&self) -> i32 {
		match self {
			RpcError::Parse => -32700,
			RpcError::InvalidRequest(_) | RpcError::Auth => -32600,
			RpcError::MethodNotFound(_) => -32601,
			RpcError::InvalidParams(_) => -32602,
			RpcError::Execution(_) | RpcError::Internal(_) => -32603,
		}
	}
}
