//! Conversion of request `params` into the positional calling convention of
//! the target callable.

use serde_json::{Map, Value};

use super::envelope::RpcError;

/// Validated `params` member of a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Params {
	None,
	Array(Vec<Value>),
	Object(Map<String, Value>),
}

impl Params {
	pub fn parse(raw: Option<Value>) -> Result<Self, RpcError> {
		match raw {
			None | Some(Value::Null) => Ok(Params::None),
			Some(Value::Array(items)) => Ok(Params::Array(items)),
			Some(Value::Object(map)) => Ok(Params::Object(map)),
			Some(_) => Err(RpcError::InvalidParams(
				"Params must be an array or an object".to_string(),
			)),
		}
	}

	pub fn is_named(&self) -> bool {
		matches!(self, Params::Object(_))
	}
}

/// Binds `params` to the declared parameter names of a target.
///
/// Array params pass through positionally, excess and missing trailing
/// values are the target's concern. Object params are reordered to the
/// declared order, extra keys are ignored and missing keys bind null.
///
/// When `inject_user` is set the first declared parameter is bound from the
/// session identity and never from `params`, so a caller supplying a
/// same-named key cannot impersonate another identity.
pub fn bind(
	params: Params,
	param_names: &[String],
	inject_user: bool,
	user: Option<&Value>,
) -> Result<Vec<Value>, RpcError> {
	let mut args = match params {
		Params::None => Vec::new(),
		Params::Array(items) => items,
		Params::Object(map) => {
			let declared = if inject_user {
				param_names.get(1..).unwrap_or(&[])
			} else {
				param_names
			};
			declared
				.iter()
				.map(|name| map.get(name).cloned().unwrap_or(Value::Null))
				.collect()
		},
	};

	if inject_user {
		args.insert(0, user.cloned().unwrap_or(Value::Null));
	}

	Ok(args)
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn names(names: &[&str]) -> Vec<String> {
		names.iter().map(ToString::to_string).collect()
	}

	#[test]
	fn positional_params_pass_through() {
		let params = Params::parse(Some(json!([2, 3]))).unwrap();
		let args = bind(params, &names(&["a", "b"]), false, None).unwrap();
		assert_eq!(args, vec![json!(2), json!(3)]);
	}

	#[test]
	fn named_params_are_reordered() {
		let params = Params::parse(Some(json!({"y": 7, "x": 6}))).unwrap();
		let args = bind(params, &names(&["x", "y"]), false, None).unwrap();
		assert_eq!(args, vec![json!(6), json!(7)]);
	}

	#[test]
	fn extra_keys_are_ignored() {
		let params = Params::parse(Some(json!({"a": 1, "b": 2, "debug": true}))).unwrap();
		let args = bind(params, &names(&["a", "b"]), false, None).unwrap();
		assert_eq!(args, vec![json!(1), json!(2)]);
	}

	#[test]
	fn missing_keys_bind_null() {
		let params = Params::parse(Some(json!({"b": 2}))).unwrap();
		let args = bind(params, &names(&["a", "b"]), false, None).unwrap();
		assert_eq!(args, vec![Value::Null, json!(2)]);
	}

	#[test]
	fn scalar_params_are_rejected() {
		assert!(matches!(
			Params::parse(Some(json!(42))),
			Err(RpcError::InvalidParams(_))
		));
	}

	#[test]
	fn injected_user_is_bound_first() {
		let user = json!({"id": 7});
		let params = Params::parse(Some(json!([1]))).unwrap();
		let args = bind(params, &names(&["current_user", "a"]), true, Some(&user)).unwrap();
		assert_eq!(args, vec![user, json!(1)]);
	}

	#[test]
	fn injected_user_cannot_be_overridden_by_name() {
		let user = json!({"id": 7});
		let params =
			Params::parse(Some(json!({"current_user": {"id": 666}, "a": 1}))).unwrap();
		let args = bind(params, &names(&["current_user", "a"]), true, Some(&user)).unwrap();
		assert_eq!(args, vec![user, json!(1)]);
	}

	#[test]
	fn absent_user_binds_null() {
		let params = Params::parse(None).unwrap();
		let args = bind(params, &names(&["current_user"]), true, None).unwrap();
		assert_eq!(args, vec![Value::Null]);
	}
}
