use gale_core::api::configuration::APIConfig;
use serde::{Deserialize, Serialize};
use tracing::Level;

pub mod tracing_level_format {
	use serde::{self, Deserialize, Deserializer, Serializer};
	use std::str::FromStr;
	use tracing::Level;

	pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&level.to_string())
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
	where
		D: Deserializer<'de>,
	{
		let value = String::deserialize(deserializer)?;
		Level::from_str(&value).map_err(serde::de::Error::custom)
	}
}

/// Representation of a configuration used by this project.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RuntimeConfig {
	/// Name of the project running the server. (default: "gale")
	pub project_name: String,
	#[serde(flatten)]
	pub api: APIConfig,
	/// PostgreSQL connection string (default: "postgres://postgres@localhost/postgres").
	pub database_url: String,
	/// Schema searched for stored functions (default: "public").
	pub schema: String,
	/// Maximum number of pooled database connections (default: 16).
	pub pool_size: usize,
	/// Function signature cache expiry in seconds. Signatures are cached
	/// forever when unset (default: None).
	pub signature_cache_ttl_seconds: Option<u64>,
	/// Log level, default is `INFO`. See `<https://docs.rs/log/0.4.14/log/enum.LevelFilter.html>` for possible log level values. (default: `INFO`).
	#[serde(with = "tracing_level_format")]
	pub log_level: Level,
	/// If set to true, logs are displayed in JSON format, which is used for structured logging. Otherwise, plain text format is used (default: false).
	pub log_format_json: bool,
}

impl Default for RuntimeConfig {
	fn default() -> Self {
		RuntimeConfig {
			project_name: "gale".to_string(),
			api: Default::default(),
			database_url: "postgres://postgres@localhost/postgres".to_string(),
			schema: "public".to_string(),
			pool_size: 16,
			signature_cache_ttl_seconds: None,
			log_level: Level::INFO,
			log_format_json: false,
		}
	}
}
