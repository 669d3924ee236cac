use serde::{Deserialize, Serialize};

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct APIConfig {
	/// WebSocket server host name (default: 127.0.0.1).
	pub ws_server_host: String,
	/// WebSocket server port (default: 8080).
	pub ws_server_port: u16,
}

impl Default for APIConfig {
	fn default() -> Self {
		Self {
			ws_server_host: "127.0.0.1".to_owned(),
			ws_server_port: 8080,
		}
	}
}
