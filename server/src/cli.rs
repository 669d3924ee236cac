use clap::{command, Parser};
use tracing::Level;

#[derive(Parser)]
#[command(version)]
pub struct CliOpts {
	/// Path to the yaml configuration file
	#[arg(short, long, value_name = "FILE")]
	pub config: Option<String>,
	/// PostgreSQL connection string, overrides parameter from config
	#[arg(short, long)]
	pub database_url: Option<String>,
	/// Schema searched for stored functions
	#[arg(short, long)]
	pub schema: Option<String>,
	/// WebSocket server port
	#[arg(long)]
	pub ws_server_port: Option<u16>,
	/// Log level
	#[arg(long)]
	pub verbosity: Option<Level>,
	/// Set logs format to JSON
	#[arg(long)]
	pub logs_json: bool,
}
