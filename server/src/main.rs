use clap::Parser;
use color_eyre::{
	eyre::{eyre, WrapErr},
	Result,
};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use gale_core::{
	db::signature::SignatureCache,
	utils::{default_subscriber, install_panic_hooks, json_subscriber, spawn_in_span},
	Endpoint, NoAuth, PgBackend, PostgresRpc, Registry, Server, Sessions,
};
use std::{fs, str::FromStr, sync::Arc, time::Duration};
use tokio_postgres::NoTls;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{cli::CliOpts, config::RuntimeConfig};

mod cli;
mod config;

pub fn load_runtime_config(opts: &CliOpts) -> Result<RuntimeConfig> {
	let mut cfg = if let Some(config_path) = &opts.config {
		fs::metadata(config_path).map_err(|_| eyre!("Provided config file doesn't exist."))?;
		confy::load_path(config_path)
			.wrap_err(format!("Failed to load configuration from {config_path}"))?
	} else {
		RuntimeConfig::default()
	};

	cfg.log_format_json = opts.logs_json || cfg.log_format_json;
	cfg.log_level = opts.verbosity.unwrap_or(cfg.log_level);

	// Flags override the config parameters
	if let Some(database_url) = &opts.database_url {
		cfg.database_url = database_url.clone();
	}
	if let Some(schema) = &opts.schema {
		cfg.schema = schema.clone();
	}
	if let Some(port) = opts.ws_server_port {
		cfg.api.ws_server_port = port;
	}

	Ok(cfg)
}

fn connection_pool(cfg: &RuntimeConfig) -> Result<Pool> {
	let pg_config = tokio_postgres::Config::from_str(&cfg.database_url)
		.wrap_err("Failed to parse database URL")?;
	let manager = Manager::from_config(
		pg_config,
		NoTls,
		ManagerConfig {
			recycling_method: RecyclingMethod::Fast,
		},
	);
	Pool::builder(manager)
		.max_size(cfg.pool_size)
		.build()
		.wrap_err("Failed to create connection pool")
}

fn registry(cfg: &RuntimeConfig, pool: Pool) -> Registry {
	let backend = Arc::new(PgBackend::new(pool));
	let cache = match cfg.signature_cache_ttl_seconds {
		Some(seconds) => SignatureCache::with_ttl(Duration::from_secs(seconds)),
		None => SignatureCache::new(),
	};

	let rpc = PostgresRpc::new(backend.clone(), cache.clone(), &cfg.schema);
	let auth_rpc = PostgresRpc::new(backend, cache, &cfg.schema).authenticated();

	let mut registry = Registry::default();
	registry.register(Endpoint::new("rpc").delegate(Arc::new(rpc)));
	registry.register(
		Endpoint::new("rpc-auth")
			.with_auth()
			.delegate(Arc::new(auth_rpc)),
	);
	registry
}

async fn run(cfg: RuntimeConfig, shutdown: CancellationToken) -> Result<()> {
	let version = clap::crate_version!();
	info!("Running Gale server version: {version}.");
	info!("Using config: {cfg:?}");

	let pool = connection_pool(&cfg)?;
	let server = Server {
		registry: Arc::new(registry(&cfg, pool)),
		auth: Arc::new(NoAuth),
		sessions: Sessions::default(),
		shutdown: shutdown.clone(),
	};
	spawn_in_span(server.bind(cfg.api.clone())?);

	tokio::select! {
		_ = shutdown.cancelled() => (),
		result = tokio::signal::ctrl_c() => {
			result.wrap_err("Failed to listen for shutdown signal")?;
			info!("Shutting down");
			shutdown.cancel();
		},
	}

	Ok(())
}

#[tokio::main]
pub async fn main() -> Result<()> {
	let shutdown = CancellationToken::new();
	let opts = CliOpts::parse();
	let cfg = load_runtime_config(&opts)?;

	if cfg.log_format_json {
		tracing::subscriber::set_global_default(json_subscriber(cfg.log_level))?;
	} else {
		tracing::subscriber::set_global_default(default_subscriber(cfg.log_level))?;
	};

	// install custom panic hooks
	install_panic_hooks(shutdown.clone())?;

	run(cfg, shutdown).await
}
