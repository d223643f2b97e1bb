use agentmarket::{
    config::{create_default_config_file, AppConfig},
    database::Database,
    server, settlement,
    wallet::LocalWallet,
};
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(name = "marketplace")]
#[command(about = "Agent marketplace protocol server")]
struct Args {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[arg(short, long)]
    database_url: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Write a default configuration file and exit.
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.init_config {
        create_default_config_file(&args.config)?;
        println!("Wrote default configuration to {}", args.config);
        return Ok(());
    }

    let mut config = AppConfig::load_with_env_overrides(&args.config)?;
    if let Some(url) = args.database_url {
        config.database.url = url;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.validate()?;
    config.logging.init_tracing();

    let db = Database::connect(&config.database).await?;

    let wallet = Arc::new(LocalWallet::from_config(&config.wallet)?);
    let agents = db.list_agents().await?;
    for agent in &agents {
        if let Err(e) = wallet.register_key(agent.id, &agent.public_key) {
            tracing::warn!(agent_id = %agent.id, error = %e, "Skipping agent with an unusable public key");
        }
    }
    tracing::info!(agents = agents.len(), "Loaded agent signing keys");

    let (updates_tx, updates_rx) = settlement::callback_channel();
    let provider = settlement::build_provider(&config.settlement, updates_tx)?;
    tracing::info!(provider = ?config.settlement.provider, "Settlement provider ready");

    let state = server::build_state(db, wallet, provider, &config);
    Arc::clone(&state.orchestrator).spawn_update_listener(updates_rx);
    Arc::clone(&state.orchestrator).spawn_reconciler(config.settlement.reconcile_interval());

    let address = config.get_server_address();
    let listener = TcpListener::bind(&address).await?;
    tracing::info!(%address, "Marketplace listening");

    axum::serve(listener, server::router(state)).await?;

    Ok(())
}
