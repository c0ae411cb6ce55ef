//! inkpress — blog platform core: token auth, CSRF handshake, post storage.

mod auth;
mod blog;
mod client;
mod config;
mod error;
mod gateway;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "inkpress", version, about = "Blog platform auth/session core")]
struct Cli {
    /// Path to a TOML config file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database path override.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP gateway.
    Serve {
        /// Bind host override.
        #[arg(long)]
        host: Option<String>,
        /// Bind port override.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Sign in against a running gateway and print the identity.
    /// Exercises the full session bootstrap: CSRF handshake, login,
    /// bearer-authenticated fetch, logout.
    Whoami {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        /// Gateway base URL override.
        #[arg(long)]
        base_url: Option<String>,
    },
    /// Create an account from the terminal, bypassing the HTTP surface.
    Register {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        /// standard-user or administrator.
        #[arg(long, default_value = "standard-user")]
        role: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "inkpress=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let mut config = config::Config::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.database.path = Some(db);
    }

    match cli.command {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            tracing::info!(
                version = env!("CARGO_PKG_VERSION"),
                db = %config.database.resolved_path().display(),
                "starting inkpress gateway"
            );
            gateway::run_gateway(config).await
        }
        Command::Whoami {
            email,
            password,
            base_url,
        } => {
            if let Some(base_url) = base_url {
                config.client.base_url = base_url;
            }
            let api = client::ApiClient::new(&config.client)?;
            api.login(&email, &password).await?;
            let identity = api.current_user().await?;
            println!(
                "{} <{}> role={} id={}",
                identity.name, identity.email, identity.role, identity.id
            );
            api.logout().await?;
            Ok(())
        }
        Command::Register {
            name,
            email,
            password,
            role,
        } => {
            let role = auth::Role::parse(&role)
                .ok_or_else(|| anyhow::anyhow!("role must be standard-user or administrator"))?;

            let db_path = config.database.resolved_path();
            if let Some(parent) = db_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let store = auth::AuthStore::open(&db_path, config.auth.session_ttl_secs)?;
            let identity = store
                .register(&name, &email, &password, role)
                .map_err(|e| anyhow::anyhow!("registration failed: {e}"))?;
            println!("registered {} <{}> ({})", identity.name, identity.email, identity.role.as_str());
            Ok(())
        }
    }
}
