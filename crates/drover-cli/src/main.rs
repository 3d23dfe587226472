mod config;
mod serve_cmd;

use clap::{Parser, Subcommand};

use drover_store::pool;

use config::{DroverConfig, Overrides};

#[derive(Parser)]
#[command(name = "drover", about = "Remote task broker for fleets of agents")]
struct Cli {
    /// Database URL (overrides DROVER_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a drover config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = drover_store::config::DbConfig::DEFAULT_URL)]
        db_url: String,
        /// Router transport bind address
        #[arg(long, default_value = config::DEFAULT_ROUTER_BIND)]
        router_bind: String,
        /// Monitoring API bind address
        #[arg(long, default_value = config::DEFAULT_HTTP_BIND)]
        http_bind: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the drover database (requires config file or env vars)
    DbInit,
    /// Run the broker: router transport plus monitoring API
    Serve {
        /// Router transport bind address (overrides DROVER_ROUTER_BIND)
        #[arg(long)]
        router_bind: Option<String>,
        /// Monitoring API bind address (overrides DROVER_HTTP_BIND)
        #[arg(long)]
        http_bind: Option<String>,
    },
}

/// Execute the `drover init` command: write config file.
fn cmd_init(db_url: &str, router_bind: &str, http_bind: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let api_key = config::generate_api_key();

    let cfg = config::ConfigFile {
        server: config::ServerSection {
            router_bind: router_bind.to_owned(),
            http_bind: http_bind.to_owned(),
        },
        database: config::DatabaseSection {
            url: db_url.to_owned(),
        },
        auth: config::AuthSection {
            api_keys: vec![api_key.clone()],
        },
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  server.router_bind = {router_bind}");
    println!("  server.http_bind = {http_bind}");
    println!("  database.url = {db_url}");
    println!("  auth.api_keys[0] = {}...{}", &api_key[..8], &api_key[56..]);
    println!();
    println!("Next: run `drover db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `drover db-init` command: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = DroverConfig::resolve(Overrides {
        database_url: cli_db_url,
        ..Overrides::default()
    })?;

    println!("Initializing drover database...");

    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    pool::run_migrations(&db_pool).await?;
    db_pool.close().await;

    println!("drover db-init complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            db_url,
            router_bind,
            http_bind,
            force,
        } => {
            cmd_init(&db_url, &router_bind, &http_bind, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Serve {
            router_bind,
            http_bind,
        } => {
            let resolved = DroverConfig::resolve(Overrides {
                database_url: cli.database_url.as_deref(),
                router_bind: router_bind.as_deref(),
                http_bind: http_bind.as_deref(),
            })?;
            serve_cmd::run_serve(resolved).await?;
        }
    }

    Ok(())
}
