use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use estate_core::Property;
use estate_sync::{IngestConfig, PropertyService};
use estate_web::WebConfig;
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "estate-cli")]
#[command(about = "Property listing ingestion and cache")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API with scheduled reconciliation.
    Serve,
    /// Search listings for a location.
    Search {
        location: String,
        #[arg(long)]
        page: Option<u32>,
    },
    /// Look up a single listing.
    Details { id: String },
    /// Import listings from a JSON array file for an owner.
    Import {
        file: PathBuf,
        #[arg(long)]
        owner: String,
    },
    /// Run one reconciliation pass now.
    Reconcile,
    /// Print cache and provider health.
    Health,
    /// Apply database migrations.
    Migrate,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn web_config_from_env() -> WebConfig {
    let defaults = WebConfig::default();
    WebConfig {
        port: env_parse("ESTATE_WEB_PORT").unwrap_or(defaults.port),
        allowed_origins: std::env::var("ESTATE_ALLOWED_ORIGINS")
            .map(|v| {
                v.split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or(defaults.allowed_origins),
        rate_limit_requests: env_parse("ESTATE_RATE_LIMIT_REQUESTS")
            .unwrap_or(defaults.rate_limit_requests),
        rate_limit_window: env_parse::<u64>("ESTATE_RATE_LIMIT_WINDOW_MINUTES")
            .map(|m| Duration::from_secs(m * 60))
            .unwrap_or(defaults.rate_limit_window),
        trust_forwarded_for: env_parse("ESTATE_TRUST_FORWARDED_FOR")
            .unwrap_or(defaults.trust_forwarded_for),
    }
}

async fn service() -> Result<Arc<PropertyService>> {
    let service = Arc::new(PropertyService::from_config(IngestConfig::from_env()?)?);
    service.initialize().await;
    Ok(service)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,estate=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Serve);
    let name = command.name();
    match run(command).await {
        Ok(()) => {
            tracing::debug!(command = name, "command finished");
            Ok(())
        }
        Err(err) => {
            tracing::error!(command = name, error = %err, "command failed");
            Err(err)
        }
    }
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Self::Serve => "serve",
            Self::Search { .. } => "search",
            Self::Details { .. } => "details",
            Self::Import { .. } => "import",
            Self::Reconcile => "reconcile",
            Self::Health => "health",
            Self::Migrate => "migrate",
        }
    }
}

async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Serve => {
            let web = web_config_from_env();
            tracing::info!(
                port = web.port,
                trust_forwarded_for = web.trust_forwarded_for,
                "starting server"
            );
            estate_web::serve(IngestConfig::from_env()?, web).await?;
        }
        Commands::Search { location, page } => {
            let page = service().await?.search_properties(&location, page).await?;
            print_json(&page)?;
        }
        Commands::Details { id } => match service().await?.get_property_details(&id).await? {
            Some(property) => print_json(&property)?,
            None => bail!("property {id} not found"),
        },
        Commands::Import { file, owner } => {
            let data = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let properties: Vec<Property> = serde_json::from_str(&data)
                .with_context(|| format!("parsing {}", file.display()))?;
            let summary = service().await?.import_properties(properties, &owner).await?;
            tracing::info!(
                owner = %summary.owner_id,
                imported = summary.imported,
                "import complete"
            );
            print_json(&summary)?;
        }
        Commands::Reconcile => {
            let report = service().await?.reconciler().run_once().await?;
            print_json(&report)?;
        }
        Commands::Health => {
            let report = service().await?.health_check().await;
            print_json(&report)?;
        }
        Commands::Migrate => {
            let config = IngestConfig::from_env()?;
            if config.database_url.is_none() {
                bail!("DATABASE_URL must be set to run migrations");
            }
            let service = PropertyService::from_config(config)?;
            if !service.chain().prepare_cache().await {
                bail!("migrations failed; see log output");
            }
            tracing::info!("migrations applied");
            println!("migrations applied");
        }
    }

    Ok(())
}
