use clap::Parser;
use coursegate::gating::spawn_invalidation_listener;
use coursegate::gating::web::GatingState;
use coursegate::{jobs, settings, storage, web};
use miette::Result;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "coursegate",
    version,
    about = "Content access gating for course modules and lessons"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    // load settings
    let settings = settings::Settings::load(&cli.config)?;
    tracing::info!(?settings, "Loaded configuration");

    // init storage (database)
    let db = storage::init(&settings.database).await?;
    storage::migrate(&db).await?;

    let state = Arc::new(GatingState::new(db.clone(), &settings.gating));
    if !settings.gating.cache_enabled {
        tracing::warn!("Decision cache disabled; every check reads the store");
    }

    // events published by other components still reach the cache
    let _listener = spawn_invalidation_listener(state.engine.clone(), &state.events);

    // background jobs
    let _scheduler = jobs::init_scheduler(db, state.engine.clone(), &settings.gating).await?;

    // start web server
    web::serve(&settings, state).await?;
    Ok(())
}
