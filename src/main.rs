use anyhow::Result;
use pgbridge::{config::Config, engine::Engine, server::serve};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// Entry point for the pgbridge server.
///
/// 1. Parses the command line (`PGBRIDGE_*` variables fill in unset flags)
/// 2. Initializes tracing; `RUST_LOG` overrides `--log-level`
/// 3. Opens the SQLite file and installs the catalog views
/// 4. Serves PostgreSQL clients until Ctrl-C
///
/// # Example Usage
/// ```bash
/// cargo run -- --database ./app.db --listen 127.0.0.1:5432 --socket-dir /tmp
/// psql -h 127.0.0.1 -p 5432 -U app
/// ```
#[tokio::main]
async fn main() -> Result<()> {
    let matches = Config::command().get_matches();
    let config = Config::from_matches(&matches);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    info!(config = %serde_json::to_string(&config)?, "starting pgbridge");

    let engine = Arc::new(Engine::open(config).await?);
    serve(engine).await
}
