use std::time::Duration;

use scribe::{app, db, subscriptions, AppState, Config};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("scribe=info")),
        )
        .init();

    if let Err(err) = run() {
        tracing::error!(error = %err, "scribe exited with an error");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load_default()?;
    config.validate()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.server.workers.max(1))
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let db = db::init(&config.database, &config.subscriptions).await?;

        let sweep_secs = config.subscriptions.expiry_sweep_secs;
        if sweep_secs > 0 {
            subscriptions::spawn_expiry_sweep(db.clone(), Duration::from_secs(sweep_secs));
        }

        let addr = config.bind_address();
        let server = app::build(AppState::new(db, config));
        server.listen(&addr).await?;
        tracing::info!("scribe stopped");
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}
