use std::process::ExitCode;

use feedsync_infra::config::IngestConfig;
use feedsync_runner::app::App;

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env is normal outside development.
    let _ = dotenvy::dotenv();
    feedsync_observability::init();

    let config = match IngestConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let app = match App::build(config).await {
        Ok(app) => app,
        Err(e) => {
            tracing::error!("startup failed: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    app.run().await;
    ExitCode::SUCCESS
}
