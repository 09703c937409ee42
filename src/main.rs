use anyhow::Result;
use bare_gateway::config::{LoggingSettings, Settings};
use bare_gateway::Application;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing(logging: &LoggingSettings) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if logging.format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.pretty().init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::new()?;
    init_tracing(&settings.logging);

    info!(
        environment = %settings.application.environment,
        "Starting bare gateway application"
    );

    let app = Application::new(settings)?;
    app.run().await?;

    Ok(())
}
