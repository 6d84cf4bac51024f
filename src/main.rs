use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use kafka_sideliner::{config::Config, service::SidelineService};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    info!("Starting Kafka Sideliner service");

    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables. Please check your environment setup.")?;

    info!("Configuration loaded: {:?}", config);

    let bind = config.bind_address().context("invalid metrics bind address")?;
    PrometheusBuilder::new()
        .with_http_listener(bind)
        .install()
        .context("Failed to start Prometheus metrics exporter")?;
    info!("Started metrics exporter on {}", bind);

    let service = SidelineService::new(config)
        .await
        .context("Failed to create sideline service. Check your Kafka connection settings.")?;

    // Runs until shutdown
    service.run().await?;

    Ok(())
}
