//! Service wiring: coordinator over Kafka plus a logging sink loop.
//!
//! The downstream sink is an external collaborator in production; the
//! bundled loop polls the coordinator, logs each message, and acks it, which
//! is enough to run the engine standalone and watch sidelines divert
//! traffic.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::kafka::KafkaConsumerFactory;
use crate::types::{SidelineRequest, SidelineRequestId, VirtualSourceId};

pub struct SidelineService {
    config: Config,
    coordinator: Arc<Coordinator>,
}

impl SidelineService {
    pub async fn new(config: Config) -> Result<Self> {
        let coordinator_config = config
            .to_coordinator_config()
            .context("invalid sideliner configuration")?;
        let factory = Arc::new(KafkaConsumerFactory::from_config(&config));
        let coordinator = Coordinator::start(coordinator_config, factory)
            .await
            .context("starting coordinator")?;

        Ok(Self {
            config,
            coordinator: Arc::new(coordinator),
        })
    }

    pub fn coordinator(&self) -> Arc<Coordinator> {
        self.coordinator.clone()
    }

    /// Submit a sideline start request.
    pub async fn start_sideline(&self, request: &SidelineRequest) -> Result<VirtualSourceId> {
        self.coordinator.start_sideline(request).await
    }

    /// Submit a sideline stop request.
    pub fn stop_sideline(&self, request_id: &SidelineRequestId) {
        self.coordinator.stop_sideline(request_id);
    }

    /// Run the sink loop until ctrl-c, then shut the coordinator down.
    pub async fn run(self) -> Result<()> {
        info!("Starting sideline service");

        let mut poll_interval = tokio::time::interval(Duration::from_millis(10));
        let mut reap_interval = tokio::time::interval(self.config.reap_interval());

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    break;
                }

                _ = reap_interval.tick() => {
                    self.coordinator.reap().await;
                }

                _ = poll_interval.tick() => {
                    while let Some(message) = self.coordinator.next_tuple() {
                        debug!(
                            message_id = %message.id(),
                            payload_bytes = message.payload().len(),
                            "Sink received message"
                        );
                        self.coordinator.ack(message.id().clone());
                    }
                }
            }
        }

        self.coordinator.shutdown().await;
        info!("Sideline service stopped");
        Ok(())
    }
}
