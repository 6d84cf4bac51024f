//! Coordinator - owns the set of virtual sources and is the single entry and
//! exit point for the downstream sink.
//!
//! The coordinator always runs one unbounded "firehose" source whose filter
//! chain carries one step per active sideline, so diverted traffic is
//! withheld from the default stream. Starting a sideline spawns a second
//! source with the negated step; stopping it bounds that source's window at
//! the firehose's current position so it drains and tears itself down.

use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use futures::future::join_all;
use tracing::{info, warn};

use crate::consumer::ConsumerFactory;
use crate::consumer_state::ConsumerState;
use crate::fair_buffer::FairBuffer;
use crate::filter::{FilterChain, NegatingFilterChainStep};
use crate::metrics_const::{
    ACTIVE_VIRTUAL_SOURCES, SIDELINES_STARTED, SIDELINES_STOPPED, SOURCES_REAPED,
    UNKNOWN_SOURCE_COMPLETIONS,
};
use crate::retry::{build_retry_manager, RetryConfig, RetryPolicy};
use crate::types::{Message, MessageId, SidelineRequest, SidelineRequestId, VirtualSourceId};
use crate::virtual_source::{SourceStatus, VirtualSource, VirtualSourceConfig};

pub const FIREHOSE_SOURCE_ID: &str = "firehose";

#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    /// Per-source fair-buffer queue capacity.
    pub buffer_capacity: BufferCapacity,
    pub retry_policy: RetryPolicy,
    pub retry: RetryConfig,
    pub source: VirtualSourceConfig,
}

/// Validated per-source queue capacity, always > 0.
#[derive(Debug, Clone, Copy)]
pub struct BufferCapacity(usize);

impl BufferCapacity {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            anyhow::bail!("per-source buffer capacity must be greater than zero");
        }
        Ok(Self(capacity))
    }

    pub fn get(&self) -> usize {
        self.0
    }
}

impl Default for BufferCapacity {
    fn default() -> Self {
        Self(1024)
    }
}

struct ManagedSource {
    source: VirtualSource,
    request_id: Option<SidelineRequestId>,
}

pub struct Coordinator {
    config: CoordinatorConfig,
    factory: Arc<dyn ConsumerFactory>,
    buffer: Arc<FairBuffer>,
    sources: DashMap<VirtualSourceId, ManagedSource>,
    active_sidelines: DashMap<SidelineRequestId, VirtualSourceId>,
    firehose_id: VirtualSourceId,
    firehose_chain: Arc<FilterChain>,
}

impl Coordinator {
    /// Create the coordinator and start the firehose source.
    pub async fn start(
        config: CoordinatorConfig,
        factory: Arc<dyn ConsumerFactory>,
    ) -> Result<Self> {
        let buffer = Arc::new(FairBuffer::new(config.buffer_capacity.get()));
        let firehose_id = VirtualSourceId::new(FIREHOSE_SOURCE_ID);
        let firehose_chain = Arc::new(FilterChain::new());

        let coordinator = Self {
            config,
            factory,
            buffer,
            sources: DashMap::new(),
            active_sidelines: DashMap::new(),
            firehose_id: firehose_id.clone(),
            firehose_chain: firehose_chain.clone(),
        };

        coordinator
            .spawn_source(
                firehose_id,
                firehose_chain,
                ConsumerState::default(),
                None,
                None,
            )
            .await
            .context("starting firehose source")?;

        Ok(coordinator)
    }

    async fn spawn_source(
        &self,
        id: VirtualSourceId,
        chain: Arc<FilterChain>,
        starting_state: ConsumerState,
        ending_state: Option<ConsumerState>,
        request_id: Option<SidelineRequestId>,
    ) -> Result<()> {
        let consumer = self
            .factory
            .create_consumer(&id)
            .await
            .with_context(|| format!("creating consumer for source {id}"))?;

        self.buffer.add_source(id.clone());
        let source = VirtualSource::spawn(
            id.clone(),
            consumer,
            starting_state,
            ending_state,
            chain,
            build_retry_manager(self.config.retry_policy, &self.config.retry),
            self.buffer.clone(),
            self.config.source.clone(),
        );

        info!(source_id = %id, "Started virtual source");
        self.sources.insert(id, ManagedSource { source, request_id });
        metrics::gauge!(ACTIVE_VIRTUAL_SOURCES).set(self.sources.len() as f64);
        Ok(())
    }

    /// Begin diverting traffic matching the request's step: the firehose
    /// stops emitting it and a new virtual source picks it up from the
    /// firehose's current position.
    pub async fn start_sideline(&self, request: &SidelineRequest) -> Result<VirtualSourceId> {
        if let Some(existing) = self.active_sidelines.get(&request.id) {
            warn!(request_id = %request.id, "Sideline already active, ignoring start");
            return Ok(existing.value().clone());
        }

        let starting_state = self.firehose_current_state();
        self.firehose_chain.add_step(request.id, request.step.clone());

        let chain = FilterChain::new();
        chain.add_step(
            request.id,
            Arc::new(NegatingFilterChainStep::new(request.step.clone())),
        );

        let source_id = VirtualSourceId::new(format!("sideline-{}", request.id));
        self.spawn_source(
            source_id.clone(),
            Arc::new(chain),
            starting_state,
            None,
            Some(request.id),
        )
        .await
        .with_context(|| format!("starting sideline {}", request.id))?;

        self.active_sidelines.insert(request.id, source_id.clone());
        metrics::counter!(SIDELINES_STARTED).increment(1);
        info!(request_id = %request.id, source_id = %source_id, "Sideline started");
        Ok(source_id)
    }

    /// Return diverted traffic to the default stream and bound the sideline
    /// source's window so it drains what it already owns, then closes.
    pub fn stop_sideline(&self, request_id: &SidelineRequestId) {
        if self.firehose_chain.remove_step(request_id).is_none() {
            warn!(request_id = %request_id, "No firehose filter step for sideline stop");
        }

        let Some((_, source_id)) = self.active_sidelines.remove(request_id) else {
            warn!(request_id = %request_id, "No active sideline for stop request");
            return;
        };

        let ending_state = self.firehose_current_state();
        if let Some(entry) = self.sources.get(&source_id) {
            entry.source.handle().set_ending_state(ending_state);
        }

        metrics::counter!(SIDELINES_STOPPED).increment(1);
        info!(request_id = %request_id, source_id = %source_id, "Sideline stopping");
    }

    /// The next fairly-multiplexed message, or `None` if nothing is ready.
    pub fn next_tuple(&self) -> Option<Message> {
        self.buffer.poll()
    }

    /// Route an ack back to the owning source. Acks for a source that has
    /// already been torn down are logged and dropped, never an error.
    pub fn ack(&self, message_id: MessageId) {
        let Some(entry) = self.sources.get(message_id.source_id()) else {
            self.drop_unknown("ack", &message_id);
            return;
        };
        if let Err(e) = entry.source.handle().ack(message_id) {
            warn!(error = ?e, "Ack not delivered");
        }
    }

    /// Route a fail back to the owning source; same teardown tolerance as
    /// [`Coordinator::ack`].
    pub fn fail(&self, message_id: MessageId) {
        let Some(entry) = self.sources.get(message_id.source_id()) else {
            self.drop_unknown("fail", &message_id);
            return;
        };
        if let Err(e) = entry.source.handle().fail(message_id) {
            warn!(error = ?e, "Fail not delivered");
        }
    }

    fn drop_unknown(&self, kind: &'static str, message_id: &MessageId) {
        warn!(
            message_id = %message_id,
            kind = kind,
            "Completion for unknown source, dropping"
        );
        metrics::counter!(UNKNOWN_SOURCE_COMPLETIONS, "kind" => kind).increment(1);
    }

    /// Deregister and drop sources that have reached `Closed`. Returns how
    /// many were reaped.
    pub async fn reap(&self) -> usize {
        let closed: Vec<VirtualSourceId> = self
            .sources
            .iter()
            .filter(|entry| entry.value().source.is_closed())
            .map(|entry| entry.key().clone())
            .collect();

        let mut reaped = 0;
        for id in closed {
            let Some((_, managed)) = self.sources.remove(&id) else {
                continue;
            };
            self.buffer.remove_source(&id);
            if let Some(request_id) = managed.request_id {
                self.active_sidelines.remove(&request_id);
            }
            managed.source.shutdown().await;
            info!(source_id = %id, "Reaped closed virtual source");
            reaped += 1;
        }

        if reaped > 0 {
            metrics::counter!(SOURCES_REAPED).increment(reaped as u64);
            metrics::gauge!(ACTIVE_VIRTUAL_SOURCES).set(self.sources.len() as f64);
        }
        reaped
    }

    /// Stop every source, wait for them to wind down, and drop them.
    pub async fn shutdown(&self) {
        info!(sources = self.sources.len(), "Shutting down coordinator");

        let ids: Vec<VirtualSourceId> = self.sources.iter().map(|e| e.key().clone()).collect();
        let mut draining = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((_, managed)) = self.sources.remove(&id) {
                self.buffer.remove_source(&id);
                draining.push(managed.source.shutdown());
            }
        }
        join_all(draining).await;

        self.active_sidelines.clear();
        metrics::gauge!(ACTIVE_VIRTUAL_SOURCES).set(0.0);
        info!("Coordinator shut down");
    }

    /// Monitoring snapshots for every owned source.
    pub fn source_statuses(&self) -> Vec<SourceStatus> {
        self.sources
            .iter()
            .map(|entry| entry.value().source.handle().status())
            .collect()
    }

    pub fn firehose_id(&self) -> &VirtualSourceId {
        &self.firehose_id
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub fn active_sideline_count(&self) -> usize {
        self.active_sidelines.len()
    }

    fn firehose_current_state(&self) -> ConsumerState {
        self.sources
            .get(&self.firehose_id)
            .map(|entry| entry.source.handle().current_state())
            .unwrap_or_default()
    }
}
