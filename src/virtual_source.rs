//! Virtual source - one independently scheduled consumption unit.
//!
//! Each virtual source owns a Consumer handle bound to a partition-offset
//! window, applies its own filter chain, and emits accepted messages into the
//! fair buffer from its own task. Acks and fails are routed back to it over
//! control channels and drained cooperatively by the same task, so the retry
//! manager is only ever touched single-writer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::consumer::Consumer;
use crate::consumer_state::ConsumerState;
use crate::fair_buffer::FairBuffer;
use crate::filter::FilterChain;
use crate::metrics_const::{
    MESSAGES_COMPLETED, MESSAGES_EMITTED, MESSAGES_FILTERED, MESSAGES_RETRIED, RETRIES_EXHAUSTED,
};
use crate::offset_tracker::OffsetTracker;
use crate::retry::RetryManager;
use crate::types::{Message, MessageId, Partition, VirtualSourceId};

/// Lifecycle of a virtual source. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Open,
    Running,
    StopRequested,
    Flushed,
    Closed,
}

/// Tuning for the source loop.
#[derive(Debug, Clone)]
pub struct VirtualSourceConfig {
    /// Sleep between passes when no work was available.
    pub poll_interval: std::time::Duration,
    /// How often acked offsets are checkpointed and high-water-marks
    /// refreshed.
    pub flush_interval: std::time::Duration,
    /// Upper bound on consecutive filtered records consumed per fetch pass,
    /// so a dense filtered region cannot monopolize the loop.
    pub max_filtered_per_pass: usize,
}

impl Default for VirtualSourceConfig {
    fn default() -> Self {
        Self {
            poll_interval: std::time::Duration::from_millis(10),
            flush_interval: std::time::Duration::from_secs(1),
            max_filtered_per_pass: 100,
        }
    }
}

/// State shared between the source task and its handle.
struct SourceShared {
    id: VirtualSourceId,
    lifecycle: RwLock<Lifecycle>,
    stop: CancellationToken,
    starting_state: ConsumerState,
    current_state: RwLock<ConsumerState>,
    ending_state: RwLock<Option<ConsumerState>>,
    high_water_marks: RwLock<ConsumerState>,
    filtered_count: AtomicU64,
}

impl SourceShared {
    fn set_lifecycle(&self, next: Lifecycle) {
        let mut lifecycle = self.lifecycle.write().expect("lifecycle lock poisoned");
        debug!(source_id = %self.id, from = ?*lifecycle, to = ?next, "Lifecycle transition");
        *lifecycle = next;
    }

    fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.read().expect("lifecycle lock poisoned")
    }

    fn request_stop(&self) {
        if !self.stop.is_cancelled() {
            info!(source_id = %self.id, "Stop requested for virtual source");
            self.stop.cancel();
            let lifecycle = self.lifecycle();
            if !matches!(lifecycle, Lifecycle::Flushed | Lifecycle::Closed) {
                self.set_lifecycle(Lifecycle::StopRequested);
            }
        }
    }
}

/// Monitoring snapshot of one source's window and progress.
#[derive(Debug, Clone)]
pub struct SourceStatus {
    pub id: VirtualSourceId,
    pub lifecycle: Lifecycle,
    pub starting_state: ConsumerState,
    pub current_state: ConsumerState,
    pub ending_state: Option<ConsumerState>,
    pub high_water_marks: ConsumerState,
    pub filtered_count: u64,
}

impl SourceStatus {
    /// Messages remaining before the window target: the ending state for
    /// bounded sources, the high-water-mark for unbounded ones.
    pub fn lag(&self) -> i64 {
        let target = self.ending_state.as_ref().unwrap_or(&self.high_water_marks);
        target
            .iter()
            .map(|(partition, end)| {
                let current = self.current_state.offset_for(partition).unwrap_or(0);
                (end - current).max(0)
            })
            .sum()
    }
}

/// Cloneable routing handle to a running source. Acks and fails travel over
/// unbounded control channels drained by the source's own task.
#[derive(Clone)]
pub struct VirtualSourceHandle {
    shared: Arc<SourceShared>,
    ack_tx: mpsc::UnboundedSender<MessageId>,
    fail_tx: mpsc::UnboundedSender<MessageId>,
}

impl VirtualSourceHandle {
    pub fn id(&self) -> &VirtualSourceId {
        &self.shared.id
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.lifecycle()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lifecycle() == Lifecycle::Closed
    }

    /// Cooperative cancellation. Idempotent and safe from any task; the
    /// source finishes its current unit of work before winding down.
    pub fn request_stop(&self) {
        self.shared.request_stop();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.shared.stop.is_cancelled()
    }

    /// Bound the source's window: once every partition of `state` has been
    /// reached, the source stops on its own.
    pub fn set_ending_state(&self, state: ConsumerState) {
        *self
            .shared
            .ending_state
            .write()
            .expect("ending state lock poisoned") = Some(state);
    }

    pub fn starting_state(&self) -> ConsumerState {
        self.shared.starting_state.clone()
    }

    pub fn current_state(&self) -> ConsumerState {
        self.shared
            .current_state
            .read()
            .expect("current state lock poisoned")
            .clone()
    }

    pub fn ending_state(&self) -> Option<ConsumerState> {
        self.shared
            .ending_state
            .read()
            .expect("ending state lock poisoned")
            .clone()
    }

    pub fn filtered_count(&self) -> u64 {
        self.shared.filtered_count.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> SourceStatus {
        SourceStatus {
            id: self.shared.id.clone(),
            lifecycle: self.lifecycle(),
            starting_state: self.starting_state(),
            current_state: self.current_state(),
            ending_state: self.ending_state(),
            high_water_marks: self
                .shared
                .high_water_marks
                .read()
                .expect("high water mark lock poisoned")
                .clone(),
            filtered_count: self.filtered_count(),
        }
    }

    /// Route an ack to this source. Fails once the source task has exited.
    pub fn ack(&self, message_id: MessageId) -> Result<()> {
        self.ack_tx
            .send(message_id)
            .map_err(|e| anyhow::anyhow!("Source {} no longer accepts acks: {e}", self.shared.id))
    }

    /// Route a fail to this source. Fails once the source task has exited.
    pub fn fail(&self, message_id: MessageId) -> Result<()> {
        self.fail_tx
            .send(message_id)
            .map_err(|e| anyhow::anyhow!("Source {} no longer accepts fails: {e}", self.shared.id))
    }
}

/// A spawned virtual source, owned by the coordinator.
pub struct VirtualSource {
    handle: VirtualSourceHandle,
    join: Option<JoinHandle<()>>,
}

impl VirtualSource {
    /// Spawn a source task over an already-registered fair-buffer queue.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        id: VirtualSourceId,
        consumer: Box<dyn Consumer>,
        starting_state: ConsumerState,
        ending_state: Option<ConsumerState>,
        filter_chain: Arc<FilterChain>,
        retry_manager: Box<dyn RetryManager>,
        buffer: Arc<FairBuffer>,
        config: VirtualSourceConfig,
    ) -> Self {
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let (fail_tx, fail_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(SourceShared {
            id: id.clone(),
            lifecycle: RwLock::new(Lifecycle::Created),
            stop: CancellationToken::new(),
            starting_state: starting_state.clone(),
            current_state: RwLock::new(starting_state.clone()),
            ending_state: RwLock::new(ending_state),
            high_water_marks: RwLock::new(ConsumerState::default()),
            filtered_count: AtomicU64::new(0),
        });

        let source_loop = SourceLoop {
            consumer,
            starting_state,
            filter_chain,
            retry_manager,
            buffer,
            config,
            shared: shared.clone(),
            ack_rx,
            fail_rx,
            positions: HashMap::new(),
            offsets: OffsetTracker::new(),
            in_flight_messages: HashMap::new(),
        };

        let join = tokio::spawn(async move {
            source_loop.run().await;
        });

        Self {
            handle: VirtualSourceHandle {
                shared,
                ack_tx,
                fail_tx,
            },
            join: Some(join),
        }
    }

    pub fn id(&self) -> &VirtualSourceId {
        self.handle.id()
    }

    pub fn handle(&self) -> VirtualSourceHandle {
        self.handle.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    pub fn request_stop(&self) {
        self.handle.request_stop();
    }

    /// Request a stop and wait for the task to wind down.
    pub async fn shutdown(mut self) {
        self.handle.request_stop();
        if let Some(join) = self.join.take() {
            match join.await {
                Ok(()) => debug!(source_id = %self.handle.id(), "Virtual source shut down"),
                Err(e) => warn!(
                    source_id = %self.handle.id(),
                    "Virtual source panicked during shutdown: {e}"
                ),
            }
        }
    }
}

/// The task side of a virtual source. Exclusively owns the consumer, the
/// retry manager and the in-flight payload cache.
struct SourceLoop {
    consumer: Box<dyn Consumer>,
    starting_state: ConsumerState,
    filter_chain: Arc<FilterChain>,
    retry_manager: Box<dyn RetryManager>,
    buffer: Arc<FairBuffer>,
    config: VirtualSourceConfig,
    shared: Arc<SourceShared>,
    ack_rx: mpsc::UnboundedReceiver<MessageId>,
    fail_rx: mpsc::UnboundedReceiver<MessageId>,
    /// Next offset to consume per partition this source has touched.
    positions: HashMap<Partition, i64>,
    /// Which emitted offsets have resolved, bounding what is safe to commit.
    offsets: OffsetTracker,
    /// Payloads of emitted messages retained until acked, so failed messages
    /// can be re-emitted without refetching.
    in_flight_messages: HashMap<MessageId, Message>,
}

impl SourceLoop {
    async fn run(mut self) {
        info!(source_id = %self.shared.id, "Starting virtual source");

        if let Err(e) = self.open().await {
            error!(source_id = %self.shared.id, error = ?e, "Failed to open virtual source");
            self.shared.request_stop();
            self.close().await;
            return;
        }

        self.shared.set_lifecycle(Lifecycle::Running);
        let mut last_flush = Instant::now();

        while !self.shared.stop.is_cancelled() {
            let mut progressed = self.drain_completions();

            if let Some(message_id) = self.retry_manager.next_failed_message_to_retry() {
                self.emit_retry(message_id).await;
                progressed = true;
            } else {
                match self.next_message().await {
                    Ok(Some(message)) => {
                        self.emit(message).await;
                        progressed = true;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(source_id = %self.shared.id, error = ?e, "Fetch pass failed");
                    }
                }
            }

            if self.window_complete() {
                info!(source_id = %self.shared.id, "Ending state reached, stopping virtual source");
                self.shared.request_stop();
                break;
            }

            if last_flush.elapsed() >= self.config.flush_interval {
                self.flush().await;
                self.refresh_high_water_marks().await;
                last_flush = Instant::now();
            }

            if !progressed {
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }

        // Finish in-flight completions before the final flush.
        self.drain_completions();
        self.flush().await;
        self.shared.set_lifecycle(Lifecycle::Flushed);
        self.close().await;
    }

    async fn open(&mut self) -> Result<()> {
        self.consumer
            .open(&self.starting_state)
            .await
            .context("opening consumer")?;
        self.shared.set_lifecycle(Lifecycle::Open);
        Ok(())
    }

    async fn close(&mut self) {
        if let Err(e) = self.consumer.close().await {
            warn!(source_id = %self.shared.id, error = ?e, "Error closing consumer");
        }
        self.shared.set_lifecycle(Lifecycle::Closed);
        info!(source_id = %self.shared.id, "Virtual source closed");
    }

    /// Drain pending acks and fails. Returns whether any work was done.
    fn drain_completions(&mut self) -> bool {
        let mut progressed = false;
        while let Ok(message_id) = self.ack_rx.try_recv() {
            self.handle_ack(&message_id);
            progressed = true;
        }
        while let Ok(message_id) = self.fail_rx.try_recv() {
            self.handle_fail(&message_id);
            progressed = true;
        }
        progressed
    }

    fn handle_ack(&mut self, message_id: &MessageId) {
        self.retry_manager.acked(message_id);
        self.in_flight_messages.remove(message_id);
        self.offsets
            .record_resolved(message_id.partition(), message_id.offset());
        metrics::counter!(MESSAGES_COMPLETED, "status" => "acked").increment(1);
    }

    fn handle_fail(&mut self, message_id: &MessageId) {
        if self.retry_manager.retry_further(message_id) {
            debug!(source_id = %self.shared.id, message_id = %message_id, "Scheduling retry");
            self.retry_manager.failed(message_id);
            metrics::counter!(MESSAGES_COMPLETED, "status" => "failed").increment(1);
        } else {
            // Out of retry budget: resolve as acked rather than retry forever.
            warn!(
                source_id = %self.shared.id,
                message_id = %message_id,
                "Retry budget exhausted, resolving message as acked"
            );
            metrics::counter!(RETRIES_EXHAUSTED).increment(1);
            self.handle_ack(message_id);
        }
    }

    /// Pull raw records until one passes the filter chain, the consumer runs
    /// dry, or the per-pass filtered budget is spent.
    async fn next_message(&mut self) -> Result<Option<Message>> {
        if self.window_complete() {
            return Ok(None);
        }

        let ending_state = self.shared.ending_state.read().expect("ending state lock poisoned").clone();

        for _ in 0..self.config.max_filtered_per_pass {
            let Some(record) = self.consumer.next_record().await? else {
                return Ok(None);
            };

            // Records at or past the ending offset belong to the next era of
            // the stream; never emit them.
            if let Some(end_offset) = ending_state
                .as_ref()
                .and_then(|end| end.offset_for(&record.partition))
            {
                if record.offset >= end_offset {
                    self.advance_position(record.partition.clone(), end_offset);
                    if self.window_complete() {
                        return Ok(None);
                    }
                    continue;
                }
            }

            self.advance_position(record.partition.clone(), record.offset + 1);

            let message_id = MessageId::new(
                self.shared.id.clone(),
                record.partition.clone(),
                record.offset,
            );
            let message = Message::new(message_id, record.payload);

            if self.filter_chain.filter(&message) {
                self.shared.filtered_count.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(MESSAGES_FILTERED, "source" => self.shared.id.to_string())
                    .increment(1);
                continue;
            }

            return Ok(Some(message));
        }

        Ok(None)
    }

    fn advance_position(&mut self, partition: Partition, next_offset: i64) {
        let position = self.positions.entry(partition).or_insert(next_offset);
        *position = (*position).max(next_offset);

        let mut builder = ConsumerState::builder();
        for (partition, offset) in self.starting_state.iter() {
            builder = builder.with_partition(partition.clone(), offset);
        }
        for (partition, offset) in &self.positions {
            builder = builder.with_partition(partition.clone(), *offset);
        }
        *self
            .shared
            .current_state
            .write()
            .expect("current state lock poisoned") = builder.build();
    }

    /// Whether a bounded window has been fully consumed.
    fn window_complete(&self) -> bool {
        let ending_state = self.shared.ending_state.read().expect("ending state lock poisoned");
        let Some(ending) = ending_state.as_ref() else {
            return false;
        };

        let complete = ending.iter().all(|(partition, end_offset)| {
            let position = self
                .positions
                .get(partition)
                .copied()
                .or_else(|| self.starting_state.offset_for(partition))
                .unwrap_or(0);
            position >= end_offset
        });
        complete
    }

    async fn emit(&mut self, message: Message) {
        let message_id = message.id().clone();
        self.in_flight_messages
            .insert(message_id.clone(), message.clone());

        if let Err(e) = self.put_message(message).await {
            warn!(source_id = %self.shared.id, message_id = %message_id, error = ?e, "Emit failed");
            self.in_flight_messages.remove(&message_id);
            return;
        }
        self.offsets
            .record_emitted(message_id.partition(), message_id.offset());
        metrics::counter!(MESSAGES_EMITTED, "source" => self.shared.id.to_string()).increment(1);
    }

    async fn emit_retry(&mut self, message_id: MessageId) {
        let Some(message) = self.in_flight_messages.get(&message_id).cloned() else {
            // No retained payload; nothing left to replay for this id.
            warn!(
                source_id = %self.shared.id,
                message_id = %message_id,
                "No retained payload for retry, dropping"
            );
            self.retry_manager.acked(&message_id);
            return;
        };

        if let Err(e) = self.put_message(message).await {
            warn!(source_id = %self.shared.id, message_id = %message_id, error = ?e, "Retry emit failed");
            return;
        }
        debug!(source_id = %self.shared.id, message_id = %message_id, "Re-emitted failed message");
        metrics::counter!(MESSAGES_RETRIED, "source" => self.shared.id.to_string()).increment(1);
    }

    /// Blocking enqueue onto this source's buffer queue, canceled by the stop
    /// signal so a full queue cannot wedge shutdown.
    async fn put_message(&mut self, message: Message) -> Result<()> {
        tokio::select! {
            result = self.buffer.put(&self.shared.id, message) => result,
            _ = self.shared.stop.cancelled() => {
                Err(anyhow::anyhow!("Emit canceled by stop request"))
            }
        }
    }

    /// Checkpoint the offsets that are safe to commit through the consumer.
    async fn flush(&mut self) {
        let state = self.offsets.committable_state();
        if state.is_empty() {
            return;
        }

        if let Err(e) = self.consumer.flush_state(&state).await {
            warn!(source_id = %self.shared.id, error = ?e, "Failed to flush consumer state");
        } else {
            debug!(source_id = %self.shared.id, state = ?state, "Flushed consumer state");
        }
    }

    async fn refresh_high_water_marks(&mut self) {
        match self.consumer.high_water_marks().await {
            Ok(marks) => {
                *self
                    .shared
                    .high_water_marks
                    .write()
                    .expect("high water mark lock poisoned") = marks;
            }
            Err(e) => {
                debug!(source_id = %self.shared.id, error = ?e, "Failed to read high water marks");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::ConsumerFactory;
    use crate::retry::{DefaultRetryManager, NeverRetryManager, RetryConfig};
    use crate::test_utils::{number_payload, InMemoryConsumerFactory, MessageLog, NumberFilter};
    use std::time::Duration;

    fn partition() -> Partition {
        Partition::new("test-topic".to_string(), 0)
    }

    fn test_config() -> VirtualSourceConfig {
        VirtualSourceConfig {
            poll_interval: Duration::from_millis(1),
            flush_interval: Duration::from_millis(20),
            max_filtered_per_pass: 100,
        }
    }

    /// Retry immediately and forever, for deterministic re-emission tests.
    fn immediate_retry() -> Box<DefaultRetryManager> {
        Box::new(DefaultRetryManager::new(RetryConfig {
            retry_limit: -1,
            initial_retry_delay: Duration::ZERO,
            retry_delay_multiplier: 1.0,
            retry_delay_max: Duration::ZERO,
        }))
    }

    async fn spawn_source(
        factory: &InMemoryConsumerFactory,
        id: &VirtualSourceId,
        buffer: Arc<FairBuffer>,
        chain: Arc<FilterChain>,
        retry_manager: Box<dyn RetryManager>,
        starting: ConsumerState,
        ending: Option<ConsumerState>,
    ) -> VirtualSource {
        let consumer = factory.create_consumer(id).await.unwrap();
        buffer.add_source(id.clone());
        VirtualSource::spawn(
            id.clone(),
            consumer,
            starting,
            ending,
            chain,
            retry_manager,
            buffer,
            test_config(),
        )
    }

    async fn poll_messages(buffer: &FairBuffer, count: usize) -> Vec<Message> {
        let mut messages = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        while messages.len() < count {
            if let Some(message) = buffer.poll() {
                messages.push(message);
            } else {
                assert!(Instant::now() < deadline, "timed out waiting for messages");
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        }
        messages
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for condition");
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    #[tokio::test]
    async fn test_source_emits_messages_in_order() {
        let factory = InMemoryConsumerFactory::new(MessageLog::new());
        for n in 0..3 {
            factory.log().append(&partition(), number_payload(n));
        }

        let buffer = Arc::new(FairBuffer::new(16));
        let id = VirtualSourceId::new("emitter");
        let source = spawn_source(
            &factory,
            &id,
            buffer.clone(),
            Arc::new(FilterChain::new()),
            Box::new(NeverRetryManager),
            ConsumerState::default(),
            None,
        )
        .await;

        let messages = poll_messages(&buffer, 3).await;
        let offsets: Vec<i64> = messages.iter().map(|m| m.id().offset()).collect();
        assert_eq!(offsets, vec![0, 1, 2]);
        assert!(messages.iter().all(|m| m.id().source_id() == &id));

        source.shutdown().await;
    }

    #[tokio::test]
    async fn test_filtered_messages_are_skipped_and_counted() {
        let factory = InMemoryConsumerFactory::new(MessageLog::new());
        for n in 1..=5 {
            factory.log().append(&partition(), number_payload(n));
        }

        let chain = FilterChain::new();
        chain.add_step(
            crate::types::SidelineRequestId::new(),
            Arc::new(NumberFilter::new(2)),
        );
        chain.add_step(
            crate::types::SidelineRequestId::new(),
            Arc::new(NumberFilter::new(4)),
        );

        let buffer = Arc::new(FairBuffer::new(16));
        let id = VirtualSourceId::new("filtering");
        let source = spawn_source(
            &factory,
            &id,
            buffer.clone(),
            Arc::new(chain),
            Box::new(NeverRetryManager),
            ConsumerState::default(),
            None,
        )
        .await;

        let messages = poll_messages(&buffer, 3).await;
        let values: Vec<i64> = messages
            .iter()
            .map(|m| crate::test_utils::payload_number(m).unwrap())
            .collect();
        assert_eq!(values, vec![1, 3, 5]);

        let handle = source.handle();
        wait_until(|| handle.filtered_count() == 2).await;

        source.shutdown().await;
    }

    #[tokio::test]
    async fn test_ack_reaches_offset_commit_path() {
        let factory = InMemoryConsumerFactory::new(MessageLog::new());
        for n in 0..2 {
            factory.log().append(&partition(), number_payload(n));
        }

        let buffer = Arc::new(FairBuffer::new(16));
        let id = VirtualSourceId::new("acking");
        let source = spawn_source(
            &factory,
            &id,
            buffer.clone(),
            Arc::new(FilterChain::new()),
            Box::new(NeverRetryManager),
            ConsumerState::default(),
            None,
        )
        .await;

        let messages = poll_messages(&buffer, 2).await;
        let handle = source.handle();
        for message in &messages {
            handle.ack(message.id().clone()).unwrap();
        }

        // The final flush on shutdown must checkpoint the acked offsets.
        source.shutdown().await;
        let committed = factory.committed_state(&id).unwrap();
        assert_eq!(committed.offset_for(&partition()), Some(2));
    }

    #[tokio::test]
    async fn test_failed_message_is_re_emitted() {
        let factory = InMemoryConsumerFactory::new(MessageLog::new());
        factory.log().append(&partition(), number_payload(7));

        let buffer = Arc::new(FairBuffer::new(16));
        let id = VirtualSourceId::new("retrying");
        let source = spawn_source(
            &factory,
            &id,
            buffer.clone(),
            Arc::new(FilterChain::new()),
            immediate_retry(),
            ConsumerState::default(),
            None,
        )
        .await;

        let first = poll_messages(&buffer, 1).await.remove(0);
        let handle = source.handle();
        handle.fail(first.id().clone()).unwrap();

        // Same identity and payload come around again.
        let second = poll_messages(&buffer, 1).await.remove(0);
        assert_eq!(second.id(), first.id());
        assert_eq!(second.payload(), first.payload());

        handle.ack(second.id().clone()).unwrap();
        source.shutdown().await;
    }

    #[tokio::test]
    async fn test_retry_exhaustion_resolves_as_ack() {
        let factory = InMemoryConsumerFactory::new(MessageLog::new());
        factory.log().append(&partition(), number_payload(7));

        let retry_manager = Box::new(DefaultRetryManager::new(RetryConfig {
            retry_limit: 1,
            initial_retry_delay: Duration::ZERO,
            retry_delay_multiplier: 1.0,
            retry_delay_max: Duration::ZERO,
        }));

        let buffer = Arc::new(FairBuffer::new(16));
        let id = VirtualSourceId::new("exhausting");
        let source = spawn_source(
            &factory,
            &id,
            buffer.clone(),
            Arc::new(FilterChain::new()),
            retry_manager,
            ConsumerState::default(),
            None,
        )
        .await;

        let first = poll_messages(&buffer, 1).await.remove(0);
        let handle = source.handle();

        // First fail is within budget and replays the message.
        handle.fail(first.id().clone()).unwrap();
        let second = poll_messages(&buffer, 1).await.remove(0);
        assert_eq!(second.id(), first.id());

        // Second fail exhausts the budget: resolved as acked, never replayed.
        handle.fail(second.id().clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(buffer.poll().is_none());

        // Exhaustion followed the ack path, so the offset is committable.
        source.shutdown().await;
        let committed = factory.committed_state(&id).unwrap();
        assert_eq!(committed.offset_for(&partition()), Some(1));
    }

    #[tokio::test]
    async fn test_commit_never_passes_a_message_awaiting_retry() {
        let factory = InMemoryConsumerFactory::new(MessageLog::new());
        for n in 0..2 {
            factory.log().append(&partition(), number_payload(n));
        }

        // Long delay so the failed message stays unresolved for the whole
        // test.
        let retry_manager = Box::new(DefaultRetryManager::new(RetryConfig {
            retry_limit: -1,
            initial_retry_delay: Duration::from_secs(3600),
            retry_delay_multiplier: 1.0,
            retry_delay_max: Duration::from_secs(3600),
        }));

        let buffer = Arc::new(FairBuffer::new(16));
        let id = VirtualSourceId::new("holding");
        let source = spawn_source(
            &factory,
            &id,
            buffer.clone(),
            Arc::new(FilterChain::new()),
            retry_manager,
            ConsumerState::default(),
            None,
        )
        .await;

        let messages = poll_messages(&buffer, 2).await;
        let handle = source.handle();

        // Offset 0 fails and awaits retry while offset 1 is acked. The
        // commit must hold at the unresolved offset, not jump past it.
        handle.fail(messages[0].id().clone()).unwrap();
        handle.ack(messages[1].id().clone()).unwrap();

        source.shutdown().await;
        let committed = factory.committed_state(&id).unwrap();
        assert_eq!(committed.offset_for(&partition()), Some(0));
    }

    #[tokio::test]
    async fn test_bounded_window_stops_autonomously() {
        let factory = InMemoryConsumerFactory::new(MessageLog::new());
        for n in 0..5 {
            factory.log().append(&partition(), number_payload(n));
        }

        let ending = ConsumerState::builder().with_partition(partition(), 2).build();
        let buffer = Arc::new(FairBuffer::new(16));
        let id = VirtualSourceId::new("bounded");
        let source = spawn_source(
            &factory,
            &id,
            buffer.clone(),
            Arc::new(FilterChain::new()),
            Box::new(NeverRetryManager),
            ConsumerState::default(),
            Some(ending),
        )
        .await;

        let messages = poll_messages(&buffer, 2).await;
        let offsets: Vec<i64> = messages.iter().map(|m| m.id().offset()).collect();
        assert_eq!(offsets, vec![0, 1]);

        // No record at or past the ending offset is ever emitted, and the
        // source reaches Closed without an external stop.
        let handle = source.handle();
        wait_until(|| handle.is_closed()).await;
        assert!(buffer.poll().is_none());

        source.shutdown().await;
    }

    #[tokio::test]
    async fn test_request_stop_is_idempotent_and_terminal() {
        let factory = InMemoryConsumerFactory::new(MessageLog::new());
        let buffer = Arc::new(FairBuffer::new(16));
        let id = VirtualSourceId::new("stopping");
        let source = spawn_source(
            &factory,
            &id,
            buffer.clone(),
            Arc::new(FilterChain::new()),
            Box::new(NeverRetryManager),
            ConsumerState::default(),
            None,
        )
        .await;

        let handle = source.handle();
        handle.request_stop();
        handle.request_stop();
        assert!(handle.is_stop_requested());

        wait_until(|| handle.is_closed()).await;
        assert_eq!(handle.lifecycle(), Lifecycle::Closed);

        source.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_reports_lag_against_ending_state() {
        let factory = InMemoryConsumerFactory::new(MessageLog::new());
        for n in 0..4 {
            factory.log().append(&partition(), number_payload(n));
        }

        let buffer = Arc::new(FairBuffer::new(16));
        let id = VirtualSourceId::new("lagging");
        let source = spawn_source(
            &factory,
            &id,
            buffer.clone(),
            Arc::new(FilterChain::new()),
            Box::new(NeverRetryManager),
            ConsumerState::default(),
            None,
        )
        .await;

        let handle = source.handle();
        wait_until(|| handle.current_state().offset_for(&partition()) == Some(4)).await;

        let mut status = handle.status();
        status.ending_state = Some(
            ConsumerState::builder().with_partition(partition(), 10).build(),
        );
        assert_eq!(status.lag(), 6);

        source.shutdown().await;
    }
}
