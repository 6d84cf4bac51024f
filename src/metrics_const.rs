//! Metric name constants for the sideliner engine.

/// Messages emitted into the fair buffer, labeled by source
pub const MESSAGES_EMITTED: &str = "sideliner_messages_emitted_total";

/// Messages excluded by a source's filter chain, labeled by source
pub const MESSAGES_FILTERED: &str = "sideliner_messages_filtered_total";

/// Messages re-emitted from the retry schedule, labeled by source
pub const MESSAGES_RETRIED: &str = "sideliner_messages_retried_total";

/// Messages resolved as acked after exhausting their retry budget
pub const RETRIES_EXHAUSTED: &str = "sideliner_retries_exhausted_total";

/// Acks and fails routed to the owning source, labeled by outcome
pub const MESSAGES_COMPLETED: &str = "sideliner_messages_completed_total";

/// Acks/fails arriving for a source that has already been torn down
pub const UNKNOWN_SOURCE_COMPLETIONS: &str = "sideliner_unknown_source_completions_total";

/// Currently registered fair-buffer source queues
pub const BUFFER_REGISTERED_SOURCES: &str = "sideliner_buffer_registered_sources";

/// Messages discarded when a source queue was deregistered
pub const BUFFER_MESSAGES_DISCARDED: &str = "sideliner_buffer_messages_discarded_total";

/// Virtual sources currently owned by the coordinator
pub const ACTIVE_VIRTUAL_SOURCES: &str = "sideliner_active_virtual_sources";

/// Sideline windows started
pub const SIDELINES_STARTED: &str = "sideliner_sidelines_started_total";

/// Sideline windows stopped
pub const SIDELINES_STOPPED: &str = "sideliner_sidelines_stopped_total";

/// Closed virtual sources reaped by the coordinator
pub const SOURCES_REAPED: &str = "sideliner_sources_reaped_total";
