//! Kafka sideliner service.
//!
//! Multiplexes a firehose Kafka consumer with dynamically spawned sideline
//! consumers. A sideline request installs a filter step that diverts matching
//! messages away from the firehose; stopping the request spawns nothing new
//! but bounds the sideline's window so it drains and closes on its own.
//!
//! ## Error logging (anyhow)
//!
//! When logging `anyhow::Error` or other error types that implement `std::error::Error` with
//! a cause chain, use formats that include the full chain so root causes are visible in logs:
//!
//! - **Inline format:** `{e:#}` — full chain on one line (`outer: middle: root cause`).
//! - **Structured field:** `error = ?e` — full chain with `Caused by:` sections (Debug).
//!
//! Avoid `{}` / `%e` (Display) for errors — they only show the top-level message and hide the chain.
//!
//! When constructing errors, use `.context()` / `.with_context()` so the original error remains
//! the source. Avoid `anyhow!("...{e}")` — that formats the error into a string and drops the chain.

pub mod config;
pub mod consumer;
pub mod consumer_state;
pub mod coordinator;
pub mod fair_buffer;
pub mod filter;
pub mod kafka;
pub mod metrics_const;
pub mod offset_tracker;
pub mod retry;
pub mod service;
pub mod test_utils;
pub mod types;
pub mod virtual_source;

// Re-export commonly used types for convenience
pub use consumer::{Consumer, ConsumerFactory, Record};
pub use consumer_state::{ConsumerState, ConsumerStateBuilder};
pub use coordinator::{Coordinator, CoordinatorConfig};
pub use filter::{FilterChain, FilterChainStep, NegatingFilterChainStep};
pub use types::{Message, MessageId, Partition, SidelineRequest, SidelineRequestId, VirtualSourceId};
