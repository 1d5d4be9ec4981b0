//! # lifeline-engine
//!
//! Conversation state machine and escalation engine.
//!
//! - [`CrisisEngine`]: public API (ingest, claim, release, subscribe, end)
//! - `actor`: one task per conversation, serializing every command
//! - [`state`]: pure AUTOMATED / ESCALATED_PENDING / MONITORED transitions
//! - [`dispatcher`]: monitor sessions and conversations awaiting a monitor
//! - [`fanout`]: per-subscriber ordered delivery with retry
//! - [`store`]: persistence edge

#![deny(unsafe_code)]

mod actor;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod metrics;
pub mod state;
pub mod store;

pub use actor::{Author, ConversationView, SubscriberRole};
pub use dispatcher::{Dispatcher, MonitorSession};
pub use engine::{CrisisEngine, EngineConfig, EngineHealth};
pub use error::{ClaimOutcome, EngineError};
pub use fanout::{DeliveryError, EventSink, HubNotice, RetryPolicy, SubscriberHub};
pub use store::{ConversationStore, MemoryStore, StoreError};
