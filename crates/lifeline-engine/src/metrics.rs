//! Metric names recorded by the engine.

pub const MESSAGES_INGESTED: &str = "messages_ingested";
pub const ESCALATIONS: &str = "escalations";
pub const ALERTS_BROADCAST: &str = "alerts_broadcast";
pub const ALERTS_WITHOUT_MONITOR: &str = "alerts_without_monitor";
pub const CLAIMS_WON: &str = "claims_won";
pub const CLAIMS_CONFLICTED: &str = "claims_conflicted";
pub const DELIVERIES_RETRIED: &str = "deliveries_retried";
pub const SUBSCRIBERS_DROPPED: &str = "subscribers_dropped";
pub const CLASSIFIER_UNAVAILABLE: &str = "classifier_unavailable";
pub const INVARIANT_VIOLATIONS: &str = "invariant_violations";
pub const STORE_FAILURES: &str = "store_failures";
pub const ACTIVE_CONVERSATIONS: &str = "active_conversations";
pub const CONNECTED_MONITORS: &str = "connected_monitors";
pub const ASSESSMENT_MS: &str = "assessment_ms";
