pub mod conversation;
pub mod errors;
pub mod events;
pub mod ids;
pub mod judge;
pub mod messages;
pub mod risk;

pub use conversation::{Conversation, ConversationMode};
pub use errors::ClassifierError;
pub use events::{ChatEvent, Envelope, RiskSummary};
pub use ids::{ConnectionId, ConversationId, MessageId, MonitorId};
pub use judge::{ContextJudge, JudgeVerdict};
pub use messages::{Message, SenderRole};
pub use risk::{RiskAssessment, RiskLevel, Signal, SignalSource};
