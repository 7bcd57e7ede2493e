//! Customer conversations and inbound message routing.

pub mod inbox;
pub mod model;

pub use inbox::{InboundOutcome, Inbox};
pub use model::{Conversation, Message, MessageSender};
