//! Outbound messaging to customers.

pub mod gateway;
pub mod serialized;

pub use gateway::HttpGateway;
pub use serialized::SerializedSender;

use async_trait::async_trait;

use crate::error::ChannelError;

/// Something that can deliver a text message to a phone.
///
/// Implementations receive the gateway-facing number (country code included)
/// and report failures as [`ChannelError`]; callers record the failure and
/// never retry.
#[async_trait]
pub trait OutboundSender: Send + Sync {
    /// Sender name for logs.
    fn name(&self) -> &str;

    async fn send(&self, phone: &str, text: &str) -> Result<(), ChannelError>;
}
