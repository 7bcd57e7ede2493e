//! Delivery notifications, satisfaction surveys and an
//! automated responder over a WhatsApp-style chat gateway.

pub mod api;
pub mod arbitration;
pub mod channels;
pub mod clock;
pub mod config;
pub mod conversations;
pub mod core;
pub mod dispatch;
pub mod eligibility;
pub mod error;
pub mod events;
pub mod llm;
pub mod orders;
pub mod phone;
pub mod store;
pub mod survey;

#[cfg(test)]
mod testing;
