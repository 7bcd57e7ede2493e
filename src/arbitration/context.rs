//! Context assembly for the automated responder.

use std::fmt::Write as _;

use crate::conversations::model::{Conversation, Message, MessageSender};
use crate::dispatch::model::SendRecord;
use crate::error::DatabaseError;
use crate::llm::{ChatMessage, CompletionRequest};
use crate::store::Database;
use crate::survey::SatisfactionSurvey;

/// Messages of chat history given to the model.
pub const HISTORY_LIMIT: usize = 20;
/// Most recent send records included as order facts.
pub const RECORD_LIMIT: usize = 10;
/// Most recent surveys included.
pub const SURVEY_LIMIT: usize = 5;

const MAX_REPLY_TOKENS: u32 = 400;
const TEMPERATURE: f32 = 0.3;

/// Everything the model sees about one customer.
#[derive(Debug, Clone)]
pub struct CustomerContext {
    pub conversation: Conversation,
    /// Chronological.
    pub messages: Vec<Message>,
    /// Newest first.
    pub records: Vec<SendRecord>,
    /// Newest first.
    pub surveys: Vec<SatisfactionSurvey>,
}

impl CustomerContext {
    pub async fn gather(store: &dyn Database, conversation: Conversation) -> Result<Self, DatabaseError> {
        let messages = store.list_recent_messages(conversation.id, HISTORY_LIMIT).await?;
        let records = store
            .list_send_records_for_phone(&conversation.phone, RECORD_LIMIT)
            .await?;
        let surveys = store
            .list_surveys_for_phone(&conversation.phone, SURVEY_LIMIT)
            .await?;
        Ok(Self {
            conversation,
            messages,
            records,
            surveys,
        })
    }

    /// Build the completion request: system prompt plus facts, then history.
    ///
    /// Operator messages go in as assistant turns tagged `[atendente]` so the
    /// model sees what a human already told the customer.
    pub fn to_request(&self, system_prompt: &str) -> CompletionRequest {
        let mut messages = Vec::with_capacity(self.messages.len() + 1);
        messages.push(ChatMessage::system(format!(
            "{system_prompt}\n\n{}",
            build_context_block(&self.conversation, &self.records, &self.surveys)
        )));
        for message in &self.messages {
            messages.push(match message.sender {
                MessageSender::Customer => ChatMessage::user(&message.text),
                MessageSender::Automation => ChatMessage::assistant(&message.text),
                MessageSender::Operator => ChatMessage::assistant(format!("[atendente] {}", message.text)),
            });
        }
        CompletionRequest::new(messages)
            .with_max_tokens(MAX_REPLY_TOKENS)
            .with_temperature(TEMPERATURE)
    }
}

/// Render the customer facts block.
pub fn build_context_block(
    conversation: &Conversation,
    records: &[SendRecord],
    surveys: &[SatisfactionSurvey],
) -> String {
    let mut out = String::from("## Cliente\n");
    let _ = writeln!(out, "Telefone: {}", conversation.phone);
    if let Some(name) = &conversation.display_name {
        let _ = writeln!(out, "Nome: {name}");
    }

    out.push_str("\n## Pedidos notificados\n");
    if records.is_empty() {
        out.push_str("Nenhum envio registrado.\n");
    }
    for record in records {
        let _ = write!(
            out,
            "- {} ({}): envio {}",
            record.created_at.format("%d/%m/%Y %H:%M"),
            record.path,
            record.status
        );
        if let Some(order) = &record.order_snapshot {
            let _ = write!(out, ", pedido {}", order.order_number);
            if let Some(driver) = &order.driver_name {
                let _ = write!(out, ", motorista {driver}");
            }
            if let Some(date) = order.delivery_date {
                let _ = write!(out, ", entrega {}", date.format("%d/%m/%Y"));
            }
            if let Some(address) = &order.address {
                let _ = write!(out, ", endereço {address}");
            }
            if let Some(cargo) = &order.cargo {
                let _ = write!(out, ", carga {cargo}");
            }
        }
        out.push('\n');
    }

    out.push_str("\n## Pesquisas de satisfação\n");
    if surveys.is_empty() {
        out.push_str("Nenhuma pesquisa.\n");
    }
    for survey in surveys {
        let _ = write!(
            out,
            "- {}: {}",
            survey.created_at.format("%d/%m/%Y"),
            survey.status
        );
        if let Some(rating) = survey.rating {
            let _ = write!(out, ", nota {rating}");
        }
        if let Some(feedback) = &survey.feedback {
            let _ = write!(out, ", comentário \"{feedback}\"");
        }
        out.push('\n');
    }
    out
}
