//! Raw session message → `ServerEvent`s.
//!
//! Precedence: a setup acknowledgement yields only `SetupAcknowledged`.
//! Otherwise every non-empty model-turn text part yields a `TextDelta`, in
//! order, followed by a `UsageReport` when usage metadata rides on the same
//! message. A message may therefore produce zero, one or several events.

use thiserror::Error;

use crate::protocol::ServerMessage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    SetupAcknowledged,
    TextDelta(String),
    UsageReport { prompt_tokens: u64, response_tokens: u64 },
}

#[derive(Debug, Error)]
#[error("malformed session message: {0}")]
pub struct MalformedEvent(#[from] serde_json::Error);

/// Decode one raw message (JSON, as text or binary frame) and route it
pub fn route(raw: &[u8]) -> Result<Vec<ServerEvent>, MalformedEvent> {
    let message: ServerMessage = serde_json::from_slice(raw)?;
    Ok(route_message(message))
}

pub fn route_message(message: ServerMessage) -> Vec<ServerEvent> {
    if message.setup_complete.is_some() {
        return vec![ServerEvent::SetupAcknowledged];
    }

    let mut events: Vec<ServerEvent> = message
        .server_content
        .and_then(|content| content.model_turn)
        .map(|turn| turn.parts)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|part| part.text)
        .filter(|text| !text.is_empty())
        .map(ServerEvent::TextDelta)
        .collect();

    if let Some(usage) = message.usage_metadata {
        events.push(ServerEvent::UsageReport {
            prompt_tokens: usage.prompt_token_count.unwrap_or(0),
            response_tokens: usage.response_token_count.unwrap_or(0),
        });
    }

    events
}
