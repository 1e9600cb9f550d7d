use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::config::SessionConfig;
use crate::encode::EncodedPayload;

/// Messages sent over the live session (JSON text frames)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    /// First message on every connection
    Setup(Setup),
    /// Streamed user input: a video frame or a piece of text
    RealtimeInput(RealtimeInput),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub temperature: f32,
    pub top_p: f32,
    pub max_output_tokens: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<Blob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Inline binary data, base64 encoded
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

impl ClientMessage {
    pub fn setup(config: &SessionConfig) -> Self {
        let model = if config.model.starts_with("models/") {
            config.model.clone()
        } else {
            format!("models/{}", config.model)
        };
        Self::Setup(Setup {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec!["TEXT".to_string()],
                temperature: config.generation.temperature,
                top_p: config.generation.top_p,
                max_output_tokens: config.generation.max_output_tokens,
            },
            system_instruction: Content {
                parts: vec![Part {
                    text: Some(config.effective_system_instruction().to_string()),
                }],
            },
        })
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::RealtimeInput(RealtimeInput {
            text: Some(text.into()),
            ..RealtimeInput::default()
        })
    }

    pub fn frame(payload: &EncodedPayload) -> Self {
        Self::RealtimeInput(RealtimeInput {
            video: Some(Blob {
                mime_type: payload.mime_type.to_string(),
                data: base64::engine::general_purpose::STANDARD.encode(&payload.data),
            }),
            ..RealtimeInput::default()
        })
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// One message received on the live session. Every field is optional; which
/// ones are present decides the events it turns into.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: Option<u64>,
    #[serde(default, alias = "candidatesTokenCount")]
    pub response_token_count: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_setup_message_shape() {
        let config = SessionConfig {
            model: "gemini-test".to_string(),
            ..SessionConfig::default()
        };
        let value: serde_json::Value =
            serde_json::from_str(&ClientMessage::setup(&config).to_json().unwrap()).unwrap();

        let setup = &value["setup"];
        assert_eq!(setup["model"], "models/gemini-test");
        assert_eq!(setup["generationConfig"]["responseModalities"], json!(["TEXT"]));
        assert_eq!(setup["generationConfig"]["maxOutputTokens"], 512);
        assert!((setup["generationConfig"]["topP"].as_f64().unwrap() - 0.8).abs() < 1e-6);
        assert_eq!(
            setup["systemInstruction"]["parts"][0]["text"],
            config.system_instruction.as_str()
        );
    }

    #[test]
    fn test_frame_message_shape() {
        let payload = EncodedPayload {
            data: vec![0xFF, 0xD8, 0xFF, 0xD9],
            mime_type: "image/jpeg",
            seq: 1,
        };
        let value: serde_json::Value =
            serde_json::from_str(&ClientMessage::frame(&payload).to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"realtimeInput": {"video": {"mimeType": "image/jpeg", "data": "/9j/2Q=="}}})
        );

        let text: serde_json::Value =
            serde_json::from_str(&ClientMessage::text("hello").to_json().unwrap()).unwrap();
        assert_eq!(text, json!({"realtimeInput": {"text": "hello"}}));
    }

    #[test]
    fn test_usage_accepts_candidates_alias() {
        let msg: ServerMessage = serde_json::from_value(json!({
            "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 3}
        }))
        .unwrap();
        let usage = msg.usage_metadata.unwrap();
        assert_eq!(usage.prompt_token_count, Some(10));
        assert_eq!(usage.response_token_count, Some(3));
    }
}
