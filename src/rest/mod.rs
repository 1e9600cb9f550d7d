//! Streaming text generation over HTTP (server-sent events).

use futures_util::{Stream, StreamExt};
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::sse;

pub const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Error)]
pub enum RestError {
    #[error("request failed: {0}")]
    Http(#[source] reqwest::Error),

    #[error("API returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// The request URL carries the API key, so it never makes it into an error
impl From<reqwest::Error> for RestError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.without_url())
    }
}

pub fn stream_url(model: &str, api_key: &str) -> String {
    let model = model.strip_prefix("models/").unwrap_or(model);
    format!(
        "{}/models/{}:streamGenerateContent?alt=sse&key={}",
        API_BASE, model, api_key
    )
}

pub fn request_body(prompt: &str) -> serde_json::Value {
    json!({
        "contents": [
            { "role": "user", "parts": [{ "text": prompt }] }
        ]
    })
}

/// Send the prompt and return the response as a lazy stream of text chunks.
/// A non-2xx status is turned into `RestError::Status` with the body text.
pub async fn stream_generate_content(
    client: &reqwest::Client,
    api_key: &str,
    model: &str,
    prompt: &str,
) -> Result<impl Stream<Item = Result<String, reqwest::Error>>, RestError> {
    debug!("streaming text from {}", model);
    let response = client
        .post(stream_url(model, api_key))
        .json(&request_body(prompt))
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(RestError::Status {
            status: status.as_u16(),
            body,
        });
    }

    let body = response.bytes_stream().map(|chunk| chunk.map_err(reqwest::Error::without_url));
    Ok(sse::text_deltas(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body() {
        assert_eq!(
            request_body("hello"),
            json!({"contents": [{"role": "user", "parts": [{"text": "hello"}]}]})
        );
    }

    #[test]
    fn test_stream_url() {
        let expected = "https://generativelanguage.googleapis.com/v1beta/models/gemini-x:streamGenerateContent?alt=sse&key=k";
        assert_eq!(stream_url("gemini-x", "k"), expected);
        assert_eq!(stream_url("models/gemini-x", "k"), expected);
    }

    #[tokio::test]
    async fn test_transport_error_hides_api_key() {
        // Nothing listens on this port once the listener is dropped
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = reqwest::Client::new();
        let err = client
            .post(format!("http://{}/v1beta/models/m:streamGenerateContent?alt=sse&key=SECRETKEY123", addr))
            .send()
            .await
            .map_err(RestError::from)
            .unwrap_err();

        assert!(matches!(err, RestError::Http(_)));
        assert!(!err.to_string().contains("SECRETKEY123"), "{}", err);
        assert!(!format!("{:?}", err).contains("SECRETKEY123"));
    }

    #[test]
    fn test_status_error_message() {
        let err = RestError::Status {
            status: 403,
            body: "forbidden".to_string(),
        };
        assert_eq!(err.to_string(), "API returned 403: forbidden");
    }
}
