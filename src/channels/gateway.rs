//! WhatsApp-style REST gateway — `POST {base}/message/sendText/{instance}`.

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};

use crate::channels::OutboundSender;
use crate::config::GatewayConfig;
use crate::error::ChannelError;

const GATEWAY_NAME: &str = "gateway";

pub struct HttpGateway {
    base_url: String,
    instance: String,
    api_key: SecretString,
    client: reqwest::Client,
}

impl HttpGateway {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            instance: config.instance.clone(),
            api_key: config.api_key.clone(),
            client: reqwest::Client::new(),
        }
    }

    fn send_url(&self) -> String {
        format!("{}/message/sendText/{}", self.base_url, self.instance)
    }
}

/// Map a non-success gateway status onto a channel error.
fn status_error(status: StatusCode, body: String) -> ChannelError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ChannelError::RateLimited {
            name: GATEWAY_NAME.into(),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ChannelError::AuthFailed {
            name: GATEWAY_NAME.into(),
            reason: format!("{status}: {body}"),
        },
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => {
            ChannelError::InvalidRecipient(format!("{status}: {body}"))
        }
        _ => ChannelError::SendFailed {
            name: GATEWAY_NAME.into(),
            reason: format!("{status}: {body}"),
        },
    }
}

#[async_trait]
impl OutboundSender for HttpGateway {
    fn name(&self) -> &str {
        GATEWAY_NAME
    }

    async fn send(&self, phone: &str, text: &str) -> Result<(), ChannelError> {
        let body = serde_json::json!({
            "number": phone,
            "text": text,
        });

        let resp = self
            .client
            .post(self.send_url())
            .header("apikey", self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::Http(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            tracing::debug!(%phone, "Gateway accepted message");
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(status_error(status, body))
    }
}
