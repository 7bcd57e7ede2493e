//! Order-data provider — read-only snapshot of orders by date range.

use async_trait::async_trait;
use chrono::NaiveDate;
use secrecy::{ExposeSecret, SecretString};

use super::OrderRecord;
use crate::error::ChannelError;

/// Read-only access to the order/cargo snapshot.
#[async_trait]
pub trait OrderSource: Send + Sync {
    /// Orders with a delivery date in `[from, to]`.
    async fn orders_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<OrderRecord>, ChannelError>;
}

/// JSON-over-HTTP order source: `GET {base}/orders?from=YYYY-MM-DD&to=YYYY-MM-DD`.
pub struct HttpOrderSource {
    base_url: String,
    token: Option<SecretString>,
    client: reqwest::Client,
}

impl HttpOrderSource {
    pub fn new(base_url: impl Into<String>, token: Option<SecretString>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl OrderSource for HttpOrderSource {
    async fn orders_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<OrderRecord>, ChannelError> {
        let mut request = self
            .client
            .get(format!("{}/orders", self.base_url))
            .query(&[("from", from.to_string()), ("to", to.to_string())]);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let resp = request
            .send()
            .await
            .map_err(|e| ChannelError::Http(format!("orders request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ChannelError::Http(format!(
                "orders request returned {status}: {body}"
            )));
        }

        let records: Vec<OrderRecord> = resp
            .json()
            .await
            .map_err(|e| ChannelError::Http(format!("orders response parse failed: {e}")))?;

        tracing::info!(%from, %to, count = records.len(), "Fetched order snapshot");
        Ok(records)
    }
}
