use crate::domain::order::OrderId;
use crate::domain::payment::{
    CallbackValidation, CheckoutRequest, CheckoutSession, OperationReceipt, Page, Payment,
    PaymentOperation, Token,
};
use crate::domain::ports::PaymentProvider;
use crate::error::{ProviderError, ReconError, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

type ProviderResult<T> = std::result::Result<T, ProviderError>;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Hosted-payment provider reached over its REST API.
#[derive(Clone)]
pub struct HttpProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Deserialize)]
struct ValidationResponse {
    valid: bool,
}

impl HttpProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("payrecon/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| ReconError::Config(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self::with_client(client, base_url, api_key))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/payment{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> ProviderResult<T> {
        let response = request
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::new(Some(status.as_u16()), error_message(&body)));
        }
        response.json::<T>().await.map_err(transport_error)
    }
}

fn transport_error(err: reqwest::Error) -> ProviderError {
    ProviderError::new(err.status().map(|s| s.as_u16()), err.to_string())
}

/// Pulls the human-readable message out of a provider error body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            ["errorMessage", "message"]
                .iter()
                .find_map(|field| value.get(*field).and_then(|m| m.as_str()).map(str::to_string))
        })
        .unwrap_or_else(|| body.to_string())
}

#[async_trait]
impl PaymentProvider for HttpProvider {
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> ProviderResult<CheckoutSession> {
        debug!(order_id = %request.id, "Creating checkout session");
        self.send(self.client.post(self.url("/hc")).json(request)).await
    }

    async fn validate_callback(&self, params: &CallbackValidation) -> ProviderResult<bool> {
        let response: ValidationResponse = self
            .send(self.client.post(self.url("/hc/validate")).json(params))
            .await?;
        Ok(response.valid)
    }

    async fn get_payment(&self, id: &OrderId) -> ProviderResult<Payment> {
        self.send(self.client.get(self.url(&format!("/{}", id)))).await
    }

    async fn list_payments(
        &self,
        since: i64,
        next_token: Option<&str>,
    ) -> ProviderResult<Page<Payment>> {
        let mut query = vec![
            ("sortBy", "updatedAt".to_string()),
            ("sortOrder", "ascending".to_string()),
            ("startAt", since.to_string()),
        ];
        if let Some(token) = next_token {
            query.push(("nextToken", token.to_string()));
        }
        self.send(self.client.get(self.url("")).query(&query)).await
    }

    async fn get_payment_operation(
        &self,
        id: &OrderId,
        tx_id: &str,
    ) -> ProviderResult<PaymentOperation> {
        self.send(
            self.client
                .get(self.url(&format!("/{}/operation/{}", id, tx_id))),
        )
        .await
    }

    async fn list_payment_operations(
        &self,
        id: &OrderId,
        next_token: Option<&str>,
    ) -> ProviderResult<Page<PaymentOperation>> {
        let mut request = self.client.get(self.url(&format!("/{}/operation", id)));
        if let Some(token) = next_token {
            request = request.query(&[("nextToken", token)]);
        }
        self.send(request).await
    }

    async fn list_tokens(&self) -> ProviderResult<Vec<Token>> {
        self.send(self.client.get(self.url("/hc/tokens"))).await
    }

    async fn settle(
        &self,
        id: &OrderId,
        chain: &str,
        token: &str,
        amount: Decimal,
    ) -> ProviderResult<OperationReceipt> {
        let body = json!({ "amount": amount.to_string(), "token": token });
        self.send(
            self.client
                .post(self.url(&format!("/{}/settle", id)))
                .query(&[("chain", chain)])
                .json(&body),
        )
        .await
    }

    async fn refund(&self, id: &OrderId, chain: &str, token: &str) -> ProviderResult<OperationReceipt> {
        let body = json!({ "token": token });
        self.send(
            self.client
                .post(self.url(&format!("/{}/refund", id)))
                .query(&[("chain", chain)])
                .json(&body),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_trims_trailing_slash() {
        let provider = HttpProvider::with_client(Client::new(), "https://api.example.test/", "key");
        assert_eq!(
            provider.url("/42/operation/tx-1"),
            "https://api.example.test/v1/payment/42/operation/tx-1"
        );
        assert_eq!(provider.url(""), "https://api.example.test/v1/payment");
    }

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(
            error_message(r#"{"errorCode":"ValidationError","errorMessage":"invalid chain"}"#),
            "invalid chain"
        );
        assert_eq!(error_message(r#"{"message":"Forbidden"}"#), "Forbidden");
        assert_eq!(error_message("Bad Gateway"), "Bad Gateway");
    }
}
