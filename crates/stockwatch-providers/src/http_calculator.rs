//! HTTP/JSON calculation client.
//!
//! `POST {endpoint}` with `{"items": [...]}` and expects a `CalculationResult`
//! body (camelCase). Failures are classified for the retry policy:
//! timeouts, connection problems, 429 and 5xx are transient; other 4xx
//! replies and undecodable bodies are terminal.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use stockwatch_core::config::CalculatorConfig;
use stockwatch_core::error::{Result, StockWatchError};
use stockwatch_core::traits::Calculator;
use stockwatch_core::types::{CalculationResult, LineItem};

/// Calculation collaborator reached over HTTP.
pub struct HttpCalculator {
    endpoint: String,
    api_key: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpCalculator {
    pub fn new(config: &CalculatorConfig) -> Self {
        Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            timeout: config.timeout(),
            client: reqwest::Client::new(),
        }
    }

    fn apply_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_key.is_empty() {
            req
        } else {
            req.header("Authorization", format!("Bearer {}", self.api_key))
        }
    }
}

#[async_trait]
impl Calculator for HttpCalculator {
    fn name(&self) -> &str {
        "http"
    }

    async fn evaluate(&self, items: &[LineItem]) -> Result<CalculationResult> {
        let req = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "items": items }))
            .timeout(self.timeout);

        let resp = self
            .apply_auth(req)
            .send()
            .await
            .map_err(|e| classify_request_error(&e))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| classify_request_error(&e))?;

        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &body));
        }

        let result = parse_result(&body)?;
        tracing::debug!(
            "🧮 Calculation for {} item(s): {} in shortage, critical_error={}",
            items.len(),
            result.summary.items_in_shortage,
            result.has_critical_error
        );
        Ok(result)
    }
}

fn classify_request_error(e: &reqwest::Error) -> StockWatchError {
    if e.is_timeout() {
        StockWatchError::Timeout(format!("calculation service: {e}"))
    } else if e.is_connect() || e.is_request() || e.is_body() {
        StockWatchError::TransientDependency(format!("calculation service unreachable: {e}"))
    } else {
        StockWatchError::TerminalDependency(format!("calculation request failed: {e}"))
    }
}

/// Non-2xx reply → error class.
fn classify_status(status: u16, body: &str) -> StockWatchError {
    let snippet: String = body.chars().take(200).collect();
    match status {
        429 | 500..=599 => {
            StockWatchError::TransientDependency(format!("calculation service {status}: {snippet}"))
        }
        _ => StockWatchError::TerminalDependency(format!("calculation service {status}: {snippet}")),
    }
}

fn parse_result(body: &str) -> Result<CalculationResult> {
    serde_json::from_str(body).map_err(|e| {
        StockWatchError::TerminalDependency(format!("malformed calculation result: {e}"))
    })
}
