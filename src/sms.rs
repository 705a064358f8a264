//! SMS capability and the ClickSend-backed implementation.

use crate::config;
use crate::email::ProductCard;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use tracing::debug;

const CLICKSEND_API_BASE: &str = "https://rest.clicksend.com/";

/// Outbound SMS capability.
#[async_trait]
pub trait SmsSender: Send + Sync {
    async fn send(&self, to: &str, body: &str) -> Result<()>;
}

/// ClickSend-backed sender. Like the mailer, missing credentials surface as
/// a per-send configuration error rather than a startup failure.
#[derive(Clone)]
pub struct ClickSendSms {
    http: Client,
    base_url: Url,
    username: String,
    api_key: String,
}

impl fmt::Debug for ClickSendSms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClickSendSms")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct ClickSendResponse {
    response_code: String,
    #[serde(default)]
    response_msg: String,
}

impl ClickSendSms {
    pub fn from_config(cfg: &config::Sms) -> Self {
        let base_url = Url::parse(CLICKSEND_API_BASE).expect("valid default ClickSend URL");
        Self::with_base_url(cfg, base_url)
    }

    pub fn with_base_url(cfg: &config::Sms, base_url: Url) -> Self {
        let http = Client::builder()
            .user_agent("dropwatch/0.1")
            .build()
            .expect("reqwest client");
        // ClickSend allows the api key to double as the username.
        let username = if cfg.username.trim().is_empty() {
            cfg.api_key.clone()
        } else {
            cfg.username.clone()
        };
        Self {
            http,
            base_url,
            username,
            api_key: cfg.api_key.clone(),
        }
    }

    fn basic_auth(&self) -> String {
        let raw = format!("{}:{}", self.username, self.api_key);
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(raw)
        )
    }
}

#[async_trait]
impl SmsSender for ClickSendSms {
    async fn send(&self, to: &str, body: &str) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(anyhow!(
                "SMS provider is not configured: sms.api_key is missing"
            ));
        }

        let endpoint = self
            .base_url
            .join("v3/sms/send")
            .context("invalid ClickSend base URL")?;
        debug!(%endpoint, to, "sending SMS");

        let res = self
            .http
            .post(endpoint)
            .header("Authorization", self.basic_auth())
            .json(&json!({
                "messages": [
                    { "source": "sdk", "body": body, "to": to }
                ]
            }))
            .send()
            .await
            .context("failed to reach SMS provider")?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("SMS provider error {}: {}", status, body));
        }

        let payload: ClickSendResponse =
            res.json().await.context("invalid SMS provider response")?;
        if payload.response_code != "SUCCESS" {
            return Err(anyhow!("SMS provider rejected send: {}", payload.response_msg));
        }
        Ok(())
    }
}

/// One combined SMS covering the whole batch. A single arrival includes its
/// URL; multiple arrivals become a numbered list (URLs omitted for length).
pub fn build_sms_body(products: &[ProductCard]) -> String {
    if products.len() == 1 {
        format!("New arrival: {} - {}", products[0].name, products[0].url)
    } else {
        let list = products
            .iter()
            .enumerate()
            .map(|(i, p)| format!("{}. {}", i + 1, p.name))
            .collect::<Vec<_>>()
            .join("\n");
        format!("{} new arrivals:\n{}", products.len(), list)
    }
}
