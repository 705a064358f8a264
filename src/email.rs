//! Email capability and the Resend-backed implementation.

use crate::config;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Serialize;
use std::fmt;
use tracing::debug;

const RESEND_API_BASE: &str = "https://api.resend.com/";

/// One product entry inside a new-arrival message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductCard {
    pub name: String,
    pub url: String,
    pub image_url: Option<String>,
}

/// Outbound email capability. Implementations send one combined message
/// covering all products in the batch.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, to: &str, products: &[ProductCard]) -> Result<()>;
}

/// Resend-backed mailer. Missing credentials are not a constructor error:
/// the send itself fails with a configuration error, which the fan-out
/// isolates per recipient.
#[derive(Clone)]
pub struct ResendMailer {
    http: Client,
    base_url: Url,
    api_key: String,
    from: String,
}

impl fmt::Debug for ResendMailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResendMailer")
            .field("base_url", &self.base_url)
            .field("from", &self.from)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct SendEmailRequest<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    text: &'a str,
    html: &'a str,
}

impl ResendMailer {
    pub fn from_config(cfg: &config::Email) -> Self {
        let base_url = Url::parse(RESEND_API_BASE).expect("valid default Resend URL");
        Self::with_base_url(cfg, base_url)
    }

    pub fn with_base_url(cfg: &config::Email, base_url: Url) -> Self {
        let http = Client::builder()
            .user_agent("dropwatch/0.1")
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            api_key: cfg.api_key.clone(),
            from: cfg.from.clone(),
        }
    }

    fn ensure_configured(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(anyhow!("email provider is not configured: email.api_key is missing"));
        }
        if self.from.trim().is_empty() {
            return Err(anyhow!("email provider is not configured: email.from is missing"));
        }
        Ok(())
    }
}

#[async_trait]
impl EmailSender for ResendMailer {
    async fn send(&self, to: &str, products: &[ProductCard]) -> Result<()> {
        if products.is_empty() {
            return Ok(());
        }
        self.ensure_configured()?;

        let subject = build_subject(products);
        let text = build_text_body(products);
        let html = build_html_body(products);

        let endpoint = self
            .base_url
            .join("emails")
            .context("invalid Resend base URL")?;
        debug!(%endpoint, to, products = products.len(), "sending new-arrival email");

        let res = self
            .http
            .post(endpoint)
            .bearer_auth(&self.api_key)
            .json(&SendEmailRequest {
                from: &self.from,
                to,
                subject: &subject,
                text: &text,
                html: &html,
            })
            .send()
            .await
            .context("failed to reach email provider")?;

        if res.status() == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("received 429 from email provider: {}", body));
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("email provider error {}: {}", status, body));
        }
        Ok(())
    }
}

pub fn build_subject(products: &[ProductCard]) -> String {
    if products.len() == 1 {
        format!("New arrival alert: {}", products[0].name)
    } else {
        format!("{} new arrivals just dropped!", products.len())
    }
}

pub fn build_text_body(products: &[ProductCard]) -> String {
    if products.len() == 1 {
        let p = &products[0];
        format!(
            "A new arrival just dropped!\n\n{} has just been added to the store.\n\nGrab it now: {}\n",
            p.name, p.url
        )
    } else {
        let list = products
            .iter()
            .enumerate()
            .map(|(i, p)| format!("{}. {}\n   {}\n", i + 1, p.name, p.url))
            .collect::<Vec<_>>()
            .join("\n");
        format!("{} new arrivals just dropped!\n\n{}\n", products.len(), list)
    }
}

/// Scraped names and URLs are untrusted page content; escape them before
/// they land inside markup or attribute values.
fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn build_html_body(products: &[ProductCard]) -> String {
    let cards = products
        .iter()
        .map(|p| {
            let name = escape_html(&p.name);
            let url = escape_html(&p.url);
            let image = p
                .image_url
                .as_deref()
                .map(|src| {
                    format!(
                        r#"<img src="{}" alt="{}" style="max-width: 200px; border-radius: 8px; display: block; margin-bottom: 16px;" />"#,
                        escape_html(src), name
                    )
                })
                .unwrap_or_default();
            format!(
                r#"<div style="margin-bottom: 32px;">{image}<p style="margin: 0 0 8px;"><strong>{name}</strong></p><p style="margin: 0;"><a href="{url}">View product</a></p></div>"#
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let intro = if products.len() == 1 {
        "A brand new arrival has just been added to the store.".to_string()
    } else {
        format!(
            "{} brand new arrivals have just been added to the store.",
            products.len()
        )
    };

    format!(
        r#"<div style="font-family: ui-sans-serif, system-ui; max-width: 600px;"><h2 style="margin: 0 0 8px;">New arrival alert!</h2><p style="margin: 0 0 24px;">{intro}</p>{cards}<p style="margin: 32px 0 0; font-size: 12px; color: #9ca3af;">You received this email because you subscribed to new arrival alerts.</p></div>"#
    )
}
