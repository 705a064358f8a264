//! HTTP fetch layer for the monitored page: conditional requests backed by
//! the `scraper_state` validator cache, plus retry with backoff on transient
//! upstream failures.

use crate::config::Watch;
use crate::db;
use crate::model::Snapshot;
use crate::parse::PageParser;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, IF_MODIFIED_SINCE, IF_NONE_MATCH, RETRY_AFTER, USER_AGENT};
use reqwest::{Client, Response, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),
}

/// Retry/backoff knobs. Defaults match the production policy; tests shrink
/// the timeout.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            attempt_timeout: Duration::from_secs(12),
        }
    }
}

const BACKOFF_BASE_MS: u64 = 750;
const BACKOFF_CAP_MS: u64 = 30_000;

/// 429 and 5xx are plain rate-limit/server trouble; 403 is the storefront's
/// anti-bot soft block and also worth retrying.
fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::FORBIDDEN
        || status.is_server_error()
}

/// `Retry-After` is either a number of seconds or an HTTP-date.
fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let when = DateTime::parse_from_rfc2822(value.trim()).ok()?;
    let delta = when.with_timezone(&Utc) - now;
    delta.to_std().ok()
}

fn backoff_delay(attempt: u32, retry_after: Option<&str>) -> Duration {
    let mut rng = rand::thread_rng();
    if let Some(delay) = retry_after.and_then(|v| parse_retry_after(v, Utc::now())) {
        return delay + Duration::from_millis(rng.gen_range(0..250));
    }
    let exp = BACKOFF_BASE_MS
        .saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16))
        .min(BACKOFF_CAP_MS);
    Duration::from_millis(exp + rng.gen_range(0..350))
}

/// Fetch `url` with per-attempt timeout and backoff on retryable statuses,
/// transport errors and timeouts. The final response is returned as-is; the
/// caller decides what a non-2xx terminal status means.
async fn fetch_with_backoff(
    http: &Client,
    url: &str,
    headers: HeaderMap,
    options: &FetchOptions,
) -> Result<Response, FetchError> {
    let mut attempt = 1u32;
    loop {
        let request = http.get(url).headers(headers.clone()).send();
        let outcome = match tokio::time::timeout(options.attempt_timeout, request).await {
            Ok(Ok(response)) => {
                let status = response.status();
                if !is_retryable_status(status) {
                    return Ok(response);
                }
                if attempt >= options.max_attempts {
                    return Ok(response);
                }
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                Ok(retry_after)
            }
            Ok(Err(err)) => Err(FetchError::from(err)),
            Err(_) => Err(FetchError::Timeout(options.attempt_timeout)),
        };

        match outcome {
            Ok(retry_after) => {
                let delay = backoff_delay(attempt, retry_after.as_deref());
                warn!(attempt, delay_ms = delay.as_millis() as u64, "retryable status; backing off");
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                if attempt >= options.max_attempts {
                    return Err(err);
                }
                let delay = backoff_delay(attempt, None);
                warn!(attempt, error = %err, delay_ms = delay.as_millis() as u64, "attempt failed; backing off");
                tokio::time::sleep(delay).await;
            }
        }
        attempt += 1;
    }
}

fn conditional_headers(watch: &Watch, state: Option<&db::ScraperState>) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&watch.user_agent).context("invalid user agent")?,
    );
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml"),
    );
    if let Some(etag) = state.and_then(|s| s.etag.as_deref()) {
        headers.insert(
            IF_NONE_MATCH,
            HeaderValue::from_str(etag).context("invalid stored etag")?,
        );
    }
    if let Some(last_modified) = state.and_then(|s| s.last_modified.as_deref()) {
        headers.insert(
            IF_MODIFIED_SINCE,
            HeaderValue::from_str(last_modified).context("invalid stored last-modified")?,
        );
    }
    Ok(headers)
}

/// Fetch the current snapshot of the monitored page.
///
/// Performs one `scraper_state` read and at most one write (only when the
/// validators actually changed). A 304 response short-circuits with an empty,
/// `not_modified` snapshot and touches nothing.
#[instrument(skip_all)]
pub async fn fetch_snapshot(
    pool: &db::Pool,
    http: &Client,
    watch: &Watch,
    parser: &dyn PageParser,
    options: &FetchOptions,
) -> Result<Snapshot> {
    let state = db::get_scraper_state(pool, &watch.state_key).await?;
    let headers = conditional_headers(watch, state.as_ref())?;

    let response = fetch_with_backoff(http, &watch.page_url, headers, options)
        .await
        .context("failed to fetch monitored page")?;

    let fetched_at = Utc::now();
    let status = response.status();

    if status == StatusCode::NOT_MODIFIED {
        debug!("page not modified (304)");
        return Ok(Snapshot::not_modified(fetched_at));
    }
    if !status.is_success() {
        bail!("failed to fetch monitored page ({status})");
    }

    let header_str = |name: reqwest::header::HeaderName| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let next_etag = header_str(reqwest::header::ETAG)
        .or_else(|| state.as_ref().and_then(|s| s.etag.clone()));
    let next_last_modified = header_str(reqwest::header::LAST_MODIFIED)
        .or_else(|| state.as_ref().and_then(|s| s.last_modified.clone()));

    let validators_changed = next_etag != state.as_ref().and_then(|s| s.etag.clone())
        || next_last_modified != state.as_ref().and_then(|s| s.last_modified.clone());
    if validators_changed {
        db::upsert_scraper_state(
            pool,
            &watch.state_key,
            next_etag.as_deref(),
            next_last_modified.as_deref(),
            fetched_at,
        )
        .await?;
    }

    let html = response.text().await.context("failed to read page body")?;
    let products = parser.parse(&html);
    info!(products = products.len(), "parsed snapshot");

    Ok(Snapshot {
        products,
        fetched_at,
        not_modified: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::CardGridParser;
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use url::Url;

    async fn setup_pool() -> db::Pool {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn watch_for(url: &str) -> Watch {
        Watch {
            page_url: format!("{url}/new"),
            state_key: "test:/new".into(),
            max_tracked_products: 20,
            user_agent: "dropwatch-test/0.1".into(),
        }
    }

    fn parser_for(url: &str) -> CardGridParser {
        CardGridParser::new(Url::parse(&format!("{url}/new")).unwrap())
    }

    fn fast_options() -> FetchOptions {
        FetchOptions {
            max_attempts: 5,
            attempt_timeout: Duration::from_secs(5),
        }
    }

    const CARD_HTML: &str =
        r#"<a href="/heart-dragon/"><img src="/i/d.jpg" alt="Heart Dragon"></a>"#;

    #[test]
    fn retry_after_parses_seconds_and_http_date() {
        let now = Utc::now();
        assert_eq!(
            parse_retry_after("2", now),
            Some(Duration::from_secs(2))
        );
        let future = now + chrono::Duration::seconds(30);
        let parsed = parse_retry_after(&future.to_rfc2822(), now).unwrap();
        assert!(parsed <= Duration::from_secs(30));
        assert!(parsed >= Duration::from_secs(28));
        // A date in the past yields no delay.
        let past = now - chrono::Duration::seconds(30);
        assert_eq!(parse_retry_after(&past.to_rfc2822(), now), None);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let first = backoff_delay(1, None);
        assert!(first >= Duration::from_millis(750));
        assert!(first < Duration::from_millis(750 + 350));

        let capped = backoff_delay(12, None);
        assert!(capped >= Duration::from_millis(30_000));
        assert!(capped < Duration::from_millis(30_000 + 350));
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let pool = setup_pool().await;
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/new")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let watch = watch_for(&server.url());
        let parser = parser_for(&server.url());
        let err = fetch_snapshot(&pool, &Client::new(), &watch, &parser, &fast_options())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("404"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn not_modified_returns_empty_snapshot_and_writes_nothing() {
        let pool = setup_pool().await;
        let now = Utc::now();
        db::upsert_scraper_state(&pool, "test:/new", Some("\"v1\""), None, now)
            .await
            .unwrap();

        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/new")
            .match_header("if-none-match", "\"v1\"")
            .with_status(304)
            .expect(1)
            .create_async()
            .await;

        let watch = watch_for(&server.url());
        let parser = parser_for(&server.url());
        let snapshot = fetch_snapshot(&pool, &Client::new(), &watch, &parser, &fast_options())
            .await
            .unwrap();
        assert!(snapshot.not_modified);
        assert!(snapshot.products.is_empty());
        mock.assert_async().await;

        // Stored validators untouched.
        let state = db::get_scraper_state(&pool, "test:/new").await.unwrap().unwrap();
        assert_eq!(state.etag.as_deref(), Some("\"v1\""));
        assert_eq!(state.updated_at, now);
    }

    #[tokio::test]
    async fn success_persists_changed_validators_and_parses_products() {
        let pool = setup_pool().await;
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/new")
            .with_status(200)
            .with_header("etag", "\"v2\"")
            .with_header("last-modified", "Wed, 01 Jan 2025 00:00:00 GMT")
            .with_body(CARD_HTML)
            .expect(1)
            .create_async()
            .await;

        let watch = watch_for(&server.url());
        let parser = parser_for(&server.url());
        let snapshot = fetch_snapshot(&pool, &Client::new(), &watch, &parser, &fast_options())
            .await
            .unwrap();
        assert!(!snapshot.not_modified);
        assert_eq!(snapshot.products.len(), 1);
        assert_eq!(snapshot.products[0].external_id, "heart-dragon");
        mock.assert_async().await;

        let state = db::get_scraper_state(&pool, "test:/new").await.unwrap().unwrap();
        assert_eq!(state.etag.as_deref(), Some("\"v2\""));
        assert_eq!(
            state.last_modified.as_deref(),
            Some("Wed, 01 Jan 2025 00:00:00 GMT")
        );
    }

    /// Scripted responder for sequences mockito can't express: first a 429
    /// with Retry-After, then a 200 with a product card.
    async fn scripted_server(responses: Vec<String>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for response in responses {
                let (mut socket, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn rate_limit_honors_retry_after_then_succeeds() {
        let pool = setup_pool().await;
        let too_many = "HTTP/1.1 429 Too Many Requests\r\nRetry-After: 2\r\nConnection: close\r\nContent-Length: 0\r\n\r\n"
            .to_string();
        let ok = format!(
            "HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Type: text/html\r\nContent-Length: {}\r\n\r\n{}",
            CARD_HTML.len(),
            CARD_HTML
        );
        let base = scripted_server(vec![too_many, ok]).await;

        let watch = watch_for(&base);
        let parser = parser_for(&base);
        let started = Instant::now();
        let snapshot = fetch_snapshot(&pool, &Client::new(), &watch, &parser, &fast_options())
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(snapshot.products.len(), 1);
        assert_eq!(snapshot.products[0].name, "Heart Dragon");
    }
}
