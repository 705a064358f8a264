//! Database row and view models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use chrono::{DateTime, Utc};

/// A stored product as tracked from the monitored page.
#[derive(Debug, Clone)]
pub struct ProductRow {
    pub id: i64,
    pub external_id: String,
    pub name: String,
    pub url: String,
    pub image_url: Option<String>,
    pub last_known_stock: bool,
    pub last_checked_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub notified_at: Option<DateTime<Utc>>,
}

/// Conditional-request validator cache for one monitored endpoint.
#[derive(Debug, Clone)]
pub struct ScraperState {
    pub key: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// One notification recipient with channel preferences and the team
/// subscription context needed for the SMS gate. Produced by a left join, so
/// preference and team columns are all optional.
#[derive(Debug, Clone)]
pub struct RecipientRow {
    pub user_id: i64,
    pub email: String,
    pub email_enabled: Option<bool>,
    pub sms_enabled: Option<bool>,
    pub phone_number: Option<String>,
    pub subscription_status: Option<String>,
    pub plan_name: Option<String>,
}
