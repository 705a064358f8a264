use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One product card extracted from the monitored page. Not yet persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NewProduct {
    pub external_id: String,
    pub name: String,
    pub url: String,
    pub image_url: Option<String>,
    /// Document order on the page, 0-based.
    pub position: usize,
}

/// The ordered set of products currently listed on the monitored page.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub products: Vec<NewProduct>,
    pub fetched_at: DateTime<Utc>,
    pub not_modified: bool,
}

impl Snapshot {
    pub fn not_modified(fetched_at: DateTime<Utc>) -> Self {
        Self {
            products: Vec::new(),
            fetched_at,
            not_modified: true,
        }
    }
}

/// A product observed in the current snapshot with no prior stored row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewArrival {
    pub product_id: i64,
    pub external_id: String,
    pub name: String,
    pub url: String,
    pub image_url: Option<String>,
    pub detected_at: DateTime<Utc>,
}

/// Team subscription context used to gate SMS delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionContext<'a> {
    pub subscription_status: Option<&'a str>,
    pub plan_name: Option<&'a str>,
}
