//! Notification fan-out: load eligible recipients, send one combined message
//! per recipient per channel, and mark the batch delivered.
//!
//! At-most-once delivery is enforced here, not by the scheduler lock: only
//! products whose `notified_at` is still null are messaged, and the batch is
//! marked notified in one update after the fan-out regardless of individual
//! channel failures. A permanently broken recipient must never block
//! delivery to everyone else nor cause the same arrival to be reprocessed.

use crate::db::{self, RecipientRow};
use crate::email::{EmailSender, ProductCard};
use crate::model::{NewArrival, SubscriptionContext};
use crate::sms::{build_sms_body, SmsSender};
use crate::subscription::can_use_sms;
use anyhow::Result;
use chrono::Utc;
use std::collections::HashSet;
use tracing::{info, instrument, warn};

/// Users without a preference row default to email on.
fn email_enabled(recipient: &RecipientRow) -> bool {
    recipient.email_enabled.unwrap_or(true)
}

/// SMS must be explicitly enabled, needs a phone number, and is gated on an
/// active qualifying subscription.
fn sms_allowed(recipient: &RecipientRow, required_plan: &str) -> bool {
    recipient.sms_enabled == Some(true)
        && recipient
            .phone_number
            .as_deref()
            .map(|p| !p.trim().is_empty())
            .unwrap_or(false)
        && can_use_sms(
            SubscriptionContext {
                subscription_status: recipient.subscription_status.as_deref(),
                plan_name: recipient.plan_name.as_deref(),
            },
            required_plan,
        )
}

/// Notify all eligible recipients of the given arrivals.
///
/// Returns the ids of products marked notified by this invocation. A product
/// already marked by a concurrent run is silently skipped; when nothing is
/// pending the call is a no-op.
#[instrument(skip_all, fields(candidates = arrivals.len()))]
pub async fn notify_new_arrivals(
    pool: &db::Pool,
    email: &dyn EmailSender,
    sms: &dyn SmsSender,
    required_plan: &str,
    arrivals: &[NewArrival],
) -> Result<Vec<i64>> {
    if arrivals.is_empty() {
        return Ok(Vec::new());
    }

    let candidate_ids: Vec<i64> = arrivals.iter().map(|a| a.product_id).collect();
    let pending_ids = db::pending_notification_ids(pool, &candidate_ids).await?;
    if pending_ids.is_empty() {
        info!("all candidates already notified; skipping fan-out");
        return Ok(Vec::new());
    }

    let pending_set: HashSet<i64> = pending_ids.iter().copied().collect();
    let pending: Vec<&NewArrival> = arrivals
        .iter()
        .filter(|a| pending_set.contains(&a.product_id))
        .collect();

    let cards: Vec<ProductCard> = pending
        .iter()
        .map(|a| ProductCard {
            name: a.name.clone(),
            url: a.url.clone(),
            image_url: a.image_url.clone(),
        })
        .collect();
    let sms_body = build_sms_body(&cards);

    let recipients = db::load_recipients(pool).await?;

    // The team join can produce one row per membership; keep the first row
    // per user so nobody is messaged twice.
    let mut seen_users = HashSet::new();
    let active: Vec<&RecipientRow> = recipients
        .iter()
        .filter(|r| seen_users.insert(r.user_id))
        .filter(|r| email_enabled(r) || sms_allowed(r, required_plan))
        .collect();

    info!(
        pending = pending.len(),
        recipients = recipients.len(),
        active = active.len(),
        "starting notification fan-out"
    );

    // Per-recipient channel sends run concurrently; each failure is logged
    // and isolated so the rest of the batch still goes out.
    let sends = active.iter().map(|recipient| {
        let cards = &cards;
        let sms_body = &sms_body;
        let send_email = email_enabled(recipient);
        let send_sms = sms_allowed(recipient, required_plan);
        async move {
            let mut sent = 0usize;
            let mut failed = 0usize;

            let email_task = async {
                if !send_email {
                    return None;
                }
                Some(email.send(&recipient.email, cards).await)
            };
            let sms_task = async {
                if !send_sms {
                    return None;
                }
                let phone = recipient.phone_number.as_deref().unwrap_or_default();
                Some(sms.send(phone, sms_body).await)
            };
            let (email_result, sms_result) = futures::join!(email_task, sms_task);

            match email_result {
                Some(Ok(())) => sent += 1,
                Some(Err(err)) => {
                    warn!(user_id = recipient.user_id, error = %err, "email send failed");
                    failed += 1;
                }
                None => {}
            }
            match sms_result {
                Some(Ok(())) => sent += 1,
                Some(Err(err)) => {
                    warn!(user_id = recipient.user_id, error = %err, "sms send failed");
                    failed += 1;
                }
                None => {}
            }
            (sent, failed)
        }
    });

    let results = futures::future::join_all(sends).await;
    let (sent, failed) = results
        .into_iter()
        .fold((0usize, 0usize), |(s, f), (rs, rf)| (s + rs, f + rf));
    info!(sent, failed, "notification fan-out settled");

    // Mark the whole pending batch even when some sends failed: delivery is
    // best-effort and there is no retry for a permanently broken channel. The
    // null guard in the update means a row marked by a racing run in the
    // meantime keeps its original timestamp.
    let marked = db::mark_products_notified(pool, &pending_ids, Utc::now()).await?;
    if marked < pending_ids.len() as u64 {
        info!(marked, pending = pending_ids.len(), "some rows were marked by a concurrent run");
    }

    Ok(pending_ids)
}
