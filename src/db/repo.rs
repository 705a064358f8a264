use super::model::{ProductRow, RecipientRow, ScraperState};
use crate::model::NewProduct;
use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") {
        return url.to_string();
    }

    // In-memory URLs like sqlite::memory: or sqlite::memory:?cache=shared
    if url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = if let Some(rest) = path_part.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            format!("{}/{}", home.trim_end_matches('/'), rest)
        } else {
            path_part.to_string()
        }
    } else {
        path_part.to_string()
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn product_from_row(row: &sqlx::sqlite::SqliteRow) -> ProductRow {
    ProductRow {
        id: row.get("id"),
        external_id: row.get("external_id"),
        name: row.get("name"),
        url: row.get("url"),
        image_url: row.get("image_url"),
        last_known_stock: row.get("last_known_stock"),
        last_checked_at: row.get("last_checked_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        notified_at: row.get("notified_at"),
    }
}

// ---- scraper_state ----

#[instrument(skip_all)]
pub async fn get_scraper_state(pool: &Pool, key: &str) -> Result<Option<ScraperState>> {
    let row = sqlx::query(
        "SELECT key, etag, last_modified, updated_at FROM scraper_state WHERE key = ?",
    )
    .bind(key)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| ScraperState {
        key: row.get("key"),
        etag: row.get("etag"),
        last_modified: row.get("last_modified"),
        updated_at: row.get("updated_at"),
    }))
}

#[instrument(skip_all)]
pub async fn upsert_scraper_state(
    pool: &Pool,
    key: &str,
    etag: Option<&str>,
    last_modified: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO scraper_state (key, etag, last_modified, updated_at) VALUES (?, ?, ?, ?) \
         ON CONFLICT(key) DO UPDATE SET etag = excluded.etag, \
         last_modified = excluded.last_modified, updated_at = excluded.updated_at",
    )
    .bind(key)
    .bind(etag)
    .bind(last_modified)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

// ---- products ----

#[instrument(skip_all)]
pub async fn existing_external_ids_tx(
    tx: &mut Transaction<'_, Sqlite>,
    external_ids: &[String],
) -> Result<Vec<String>> {
    if external_ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut qb = QueryBuilder::new("SELECT external_id FROM products WHERE external_id IN (");
    let mut separated = qb.separated(", ");
    for id in external_ids {
        separated.push_bind(id);
    }
    separated.push_unseparated(")");

    let rows = qb.build().fetch_all(&mut **tx).await?;
    Ok(rows.into_iter().map(|r| r.get("external_id")).collect())
}

/// Insert-or-update the current snapshot products. `created_at` is written
/// only on first insert; the conflict path refreshes everything else.
#[instrument(skip_all)]
pub async fn upsert_products_tx(
    tx: &mut Transaction<'_, Sqlite>,
    products: &[NewProduct],
    now: DateTime<Utc>,
) -> Result<()> {
    for product in products {
        sqlx::query(
            "INSERT INTO products \
             (external_id, name, url, image_url, last_known_stock, last_checked_at, created_at, updated_at) \
             VALUES (?, ?, ?, ?, 1, ?, ?, ?) \
             ON CONFLICT(external_id) DO UPDATE SET \
             name = excluded.name, url = excluded.url, image_url = excluded.image_url, \
             last_known_stock = excluded.last_known_stock, \
             last_checked_at = excluded.last_checked_at, updated_at = excluded.updated_at",
        )
        .bind(&product.external_id)
        .bind(&product.name)
        .bind(&product.url)
        .bind(&product.image_url)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

#[instrument(skip_all)]
pub async fn products_by_external_ids_tx(
    tx: &mut Transaction<'_, Sqlite>,
    external_ids: &[String],
) -> Result<Vec<ProductRow>> {
    if external_ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut qb = QueryBuilder::new(
        "SELECT id, external_id, name, url, image_url, last_known_stock, \
         last_checked_at, created_at, updated_at, notified_at \
         FROM products WHERE external_id IN (",
    );
    let mut separated = qb.separated(", ");
    for id in external_ids {
        separated.push_bind(id);
    }
    separated.push_unseparated(")");

    let rows = qb.build().fetch_all(&mut **tx).await?;
    Ok(rows.iter().map(product_from_row).collect())
}

#[instrument(skip_all)]
pub async fn products_by_ids(pool: &Pool, ids: &[i64]) -> Result<Vec<ProductRow>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut qb = QueryBuilder::new(
        "SELECT id, external_id, name, url, image_url, last_known_stock, \
         last_checked_at, created_at, updated_at, notified_at \
         FROM products WHERE id IN (",
    );
    let mut separated = qb.separated(", ");
    for id in ids {
        separated.push_bind(id);
    }
    separated.push_unseparated(")");

    let rows = qb.build().fetch_all(pool).await?;
    Ok(rows.iter().map(product_from_row).collect())
}

/// Ids among `ids` whose `notified_at` is still null. This is the idempotency
/// gate for the notification fan-out.
#[instrument(skip_all)]
pub async fn pending_notification_ids(pool: &Pool, ids: &[i64]) -> Result<Vec<i64>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut qb =
        QueryBuilder::new("SELECT id FROM products WHERE notified_at IS NULL AND id IN (");
    let mut separated = qb.separated(", ");
    for id in ids {
        separated.push_bind(id);
    }
    separated.push_unseparated(")");

    let rows = qb.build().fetch_all(pool).await?;
    Ok(rows.into_iter().map(|r| r.get("id")).collect())
}

/// Set `notified_at` for the given products. The null guard makes the mark
/// atomic with the pending gate: a concurrent run that already marked a row
/// leaves its timestamp untouched. Returns how many rows this call marked.
#[instrument(skip_all)]
pub async fn mark_products_notified(pool: &Pool, ids: &[i64], now: DateTime<Utc>) -> Result<u64> {
    if ids.is_empty() {
        return Ok(0);
    }
    let mut qb = QueryBuilder::new("UPDATE products SET notified_at = ");
    qb.push_bind(now);
    qb.push(" WHERE notified_at IS NULL AND id IN (");
    let mut separated = qb.separated(", ");
    for id in ids {
        separated.push_bind(id);
    }
    separated.push_unseparated(")");

    let result = qb.build().execute(pool).await?;
    Ok(result.rows_affected())
}

// ---- recipients ----

/// All non-deleted users joined with their channel preferences and team
/// subscription context. Users without a preference row are still included;
/// the notifier applies the defaults.
#[instrument(skip_all)]
pub async fn load_recipients(pool: &Pool) -> Result<Vec<RecipientRow>> {
    let rows = sqlx::query(
        "SELECT u.id AS user_id, u.email, \
                p.email_enabled, p.sms_enabled, p.phone_number, \
                t.subscription_status, t.plan_name \
         FROM users u \
         LEFT JOIN notification_preferences p ON p.user_id = u.id \
         LEFT JOIN team_members m ON m.user_id = u.id \
         LEFT JOIN teams t ON t.id = m.team_id \
         WHERE u.deleted_at IS NULL",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| RecipientRow {
            user_id: row.get("user_id"),
            email: row.get("email"),
            email_enabled: row.get("email_enabled"),
            sms_enabled: row.get("sms_enabled"),
            phone_number: row.get("phone_number"),
            subscription_status: row.get("subscription_status"),
            plan_name: row.get("plan_name"),
        })
        .collect())
}

// ---- job locks ----

/// Try to take the named lock. Succeeds when no row exists or the previous
/// holder's lease has expired. Returns false when the lock is held.
#[instrument(skip_all)]
pub async fn try_acquire_job_lock(
    pool: &Pool,
    key: &str,
    holder: &str,
    ttl_seconds: u64,
    now: DateTime<Utc>,
) -> Result<bool> {
    let expires_at = now + chrono::Duration::seconds(ttl_seconds as i64);
    let result = sqlx::query(
        "INSERT INTO job_locks (key, holder, acquired_at, expires_at) VALUES (?, ?, ?, ?) \
         ON CONFLICT(key) DO UPDATE SET holder = excluded.holder, \
         acquired_at = excluded.acquired_at, expires_at = excluded.expires_at \
         WHERE job_locks.expires_at <= excluded.acquired_at",
    )
    .bind(key)
    .bind(holder)
    .bind(now)
    .bind(expires_at)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Release the named lock, but only if we still hold it. Releasing a lock
/// that expired and was re-acquired by someone else is a no-op.
#[instrument(skip_all)]
pub async fn release_job_lock(pool: &Pool, key: &str, holder: &str) -> Result<()> {
    sqlx::query("DELETE FROM job_locks WHERE key = ? AND holder = ?")
        .bind(key)
        .bind(holder)
        .execute(pool)
        .await?;
    Ok(())
}
