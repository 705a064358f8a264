//! Transactional snapshot sync and new-arrival detection.
//!
//! Detection rules:
//! - We store every product we have seen on the monitored page.
//! - A product whose external id has no stored row is a NEW ARRIVAL.
//! - Position changes and metadata edits never re-trigger: the comparison is
//!   a pure set difference on external ids.

use crate::db;
use crate::model::{NewArrival, Snapshot};
use anyhow::{anyhow, Result};
use std::collections::HashSet;
use tracing::{info, instrument};

/// Sync the snapshot into storage and return the products never seen before.
///
/// The whole read-diff-upsert-reread sequence runs in one transaction: a
/// concurrent run racing on the same external id cannot double-insert (unique
/// constraint + upsert) and cannot double-report (the loser's existence check
/// reads the winner's committed row).
#[instrument(skip_all)]
pub async fn sync_and_detect(
    pool: &db::Pool,
    snapshot: &Snapshot,
    max_tracked: usize,
) -> Result<Vec<NewArrival>> {
    // Only the newest items matter: the page lists newest first.
    let top_products = &snapshot.products[..snapshot.products.len().min(max_tracked)];
    if top_products.is_empty() {
        return Ok(Vec::new());
    }

    let external_ids: Vec<String> = top_products.iter().map(|p| p.external_id.clone()).collect();

    let mut tx = pool.begin().await?;

    let existing: HashSet<String> = db::existing_external_ids_tx(&mut tx, &external_ids)
        .await?
        .into_iter()
        .collect();

    let new_products: Vec<_> = top_products
        .iter()
        .filter(|p| !existing.contains(&p.external_id))
        .collect();

    db::upsert_products_tx(&mut tx, top_products, snapshot.fetched_at).await?;

    if new_products.is_empty() {
        tx.commit().await?;
        return Ok(Vec::new());
    }

    // Re-read the inserted rows for surrogate keys and authoritative created_at.
    let new_ids: Vec<String> = new_products.iter().map(|p| p.external_id.clone()).collect();
    let inserted = db::products_by_external_ids_tx(&mut tx, &new_ids).await?;

    tx.commit().await?;

    let mut arrivals = Vec::with_capacity(inserted.len());
    for row in inserted {
        // Every re-read row must come from this snapshot's insert batch.
        new_products
            .iter()
            .find(|p| p.external_id == row.external_id)
            .ok_or_else(|| {
                anyhow!(
                    "no snapshot product found for external_id={}",
                    row.external_id
                )
            })?;
        arrivals.push(NewArrival {
            product_id: row.id,
            external_id: row.external_id,
            name: row.name,
            url: row.url,
            image_url: row.image_url,
            detected_at: row.created_at,
        });
    }

    info!(new_arrivals = arrivals.len(), "snapshot synced");
    Ok(arrivals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewProduct;
    use chrono::Utc;

    async fn setup_pool() -> db::Pool {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn snapshot_of(ids: &[&str]) -> Snapshot {
        Snapshot {
            products: ids
                .iter()
                .enumerate()
                .map(|(position, id)| NewProduct {
                    external_id: (*id).into(),
                    name: format!("Product {id}"),
                    url: format!("https://jellycat.com/{id}/"),
                    image_url: None,
                    position,
                })
                .collect(),
            fetched_at: Utc::now(),
            not_modified: false,
        }
    }

    #[tokio::test]
    async fn first_snapshot_reports_all_products_as_arrivals() {
        let pool = setup_pool().await;
        let arrivals = sync_and_detect(&pool, &snapshot_of(&["a", "b"]), 20)
            .await
            .unwrap();
        let mut ids: Vec<_> = arrivals.iter().map(|a| a.external_id.as_str()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(arrivals[0].detected_at, arrivals[1].detected_at);
    }

    #[tokio::test]
    async fn rerun_of_same_snapshot_is_idempotent() {
        let pool = setup_pool().await;
        let snapshot = snapshot_of(&["a", "b"]);
        assert_eq!(sync_and_detect(&pool, &snapshot, 20).await.unwrap().len(), 2);

        let mut again = snapshot.clone();
        again.fetched_at = snapshot.fetched_at + chrono::Duration::seconds(60);
        assert!(sync_and_detect(&pool, &again, 20).await.unwrap().is_empty());

        // Refresh fields moved, created_at did not.
        let mut tx = pool.begin().await.unwrap();
        let rows = db::products_by_external_ids_tx(&mut tx, &["a".to_string()])
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(rows[0].last_checked_at, again.fetched_at);
        assert_eq!(rows[0].updated_at, again.fetched_at);
        assert!(rows[0].created_at < again.fetched_at);
    }

    #[tokio::test]
    async fn reordering_does_not_create_arrivals() {
        let pool = setup_pool().await;
        sync_and_detect(&pool, &snapshot_of(&["a", "b"]), 20)
            .await
            .unwrap();
        let arrivals = sync_and_detect(&pool, &snapshot_of(&["b", "a"]), 20)
            .await
            .unwrap();
        assert!(arrivals.is_empty());
    }

    #[tokio::test]
    async fn only_the_genuinely_new_product_is_reported() {
        let pool = setup_pool().await;
        sync_and_detect(&pool, &snapshot_of(&["a", "b"]), 20)
            .await
            .unwrap();
        let arrivals = sync_and_detect(&pool, &snapshot_of(&["c", "a", "b"]), 20)
            .await
            .unwrap();
        assert_eq!(arrivals.len(), 1);
        assert_eq!(arrivals[0].external_id, "c");
    }

    #[tokio::test]
    async fn snapshot_is_truncated_to_the_tracked_window() {
        let pool = setup_pool().await;
        let arrivals = sync_and_detect(&pool, &snapshot_of(&["a", "b", "c", "d"]), 2)
            .await
            .unwrap();
        assert_eq!(arrivals.len(), 2);

        // Products outside the window were never persisted.
        let mut tx = pool.begin().await.unwrap();
        let stored = db::existing_external_ids_tx(
            &mut tx,
            &["a".into(), "b".into(), "c".into(), "d".into()],
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[tokio::test]
    async fn empty_snapshot_short_circuits() {
        let pool = setup_pool().await;
        let arrivals = sync_and_detect(&pool, &snapshot_of(&[]), 20).await.unwrap();
        assert!(arrivals.is_empty());
    }

    #[tokio::test]
    async fn later_metadata_wins_but_identity_is_stable() {
        let pool = setup_pool().await;
        sync_and_detect(&pool, &snapshot_of(&["a"]), 20).await.unwrap();

        let mut renamed = snapshot_of(&["a"]);
        renamed.products[0].name = "Product a (restyled)".into();
        renamed.products[0].image_url = Some("https://cdn/a.jpg".into());
        let arrivals = sync_and_detect(&pool, &renamed, 20).await.unwrap();
        assert!(arrivals.is_empty());

        let mut tx = pool.begin().await.unwrap();
        let rows = db::products_by_external_ids_tx(&mut tx, &["a".to_string()])
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "Product a (restyled)");
        assert_eq!(rows[0].image_url.as_deref(), Some("https://cdn/a.jpg"));
    }
}
