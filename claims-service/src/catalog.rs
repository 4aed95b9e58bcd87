use anyhow::{bail, Context, Result};
use diesel::prelude::*;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde::Deserialize;

use crate::models::{CatalogItem, NewCatalogItem};
use crate::schema::{catalog_items, claims};
use shared::{EngineError, Money};

pub async fn get(conn: &mut AsyncPgConnection, resource_id: i64) -> Result<CatalogItem, EngineError> {
    catalog_items::table
        .find(resource_id)
        .first::<CatalogItem>(conn)
        .await
        .optional()?
        .ok_or(EngineError::NotTracked)
}

/// Locks the item row for the rest of the transaction. Every mutation of
/// an item's stock or claims happens under this lock.
pub async fn lock(conn: &mut AsyncPgConnection, resource_id: i64) -> Result<CatalogItem, EngineError> {
    catalog_items::table
        .find(resource_id)
        .for_update()
        .first::<CatalogItem>(conn)
        .await
        .optional()?
        .ok_or(EngineError::NotTracked)
}

/// `remaining += delta` inside the caller's transaction. The caller must
/// already hold the item row lock; the bounds check is defensive and a
/// violation aborts the transaction rather than clamping.
pub async fn adjust(
    conn: &mut AsyncPgConnection,
    resource_id: i64,
    delta: i32,
) -> Result<i32, EngineError> {
    let item = lock(conn, resource_id).await?;
    let new_remaining = item.remaining_quantity + delta;
    if new_remaining < 0 || new_remaining > item.initial_quantity {
        return Err(EngineError::InvariantViolation(format!(
            "remaining for item {} would become {new_remaining} (initial {})",
            item.id, item.initial_quantity
        )));
    }
    diesel::update(catalog_items::table.find(resource_id))
        .set(catalog_items::remaining_quantity.eq(new_remaining))
        .execute(conn)
        .await?;
    Ok(new_remaining)
}

pub async fn list(conn: &mut AsyncPgConnection) -> Result<Vec<CatalogItem>, EngineError> {
    Ok(catalog_items::table
        .order(catalog_items::id.asc())
        .load(conn)
        .await?)
}

#[derive(Debug, Deserialize)]
struct ListingRow {
    name: String,
    price: String,
    availability: i32,
}

fn parse_listing_rows(csv_text: &str) -> Result<Vec<NewCatalogItem>> {
    let mut reader = csv::Reader::from_reader(csv_text.as_bytes());
    let headers = reader.headers().context("reading CSV headers")?.clone();
    for required in ["name", "price", "availability"] {
        if !headers.iter().any(|h| h == required) {
            bail!("CSV must contain these headers: name, price, availability");
        }
    }

    let mut items = Vec::new();
    for (idx, record) in reader.deserialize::<ListingRow>().enumerate() {
        let row = record.with_context(|| format!("CSV row {}", idx + 1))?;
        let name = row.name.trim().to_string();
        if name.is_empty() {
            bail!("CSV row {}: name is empty", idx + 1);
        }
        if row.availability < 0 {
            bail!("CSV row {}: availability is negative", idx + 1);
        }
        let unit_price = Money::parse(&row.price)
            .with_context(|| format!("CSV row {}: price {:?}", idx + 1, row.price))?;
        items.push(NewCatalogItem {
            name,
            unit_price,
            initial_quantity: row.availability,
            remaining_quantity: row.availability,
        });
    }
    if items.is_empty() {
        bail!("CSV appears to be empty");
    }
    Ok(items)
}

/// Replaces the listing set with the uploaded CSV. Items referenced by
/// claims from an earlier sale are kept (soft lifecycle); claim-free
/// leftovers are dropped.
pub async fn import_catalog(conn: &mut AsyncPgConnection, csv_text: &str) -> Result<usize> {
    let items = parse_listing_rows(csv_text)?;

    conn.transaction::<usize, anyhow::Error, _>(|conn| {
        Box::pin(async move {
            let referenced: Vec<i64> = claims::table
                .select(claims::resource_id)
                .distinct()
                .load(conn)
                .await?;
            diesel::delete(catalog_items::table.filter(catalog_items::id.ne_all(referenced)))
                .execute(conn)
                .await?;

            let inserted = diesel::insert_into(catalog_items::table)
                .values(&items)
                .execute(conn)
                .await?;
            Ok(inserted)
        })
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_listing_csv() {
        let csv = "name,price,availability\nUmbreon VMAX,$12.50,3\nEspeon V,SGD 4,1\n";
        let items = parse_listing_rows(csv).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].name, "Umbreon VMAX");
        assert_eq!(items[0].unit_price.to_string(), "12.50");
        assert_eq!(items[0].initial_quantity, 3);
        assert_eq!(items[0].remaining_quantity, 3);
        assert_eq!(items[1].unit_price.to_string(), "4.00");
    }

    #[test]
    fn rejects_missing_headers() {
        let err = parse_listing_rows("name,cost\nUmbreon,1\n").unwrap_err();
        assert!(err.to_string().contains("headers"));
    }

    #[test]
    fn rejects_unparsable_price_and_empty_file() {
        assert!(parse_listing_rows("name,price,availability\nUmbreon,cheap,3\n").is_err());
        assert!(parse_listing_rows("name,price,availability\n").is_err());
    }
}
