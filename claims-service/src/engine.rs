use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use tracing::info;

use crate::models::{Claim, NewAuditEntry, NewClaim, CLAIM_ACTIVE, CLAIM_CANCELLED};
use crate::schema::{admin_audit_log, catalog_items, claims};
use crate::{catalog, orders, outbox};
use shared::{
    CancelOutcome, ClaimHolder, ClaimOutcome, ClaimSummaryEntry, DomainEvent, EngineError,
    QuantitySpec, ReleaseReason, RevokeOutcome,
};

/// Timing policy for buyer self-service, supplied from configuration.
#[derive(Debug, Clone, Copy)]
pub struct Policy {
    pub cancel_window: Duration,
    pub stale_horizon: Duration,
}

fn cancel_window_open(earliest: DateTime<Utc>, now: DateTime<Utc>, window: Duration) -> bool {
    now - earliest <= window
}

async fn active_count(conn: &mut AsyncPgConnection, resource_id: i64) -> Result<i64, EngineError> {
    Ok(claims::table
        .filter(claims::resource_id.eq(resource_id))
        .filter(claims::status.eq(CLAIM_ACTIVE))
        .count()
        .get_result(conn)
        .await?)
}

/// Reserves units of one item for one actor. The item row lock taken at
/// the start serializes all claim and cancel traffic on that item, so the
/// stock check and the inserts below observe a stable remaining count.
pub async fn claim(
    conn: &mut AsyncPgConnection,
    resource_id: i64,
    actor_id: i64,
    display_name: Option<String>,
    quantity: QuantitySpec,
) -> Result<ClaimOutcome, EngineError> {
    conn.transaction::<ClaimOutcome, EngineError, _>(|conn| {
        Box::pin(async move {
            let item = catalog::lock(conn, resource_id).await?;

            let requested = quantity.resolve(item.remaining_quantity)?;
            if requested <= 0 {
                return Err(EngineError::NothingAvailable);
            }
            if requested > item.remaining_quantity {
                return Err(EngineError::InsufficientStock {
                    remaining: item.remaining_quantity,
                });
            }

            // One active claim group per item per actor; to change quantity
            // the actor cancels and claims again.
            let held: i64 = claims::table
                .filter(claims::resource_id.eq(resource_id))
                .filter(claims::actor_id.eq(actor_id))
                .filter(claims::status.eq(CLAIM_ACTIVE))
                .count()
                .get_result(conn)
                .await?;
            if held > 0 {
                return Err(EngineError::DuplicateActiveClaim);
            }

            for _ in 0..requested {
                let sequence_number = active_count(conn, resource_id).await? as i32 + 1;

                // Revive the actor's most recently cancelled row instead of
                // inserting a new one; row growth stays bounded and retried
                // claims stay idempotent-safe.
                let revivable: Option<Claim> = claims::table
                    .filter(claims::resource_id.eq(resource_id))
                    .filter(claims::actor_id.eq(actor_id))
                    .filter(claims::status.eq(CLAIM_CANCELLED))
                    .order(claims::id.desc())
                    .first(conn)
                    .await
                    .optional()?;

                match revivable {
                    Some(row) => {
                        diesel::update(claims::table.find(row.id))
                            .set((
                                claims::status.eq(CLAIM_ACTIVE),
                                claims::display_name.eq(display_name.clone()),
                                claims::sequence_number.eq(sequence_number),
                                claims::created_at.eq(Utc::now()),
                            ))
                            .execute(conn)
                            .await?;
                    }
                    None => {
                        diesel::insert_into(claims::table)
                            .values(&NewClaim {
                                resource_id,
                                actor_id,
                                display_name: display_name.clone(),
                                sequence_number,
                                status: CLAIM_ACTIVE.to_string(),
                            })
                            .execute(conn)
                            .await?;
                    }
                }
            }

            let new_remaining = catalog::adjust(conn, resource_id, -requested).await?;

            outbox::record(
                conn,
                &DomainEvent::ClaimReserved {
                    resource_id,
                    actor_id,
                    quantity: requested,
                    remaining: new_remaining,
                },
            )
            .await?;

            info!(
                resource_id,
                actor_id, requested, new_remaining, "claims reserved"
            );

            Ok(ClaimOutcome {
                resource_id,
                item_name: item.name,
                quantity_reserved: requested,
                new_remaining,
            })
        })
    })
    .await
}

/// Flips all of the actor's active claims on one item to cancelled and
/// restores stock. Assumes the caller opened the transaction; the item
/// row lock is taken here.
pub(crate) async fn release_claims(
    conn: &mut AsyncPgConnection,
    resource_id: i64,
    actor_id: i64,
    is_admin: bool,
    reason: ReleaseReason,
    policy: Policy,
) -> Result<CancelOutcome, EngineError> {
    let item = catalog::lock(conn, resource_id).await?;

    let active: Vec<Claim> = claims::table
        .filter(claims::resource_id.eq(resource_id))
        .filter(claims::actor_id.eq(actor_id))
        .filter(claims::status.eq(CLAIM_ACTIVE))
        .load(conn)
        .await?;
    if active.is_empty() {
        return Err(EngineError::NoActiveClaims);
    }

    if !is_admin {
        if let Some(earliest) = active.iter().map(|c| c.created_at).min() {
            if !cancel_window_open(earliest, Utc::now(), policy.cancel_window) {
                return Err(EngineError::CancelWindowExpired {
                    window_minutes: policy.cancel_window.num_minutes(),
                });
            }
        }
    }

    let released = diesel::update(
        claims::table
            .filter(claims::resource_id.eq(resource_id))
            .filter(claims::actor_id.eq(actor_id))
            .filter(claims::status.eq(CLAIM_ACTIVE)),
    )
    .set(claims::status.eq(CLAIM_CANCELLED))
    .execute(conn)
    .await? as i32;

    let new_remaining = catalog::adjust(conn, resource_id, released).await?;

    outbox::record(
        conn,
        &DomainEvent::ClaimsReleased {
            resource_id,
            actor_id,
            quantity: released,
            remaining: new_remaining,
            reason,
        },
    )
    .await?;

    info!(
        resource_id,
        actor_id,
        released,
        new_remaining,
        reason = reason.as_str(),
        "claims released"
    );

    Ok(CancelOutcome {
        resource_id,
        item_name: item.name,
        quantity_released: released,
        new_remaining,
    })
}

pub async fn cancel(
    conn: &mut AsyncPgConnection,
    resource_id: i64,
    actor_id: i64,
    is_admin: bool,
    policy: Policy,
) -> Result<CancelOutcome, EngineError> {
    let reason = if is_admin {
        ReleaseReason::Admin
    } else {
        ReleaseReason::Buyer
    };
    conn.transaction::<CancelOutcome, EngineError, _>(|conn| {
        Box::pin(async move {
            release_claims(conn, resource_id, actor_id, is_admin, reason, policy).await
        })
    })
    .await
}

/// Admin revocation: release the buyer's claims on the item (window
/// bypassed, audited), then fold the released units into any order
/// snapshot that still references them.
pub async fn admin_revoke(
    conn: &mut AsyncPgConnection,
    admin_id: i64,
    actor_id: i64,
    resource_id: i64,
    policy: Policy,
) -> Result<RevokeOutcome, EngineError> {
    let released = conn
        .transaction::<CancelOutcome, EngineError, _>(|conn| {
            Box::pin(async move {
                let out = release_claims(
                    conn,
                    resource_id,
                    actor_id,
                    true,
                    ReleaseReason::Admin,
                    policy,
                )
                .await?;
                diesel::insert_into(admin_audit_log::table)
                    .values(&NewAuditEntry {
                        action: "revoke_claims".to_string(),
                        admin_id,
                        target_actor_id: actor_id,
                        resource_id,
                        quantity: out.quantity_released,
                        reason: "admin_revoke".to_string(),
                    })
                    .execute(conn)
                    .await?;
                Ok(out)
            })
        })
        .await?;

    let recon =
        orders::reconcile_revocation(conn, actor_id, resource_id, released.quantity_released)
            .await?;

    Ok(RevokeOutcome {
        resource_id,
        item_name: released.item_name,
        quantity_revoked: released.quantity_released,
        new_remaining: released.new_remaining,
        invoice_no: recon.invoice_no,
        order_cancelled: recon.order_cancelled,
    })
}

/// One consistent read of a buyer's bag, grouped per item in claim order.
pub async fn summarize_claims(
    conn: &mut AsyncPgConnection,
    actor_id: i64,
) -> Result<Vec<ClaimSummaryEntry>, EngineError> {
    let rows: Vec<(Claim, crate::models::CatalogItem)> = claims::table
        .inner_join(catalog_items::table)
        .filter(claims::actor_id.eq(actor_id))
        .filter(claims::status.eq(CLAIM_ACTIVE))
        .order(claims::created_at.asc())
        .load(conn)
        .await?;

    let mut entries: Vec<ClaimSummaryEntry> = Vec::new();
    for (_, item) in rows {
        match entries.iter_mut().find(|e| e.resource_id == item.id) {
            Some(entry) => entry.quantity += 1,
            None => entries.push(ClaimSummaryEntry {
                resource_id: item.id,
                name: item.name,
                unit_price: item.unit_price,
                quantity: 1,
            }),
        }
    }
    Ok(entries)
}

/// All actors holding active claims, earliest claimant first. Orders the
/// administrative revoke flow.
pub async fn list_claim_holders(
    conn: &mut AsyncPgConnection,
) -> Result<Vec<ClaimHolder>, EngineError> {
    let rows: Vec<Claim> = claims::table
        .filter(claims::status.eq(CLAIM_ACTIVE))
        .order(claims::created_at.asc())
        .load(conn)
        .await?;

    let mut holders: Vec<ClaimHolder> = Vec::new();
    for claim in rows {
        match holders.iter_mut().find(|h| h.actor_id == claim.actor_id) {
            Some(holder) => {
                holder.quantity += 1;
                if holder.display_name.is_none() {
                    holder.display_name = claim.display_name;
                }
            }
            None => holders.push(ClaimHolder {
                actor_id: claim.actor_id,
                display_name: claim.display_name,
                quantity: 1,
                earliest: claim.created_at,
            }),
        }
    }
    Ok(holders)
}

/// Releases everything a buyer still holds once any of it has gone stale.
/// Runs on session start; returns the number of units released.
pub async fn sweep_stale_claims(
    conn: &mut AsyncPgConnection,
    actor_id: i64,
    policy: Policy,
) -> Result<i32, EngineError> {
    let cutoff = Utc::now() - policy.stale_horizon;
    let stale: i64 = claims::table
        .filter(claims::actor_id.eq(actor_id))
        .filter(claims::status.eq(CLAIM_ACTIVE))
        .filter(claims::created_at.lt(cutoff))
        .count()
        .get_result(conn)
        .await?;
    if stale == 0 {
        return Ok(0);
    }

    let resources: Vec<i64> = claims::table
        .filter(claims::actor_id.eq(actor_id))
        .filter(claims::status.eq(CLAIM_ACTIVE))
        .select(claims::resource_id)
        .distinct()
        .load(conn)
        .await?;

    let mut released = 0;
    for resource_id in resources {
        let out = conn
            .transaction::<CancelOutcome, EngineError, _>(|conn| {
                Box::pin(async move {
                    release_claims(conn, resource_id, actor_id, true, ReleaseReason::Stale, policy)
                        .await
                })
            })
            .await?;
        released += out.quantity_released;
    }
    Ok(released)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_window_boundaries() {
        let window = Duration::minutes(5);
        let claimed = Utc::now();

        assert!(cancel_window_open(claimed, claimed, window));
        assert!(cancel_window_open(
            claimed,
            claimed + Duration::minutes(5),
            window
        ));
        assert!(!cancel_window_open(
            claimed,
            claimed + Duration::minutes(5) + Duration::seconds(1),
            window
        ));
    }
}
