use std::time::Duration;

use anyhow::Result;
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection, RunQueryDsl};
use rdkafka::producer::{FutureProducer, FutureRecord};
use tokio::time;
use tracing::{debug, error};
use uuid::Uuid;

use crate::models::{DbOutboxEvent, NewOutboxEvent};
use crate::schema::outbox_events;
use shared::DomainEvent;

type DbPool = Pool<AsyncPgConnection>;

/// Appends an event inside the caller's transaction, so it is published
/// only if the mutation it describes commits.
pub async fn record(
    conn: &mut AsyncPgConnection,
    event: &DomainEvent,
) -> Result<(), diesel::result::Error> {
    let row = NewOutboxEvent {
        id: Uuid::new_v4(),
        aggregate_ref: event.aggregate_ref(),
        event_type: event.event_type().to_string(),
        event_data: serde_json::to_value(event).expect("domain events serialize"),
    };
    diesel::insert_into(outbox_events::table)
        .values(&row)
        .execute(conn)
        .await?;
    Ok(())
}

fn topic_for(event_type: &str) -> &'static str {
    if event_type.starts_with("Claim") {
        "claim-events"
    } else if event_type.starts_with("Order") || event_type.starts_with("Payment") {
        "order-events"
    } else {
        "domain-events"
    }
}

pub struct OutboxProcessor {
    pool: DbPool,
    producer: FutureProducer,
}

impl OutboxProcessor {
    pub fn new(pool: DbPool, producer: FutureProducer) -> Self {
        Self { pool, producer }
    }

    pub async fn run(&self) {
        let mut interval = time::interval(Duration::from_secs(5));

        loop {
            interval.tick().await;

            if let Err(e) = self.process_outbox_events().await {
                error!("Error processing outbox events: {}", e);
            }
        }
    }

    async fn process_outbox_events(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;

        let unprocessed = outbox_events::table
            .filter(outbox_events::processed.eq(false))
            .order(outbox_events::created_at.asc())
            .limit(100)
            .load::<DbOutboxEvent>(&mut conn)
            .await?;

        for event in unprocessed {
            if let Err(e) = self.publish_event(&event).await {
                error!("Failed to publish event {}: {}", event.id, e);
                continue;
            }

            diesel::update(outbox_events::table.filter(outbox_events::id.eq(event.id)))
                .set(outbox_events::processed.eq(true))
                .execute(&mut conn)
                .await?;

            debug!("Published outbox event: {}", event.id);
        }

        Ok(())
    }

    async fn publish_event(&self, event: &DbOutboxEvent) -> Result<()> {
        let topic = topic_for(&event.event_type);
        let json = serde_json::to_string(&event.event_data)?;
        let record = FutureRecord::to(topic)
            .payload(&json)
            .key(&event.aggregate_ref);

        self.producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| anyhow::anyhow!("Failed to publish event: {}", e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_route_to_their_streams() {
        assert_eq!(topic_for("ClaimReserved"), "claim-events");
        assert_eq!(topic_for("ClaimsReleased"), "claim-events");
        assert_eq!(topic_for("OrderCancelled"), "order-events");
        assert_eq!(topic_for("PaymentReviewed"), "order-events");
        assert_eq!(topic_for("SomethingElse"), "domain-events");
    }
}
