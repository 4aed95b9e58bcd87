use chrono::{Duration, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::models::{ActorSession, NewActorSession};
use crate::schema::actor_sessions;
use shared::EngineError;

pub const ROLE_BUYER: &str = "buyer";
pub const ROLE_ADMIN: &str = "admin";

const SESSION_TTL_HOURS: i64 = 48;

/// Expired sessions read as absent and are lazily removed.
pub async fn load(
    conn: &mut AsyncPgConnection,
    actor_id: i64,
) -> Result<Option<ActorSession>, EngineError> {
    let session: Option<ActorSession> = actor_sessions::table
        .find(actor_id)
        .first(conn)
        .await
        .optional()?;
    match session {
        Some(s) if s.expires_at <= Utc::now() => {
            diesel::delete(actor_sessions::table.find(actor_id))
                .execute(conn)
                .await?;
            Ok(None)
        }
        other => Ok(other),
    }
}

pub async fn upsert(
    conn: &mut AsyncPgConnection,
    actor_id: i64,
    role: &str,
    session_type: &str,
    payload: serde_json::Value,
) -> Result<(), EngineError> {
    let now = Utc::now();
    let row = NewActorSession {
        actor_id,
        role: role.to_string(),
        session_type: session_type.to_string(),
        payload,
        updated_at: now,
        expires_at: now + Duration::hours(SESSION_TTL_HOURS),
    };
    diesel::insert_into(actor_sessions::table)
        .values(&row)
        .on_conflict(actor_sessions::actor_id)
        .do_update()
        .set((
            actor_sessions::role.eq(row.role.clone()),
            actor_sessions::session_type.eq(row.session_type.clone()),
            actor_sessions::payload.eq(row.payload.clone()),
            actor_sessions::updated_at.eq(row.updated_at),
            actor_sessions::expires_at.eq(row.expires_at),
        ))
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn clear(conn: &mut AsyncPgConnection, actor_id: i64) -> Result<(), EngineError> {
    diesel::delete(actor_sessions::table.find(actor_id))
        .execute(conn)
        .await?;
    Ok(())
}
