use chrono::{TimeZone, Utc};
use log::*;
use sqlx::{FromRow, QueryBuilder, SqliteConnection};

use crate::{
    order_events::{EventFilter, OrderEvent},
    traits::EventLogError,
};

#[derive(Debug, Clone, FromRow)]
struct EventRow {
    id: String,
    kind: i64,
    author: String,
    created_at: i64,
    tags: String,
    content: String,
}

impl TryFrom<EventRow> for OrderEvent {
    type Error = EventLogError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let tags = serde_json::from_str::<Vec<Vec<String>>>(&row.tags)
            .map_err(|e| EventLogError::StorageError(format!("Event {} has corrupt tags. {e}", row.id)))?;
        let created_at = Utc
            .timestamp_opt(row.created_at, 0)
            .single()
            .ok_or_else(|| EventLogError::StorageError(format!("Event {} has an invalid timestamp", row.id)))?;
        let kind = u16::try_from(row.kind)
            .map_err(|_| EventLogError::StorageError(format!("Event {} has an invalid kind", row.id)))?;
        Ok(OrderEvent { id: row.id.into(), author: row.author.into(), created_at, kind, tags, content: row.content })
    }
}

/// Stores the event, returning `false` if an event with the same id is already stored.
pub async fn idempotent_insert(event: &OrderEvent, conn: &mut SqliteConnection) -> Result<bool, EventLogError> {
    let tags = serde_json::to_string(&event.tags).map_err(|e| EventLogError::StorageError(e.to_string()))?;
    let event_type = event.event_type().ok().map(|t| t.to_string());
    let result = sqlx::query(
        r#"
            INSERT INTO order_events (id, order_id, kind, event_type, author, recipient, created_at, tags, content)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(event.id.as_str())
    .bind(event.tag_value("order"))
    .bind(i64::from(event.kind))
    .bind(event_type)
    .bind(event.author.as_str())
    .bind(event.tag_value("p"))
    .bind(event.created_at.timestamp())
    .bind(tags)
    .bind(event.content.as_str())
    .execute(conn)
    .await;
    match result {
        Ok(_) => {
            debug!("🗃️ Event {} stored", event.id);
            Ok(true)
        },
        Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
            trace!("🗃️ Event {} is already stored", event.id);
            Ok(false)
        },
        Err(e) => Err(EventLogError::from(e)),
    }
}

/// Fetches events according to the criteria in `filter`, oldest first. Ties are broken by event id.
pub async fn fetch_events(filter: &EventFilter, conn: &mut SqliteConnection) -> Result<Vec<OrderEvent>, EventLogError> {
    let mut builder = QueryBuilder::new("SELECT id, kind, author, created_at, tags, content FROM order_events ");
    if !filter.is_empty() {
        builder.push("WHERE ");
    }
    let mut where_clause = builder.separated(" AND ");
    if let Some(order_id) = &filter.order_id {
        where_clause.push("order_id = ");
        where_clause.push_bind_unseparated(order_id.to_string());
    }
    if let Some(kinds) = &filter.kinds {
        let kinds = kinds.iter().map(|k| k.to_string()).collect::<Vec<_>>().join(",");
        where_clause.push(format!("kind IN ({kinds})"));
    }
    if let Some(types) = &filter.event_types {
        let types = types.iter().map(|t| format!("'{t}'")).collect::<Vec<_>>().join(",");
        where_clause.push(format!("event_type IN ({types})"));
    }
    if let Some(authors) = &filter.authors {
        where_clause.push("author IN (");
        for (i, author) in authors.iter().enumerate() {
            if i > 0 {
                where_clause.push_unseparated(", ");
            }
            where_clause.push_bind_unseparated(author.to_string());
        }
        where_clause.push_unseparated(")");
    }
    if let Some(recipient) = &filter.recipient {
        where_clause.push("recipient = ");
        where_clause.push_bind_unseparated(recipient.to_string());
    }
    if let Some(since) = filter.since {
        where_clause.push("created_at >= ");
        where_clause.push_bind_unseparated(since.timestamp());
    }
    if let Some(until) = filter.until {
        where_clause.push("created_at <= ");
        where_clause.push_bind_unseparated(until.timestamp());
    }
    builder.push(" ORDER BY created_at ASC, id ASC");
    trace!("🗃️ Executing query: {}", builder.sql());
    let rows = builder.build_query_as::<EventRow>().fetch_all(conn).await?;
    trace!("🗃️ {} events match: {filter}", rows.len());
    rows.into_iter().map(OrderEvent::try_from).collect()
}
