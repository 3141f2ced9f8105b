use async_trait::async_trait;
use sqlx::{
    postgres::{PgPoolOptions, PgRow},
    PgPool, Row,
};
use tracing::info;

use super::Store;
use crate::{
    error::StoreError,
    types::{
        Broadcast, BroadcastStatus, Contact, ContactUpdate, Direction, Flow, Keyword, MatchMode,
        MessageSource, Settings, StoredMessage,
    },
    util::now_iso,
};

const SETTINGS_ID: &str = "app";

#[derive(Clone)]
pub struct PgStore {
    db: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let db = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&db).await?;
        info!("connected to postgres and applied migrations");
        Ok(Self { db })
    }
}

fn direction_from_text(raw: &str) -> Direction {
    if raw == "outbound" {
        Direction::Outbound
    } else {
        Direction::Inbound
    }
}

fn source_from_text(raw: Option<String>) -> Option<MessageSource> {
    raw.and_then(|value| serde_json::from_value(serde_json::Value::String(value)).ok())
}

fn direction_text(direction: Direction) -> &'static str {
    match direction {
        Direction::Inbound => "inbound",
        Direction::Outbound => "outbound",
    }
}

fn parse_message_row(row: &PgRow) -> Result<StoredMessage, StoreError> {
    Ok(StoredMessage {
        id: row.try_get("id")?,
        text: row.try_get("text")?,
        timestamp: row.try_get("timestamp")?,
        wa_id: row.try_get("wa_id")?,
        contact_name: row.try_get("contact_name")?,
        message_type: row.try_get("message_type")?,
        direction: direction_from_text(&row.try_get::<String, _>("direction")?),
        phone_number_id: row.try_get("phone_number_id")?,
        original_message: row.try_get("original_message")?,
        source: source_from_text(row.try_get("source")?),
        broadcast_id: row.try_get("broadcast_id")?,
    })
}

fn parse_contact_row(row: &PgRow) -> Result<Contact, StoreError> {
    Ok(Contact {
        wa_id: row.try_get("wa_id")?,
        contact_name: row.try_get("contact_name")?,
        profile_name: row.try_get("profile_name")?,
        last_message: row.try_get("last_message")?,
        last_message_at: row.try_get("last_message_at")?,
        message_count: row.try_get("message_count")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_flow_row(row: &PgRow) -> Result<Flow, StoreError> {
    Ok(Flow {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        triggers: serde_json::from_str(&row.try_get::<String, _>("triggers")?)?,
        response: row.try_get("response")?,
        is_active: row.try_get("is_active")?,
        priority: row.try_get("priority")?,
        match_mode: MatchMode::parse(&row.try_get::<String, _>("match_mode")?),
        user_id: row.try_get("user_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_keyword_row(row: &PgRow) -> Result<Keyword, StoreError> {
    Ok(Keyword {
        id: row.try_get("id")?,
        keyword: row.try_get("keyword")?,
        response: row.try_get("response")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_broadcast_row(row: &PgRow) -> Result<Broadcast, StoreError> {
    let results = match row.try_get::<Option<String>, _>("results")? {
        Some(raw) => Some(serde_json::from_str(&raw)?),
        None => None,
    };
    Ok(Broadcast {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        message: row.try_get("message")?,
        recipients: serde_json::from_str(&row.try_get::<String, _>("recipients")?)?,
        status: BroadcastStatus::parse(&row.try_get::<String, _>("status")?)
            .unwrap_or(BroadcastStatus::Draft),
        scheduled_for: row.try_get("scheduled_for")?,
        sent_at: row.try_get("sent_at")?,
        results,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl Store for PgStore {
    fn kind(&self) -> &'static str {
        "postgres"
    }

    async fn insert_message(&self, message: &StoredMessage) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO messages (id, wa_id, contact_name, text, message_type, direction, phone_number_id, original_message, source, broadcast_id, timestamp)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&message.id)
        .bind(&message.wa_id)
        .bind(&message.contact_name)
        .bind(&message.text)
        .bind(&message.message_type)
        .bind(direction_text(message.direction))
        .bind(&message.phone_number_id)
        .bind(&message.original_message)
        .bind(message.source.map(MessageSource::as_str))
        .bind(&message.broadcast_id)
        .bind(&message.timestamp)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn messages_for_contact(
        &self,
        wa_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM (
                SELECT * FROM messages WHERE wa_id = $1 ORDER BY timestamp DESC LIMIT $2
             ) recent ORDER BY timestamp ASC",
        )
        .bind(wa_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.db)
        .await?;
        rows.iter().map(parse_message_row).collect()
    }

    async fn upsert_contact(&self, update: &ContactUpdate) -> Result<Contact, StoreError> {
        let now = now_iso();
        let row = sqlx::query(
            "INSERT INTO contacts (wa_id, contact_name, profile_name, last_message, last_message_at, message_count, created_at, updated_at)
             VALUES ($1, $2, $2, $3, $4, 1, $5, $5)
             ON CONFLICT (wa_id) DO UPDATE SET
                contact_name = CASE WHEN EXCLUDED.contact_name <> '' THEN EXCLUDED.contact_name ELSE contacts.contact_name END,
                profile_name = CASE WHEN EXCLUDED.contact_name <> '' THEN EXCLUDED.contact_name ELSE contacts.profile_name END,
                last_message = EXCLUDED.last_message,
                last_message_at = EXCLUDED.last_message_at,
                message_count = contacts.message_count + 1,
                updated_at = EXCLUDED.updated_at
             RETURNING *",
        )
        .bind(&update.wa_id)
        .bind(&update.contact_name)
        .bind(&update.last_message)
        .bind(&update.last_message_at)
        .bind(&now)
        .fetch_one(&self.db)
        .await?;
        parse_contact_row(&row)
    }

    async fn list_contacts(&self) -> Result<Vec<Contact>, StoreError> {
        let rows = sqlx::query("SELECT * FROM contacts ORDER BY last_message_at DESC")
            .fetch_all(&self.db)
            .await?;
        rows.iter().map(parse_contact_row).collect()
    }

    async fn get_contact(&self, wa_id: &str) -> Result<Option<Contact>, StoreError> {
        let row = sqlx::query("SELECT * FROM contacts WHERE wa_id = $1")
            .bind(wa_id)
            .fetch_optional(&self.db)
            .await?;
        row.as_ref().map(parse_contact_row).transpose()
    }

    async fn delete_contact(&self, wa_id: &str) -> Result<bool, StoreError> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM messages WHERE wa_id = $1")
            .bind(wa_id)
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM contacts WHERE wa_id = $1")
            .bind(wa_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(removed > 0)
    }

    async fn list_flows(&self) -> Result<Vec<Flow>, StoreError> {
        let rows = sqlx::query("SELECT * FROM flows ORDER BY updated_at DESC")
            .fetch_all(&self.db)
            .await?;
        rows.iter().map(parse_flow_row).collect()
    }

    async fn get_flow(&self, id: &str) -> Result<Option<Flow>, StoreError> {
        let row = sqlx::query("SELECT * FROM flows WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        row.as_ref().map(parse_flow_row).transpose()
    }

    async fn insert_flow(&self, flow: &Flow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO flows (id, name, triggers, response, is_active, priority, match_mode, user_id, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(&flow.id)
        .bind(&flow.name)
        .bind(serde_json::to_string(&flow.triggers)?)
        .bind(&flow.response)
        .bind(flow.is_active)
        .bind(flow.priority)
        .bind(flow.match_mode.as_str())
        .bind(&flow.user_id)
        .bind(&flow.created_at)
        .bind(&flow.updated_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn update_flow(&self, flow: &Flow) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE flows SET name = $2, triggers = $3, response = $4, is_active = $5, priority = $6, match_mode = $7, updated_at = $8
             WHERE id = $1",
        )
        .bind(&flow.id)
        .bind(&flow.name)
        .bind(serde_json::to_string(&flow.triggers)?)
        .bind(&flow.response)
        .bind(flow.is_active)
        .bind(flow.priority)
        .bind(flow.match_mode.as_str())
        .bind(&flow.updated_at)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_flow(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM flows WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_keywords(&self) -> Result<Vec<Keyword>, StoreError> {
        let rows = sqlx::query("SELECT * FROM keywords ORDER BY created_at ASC")
            .fetch_all(&self.db)
            .await?;
        rows.iter().map(parse_keyword_row).collect()
    }

    async fn get_keyword(&self, id: &str) -> Result<Option<Keyword>, StoreError> {
        let row = sqlx::query("SELECT * FROM keywords WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        row.as_ref().map(parse_keyword_row).transpose()
    }

    async fn insert_keyword(&self, keyword: &Keyword) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO keywords (id, keyword, response, is_active, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&keyword.id)
        .bind(&keyword.keyword)
        .bind(&keyword.response)
        .bind(keyword.is_active)
        .bind(&keyword.created_at)
        .bind(&keyword.updated_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn update_keyword(&self, keyword: &Keyword) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE keywords SET keyword = $2, response = $3, is_active = $4, updated_at = $5 WHERE id = $1",
        )
        .bind(&keyword.id)
        .bind(&keyword.keyword)
        .bind(&keyword.response)
        .bind(keyword.is_active)
        .bind(&keyword.updated_at)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_keyword(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM keywords WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_broadcasts(&self) -> Result<Vec<Broadcast>, StoreError> {
        let rows = sqlx::query("SELECT * FROM broadcasts ORDER BY updated_at DESC")
            .fetch_all(&self.db)
            .await?;
        rows.iter().map(parse_broadcast_row).collect()
    }

    async fn get_broadcast(&self, id: &str) -> Result<Option<Broadcast>, StoreError> {
        let row = sqlx::query("SELECT * FROM broadcasts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        row.as_ref().map(parse_broadcast_row).transpose()
    }

    async fn insert_broadcast(&self, broadcast: &Broadcast) -> Result<(), StoreError> {
        let results = broadcast
            .results
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            "INSERT INTO broadcasts (id, name, message, recipients, status, scheduled_for, sent_at, results, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(&broadcast.id)
        .bind(&broadcast.name)
        .bind(&broadcast.message)
        .bind(serde_json::to_string(&broadcast.recipients)?)
        .bind(broadcast.status.as_str())
        .bind(&broadcast.scheduled_for)
        .bind(&broadcast.sent_at)
        .bind(results)
        .bind(&broadcast.created_at)
        .bind(&broadcast.updated_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn update_broadcast(&self, broadcast: &Broadcast) -> Result<bool, StoreError> {
        let results = broadcast
            .results
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let result = sqlx::query(
            "UPDATE broadcasts SET name = $2, message = $3, recipients = $4, status = $5, scheduled_for = $6, sent_at = $7, results = $8, updated_at = $9
             WHERE id = $1",
        )
        .bind(&broadcast.id)
        .bind(&broadcast.name)
        .bind(&broadcast.message)
        .bind(serde_json::to_string(&broadcast.recipients)?)
        .bind(broadcast.status.as_str())
        .bind(&broadcast.scheduled_for)
        .bind(&broadcast.sent_at)
        .bind(results)
        .bind(&broadcast.updated_at)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_broadcast(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM broadcasts WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_settings(&self) -> Result<Option<Settings>, StoreError> {
        let row = sqlx::query("SELECT data FROM settings WHERE id = $1")
            .bind(SETTINGS_ID)
            .fetch_optional(&self.db)
            .await?;
        match row {
            Some(row) => Ok(Some(serde_json::from_str(
                &row.try_get::<String, _>("data")?,
            )?)),
            None => Ok(None),
        }
    }

    async fn save_settings(&self, settings: &Settings) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO settings (id, data, updated_at) VALUES ($1, $2, $3)
             ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data, updated_at = EXCLUDED.updated_at",
        )
        .bind(SETTINGS_ID)
        .bind(serde_json::to_string(settings)?)
        .bind(now_iso())
        .execute(&self.db)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_source_text_is_dropped() {
        assert_eq!(
            source_from_text(Some("keyword".to_string())),
            Some(MessageSource::Keyword)
        );
        assert_eq!(source_from_text(Some("bogus".to_string())), None);
        assert_eq!(source_from_text(None), None);
    }

    #[test]
    fn direction_round_trips_through_text() {
        for direction in [Direction::Inbound, Direction::Outbound] {
            assert_eq!(direction_from_text(direction_text(direction)), direction);
        }
    }
}
