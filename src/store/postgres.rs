use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};
use tracing::warn;

use crate::{
    error::ChatResult,
    types::{ConversationSummary, CustomerDetails, Message, ProductSnapshot, SenderRole, Topic},
};

use super::MessageStore;

pub struct PgMessageStore {
    db: PgPool,
}

impl PgMessageStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    pub async fn migrate(&self) -> ChatResult<()> {
        sqlx::migrate!("./migrations").run(&self.db).await?;
        Ok(())
    }
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

fn message_from_row(row: &PgRow) -> Option<Message> {
    let id: String = row.get("id");
    let sender_role = match row.get::<String, _>("sender_role").parse::<SenderRole>() {
        Ok(role) => role,
        Err(_) => {
            warn!(message = %id, "skipping stored message with unknown sender role");
            return None;
        }
    };
    let Some(created_at) = parse_time(&row.get::<String, _>("created_at")) else {
        warn!(message = %id, "skipping stored message with unreadable timestamp");
        return None;
    };
    let recommendation = row
        .get::<Option<String>, _>("recommendation")
        .and_then(|raw| serde_json::from_str::<ProductSnapshot>(&raw).ok());

    Some(Message {
        id,
        channel_id: row.get("channel_id"),
        sender_role,
        sender_id: row.get("sender_id"),
        content: row.get("content"),
        created_at,
        recommendation,
    })
}

fn conversation_from_row(row: &PgRow) -> Option<ConversationSummary> {
    let channel_id: String = row.get("channel_id");
    let topic = row.get::<String, _>("topic").parse::<Topic>().ok()?;
    let unread: i32 = row.get("unread_count");
    Some(ConversationSummary {
        channel_id,
        topic,
        customer: CustomerDetails {
            customer_id: row.get("customer_id"),
            name: row.get("customer_name"),
            email: row.get("customer_email"),
        },
        last_message_preview: row.get("last_message_preview"),
        last_message_at: row
            .get::<Option<String>, _>("last_message_at")
            .and_then(|raw| parse_time(&raw)),
        unread_count: u32::try_from(unread).unwrap_or(0),
    })
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn fetch_history(&self, channel_id: &str, limit: usize) -> ChatResult<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT id, channel_id, sender_role, sender_id, content, created_at, recommendation
            FROM (
                SELECT seq, id, channel_id, sender_role, sender_id, content, created_at, recommendation
                FROM chat_messages
                WHERE channel_id = $1
                ORDER BY seq DESC
                LIMIT $2
            ) recent
            ORDER BY seq ASC
            "#,
        )
        .bind(channel_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.db)
        .await?;

        Ok(rows.iter().filter_map(message_from_row).collect())
    }

    async fn append_message(&self, message: &Message) -> ChatResult<()> {
        let recommendation = message
            .recommendation
            .as_ref()
            .and_then(|snapshot| serde_json::to_string(snapshot).ok());
        sqlx::query(
            r#"
            INSERT INTO chat_messages (id, channel_id, sender_role, sender_id, content, created_at, recommendation)
            VALUES ($1,$2,$3,$4,$5,$6,$7)
            ON CONFLICT (channel_id, id) DO NOTHING
            "#,
        )
        .bind(&message.id)
        .bind(&message.channel_id)
        .bind(message.sender_role.as_str())
        .bind(&message.sender_id)
        .bind(&message.content)
        .bind(message.created_at.to_rfc3339())
        .bind(recommendation)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn delete_conversation(&self, channel_id: &str) -> ChatResult<u64> {
        let mut tx = self.db.begin().await?;
        let removed = sqlx::query("DELETE FROM chat_messages WHERE channel_id = $1")
            .bind(channel_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM chat_conversations WHERE channel_id = $1")
            .bind(channel_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(removed)
    }

    async fn load_conversations(&self) -> ChatResult<Vec<ConversationSummary>> {
        let rows = sqlx::query(
            "SELECT channel_id, topic, customer_id, customer_name, customer_email, last_message_preview, last_message_at, unread_count FROM chat_conversations",
        )
        .fetch_all(&self.db)
        .await?;
        Ok(rows.iter().filter_map(conversation_from_row).collect())
    }

    async fn save_conversation(&self, summary: &ConversationSummary) -> ChatResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chat_conversations (
                channel_id, topic, customer_id, customer_name, customer_email,
                last_message_preview, last_message_at, unread_count, updated_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
            ON CONFLICT (channel_id) DO UPDATE SET
                customer_name = EXCLUDED.customer_name,
                customer_email = EXCLUDED.customer_email,
                last_message_preview = EXCLUDED.last_message_preview,
                last_message_at = EXCLUDED.last_message_at,
                unread_count = EXCLUDED.unread_count,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&summary.channel_id)
        .bind(summary.topic.as_str())
        .bind(&summary.customer.customer_id)
        .bind(&summary.customer.name)
        .bind(&summary.customer.email)
        .bind(&summary.last_message_preview)
        .bind(summary.last_message_at.map(|at| at.to_rfc3339()))
        .bind(i32::try_from(summary.unread_count).unwrap_or(i32::MAX))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.db)
        .await?;
        Ok(())
    }
}
