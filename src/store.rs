use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{postgres::PgRow, PgPool, Row};

use crate::error::StoreError;
use crate::queue::BackgroundQueue;
use crate::types::*;

/// Durable state behind the engine. All methods are single statements; the
/// engine never wraps several of them in a transaction.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_chatbot(&self, chatbot_id: &str) -> Result<Option<Chatbot>, StoreError>;

    async fn get_conversation(&self, conversation_id: &str)
        -> Result<Option<Conversation>, StoreError>;

    /// Idempotent: inserting an id that already exists is a no-op. Fails with
    /// [`StoreError::MissingChatbot`] when the owning chatbot is absent.
    async fn insert_conversation(&self, conversation: &Conversation) -> Result<(), StoreError>;

    /// Fails with [`StoreError::MissingConversation`] when the parent row is absent.
    async fn insert_message(&self, message: &StoredMessage) -> Result<(), StoreError>;

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<StoredMessage>, StoreError>;

    async fn insert_analytics_event(&self, event: &AnalyticsEvent) -> Result<(), StoreError>;

    async fn find_lead(&self, conversation_id: &str) -> Result<Option<Lead>, StoreError>;

    /// Insert or update the single lead of `lead.conversation_id`.
    async fn upsert_lead(&self, lead: &Lead) -> Result<LeadWrite, StoreError>;

    async fn mark_lead_captured(&self, conversation_id: &str) -> Result<(), StoreError>;

    async fn list_sources(&self, tenant_id: &str, limit: usize) -> Result<Vec<Source>, StoreError>;

    async fn list_case_studies(&self) -> Result<Vec<CaseStudy>, StoreError>;

    async fn record_delivery(&self, record: &DeliveryRecord) -> Result<(), StoreError>;
}

/// Store view for background work: each call takes a queue permit for its
/// own duration only, so model and CRM calls made between store calls never
/// hold one.
pub struct BoundedStore {
    inner: Arc<dyn Store>,
    queue: BackgroundQueue,
}

impl BoundedStore {
    pub fn new(inner: Arc<dyn Store>, queue: BackgroundQueue) -> Self {
        Self { inner, queue }
    }
}

#[async_trait]
impl Store for BoundedStore {
    async fn get_chatbot(&self, chatbot_id: &str) -> Result<Option<Chatbot>, StoreError> {
        self.queue.limited(self.inner.get_chatbot(chatbot_id)).await
    }

    async fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        self.queue
            .limited(self.inner.get_conversation(conversation_id))
            .await
    }

    async fn insert_conversation(&self, conversation: &Conversation) -> Result<(), StoreError> {
        self.queue
            .limited(self.inner.insert_conversation(conversation))
            .await
    }

    async fn insert_message(&self, message: &StoredMessage) -> Result<(), StoreError> {
        self.queue.limited(self.inner.insert_message(message)).await
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<StoredMessage>, StoreError> {
        self.queue.limited(self.inner.list_messages(conversation_id)).await
    }

    async fn insert_analytics_event(&self, event: &AnalyticsEvent) -> Result<(), StoreError> {
        self.queue
            .limited(self.inner.insert_analytics_event(event))
            .await
    }

    async fn find_lead(&self, conversation_id: &str) -> Result<Option<Lead>, StoreError> {
        self.queue.limited(self.inner.find_lead(conversation_id)).await
    }

    async fn upsert_lead(&self, lead: &Lead) -> Result<LeadWrite, StoreError> {
        self.queue.limited(self.inner.upsert_lead(lead)).await
    }

    async fn mark_lead_captured(&self, conversation_id: &str) -> Result<(), StoreError> {
        self.queue
            .limited(self.inner.mark_lead_captured(conversation_id))
            .await
    }

    async fn list_sources(&self, tenant_id: &str, limit: usize) -> Result<Vec<Source>, StoreError> {
        self.queue
            .limited(self.inner.list_sources(tenant_id, limit))
            .await
    }

    async fn list_case_studies(&self) -> Result<Vec<CaseStudy>, StoreError> {
        self.queue.limited(self.inner.list_case_studies()).await
    }

    async fn record_delivery(&self, record: &DeliveryRecord) -> Result<(), StoreError> {
        self.queue.limited(self.inner.record_delivery(record)).await
    }
}

pub struct PgStore {
    db: PgPool,
}

impl PgStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

fn json_text<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

fn parse_json_text<T: serde::de::DeserializeOwned + Default>(value: &str) -> T {
    serde_json::from_str(value).unwrap_or_default()
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db_err| db_err.code())
        .map(|code| code == "23503")
        .unwrap_or(false)
}

fn parse_chatbot_row(row: PgRow) -> Chatbot {
    Chatbot {
        id: row.get("id"),
        name: row.get("name"),
        model: row.get("model"),
        temperature: row.get::<f64, _>("temperature") as f32,
        system_instructions: row.get("system_instructions"),
        business_context: row.get("business_context"),
        rag_policy: parse_json_text(&row.get::<String, _>("rag_policy")),
    }
}

fn parse_conversation_row(row: PgRow) -> Conversation {
    Conversation {
        id: row.get("id"),
        chatbot_id: row.get("chatbot_id"),
        visitor_name: row.get("visitor_name"),
        visitor_email: row.get("visitor_email"),
        visitor: parse_json_text(&row.get::<String, _>("visitor_metadata")),
        lead_captured: row.get("lead_captured"),
        message_count: row.get("message_count"),
        created_at: row.get("created_at"),
    }
}

fn parse_message_row(row: PgRow) -> StoredMessage {
    let role: String = row.get("role");
    StoredMessage {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        role: MessageRole::parse(&role).unwrap_or(MessageRole::Assistant),
        content: row.get("content"),
        citations: parse_json_text(&row.get::<String, _>("citations")),
        tool_invocations: parse_json_text(&row.get::<String, _>("tool_invocations")),
        created_at: row.get("created_at"),
    }
}

fn parse_lead_row(row: PgRow) -> Lead {
    Lead {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        chatbot_id: row.get("chatbot_id"),
        status: LeadStatus::parse(&row.get::<String, _>("status")),
        visitor_name: row.get("visitor_name"),
        visitor_email: row.get("visitor_email"),
        data: parse_json_text(&row.get::<String, _>("data")),
        summary: row.get("summary"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[async_trait]
impl Store for PgStore {
    async fn get_chatbot(&self, chatbot_id: &str) -> Result<Option<Chatbot>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, model, temperature, system_instructions, business_context, rag_policy \
             FROM chatbots WHERE id = $1",
        )
        .bind(chatbot_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(parse_chatbot_row))
    }

    async fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query(
            "SELECT id, chatbot_id, visitor_name, visitor_email, visitor_metadata, lead_captured, message_count, created_at \
             FROM conversations WHERE id = $1",
        )
        .bind(conversation_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(parse_conversation_row))
    }

    async fn insert_conversation(&self, conversation: &Conversation) -> Result<(), StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO conversations (
                id, chatbot_id, visitor_name, visitor_email, visitor_metadata, lead_captured, message_count, created_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&conversation.id)
        .bind(&conversation.chatbot_id)
        .bind(&conversation.visitor_name)
        .bind(&conversation.visitor_email)
        .bind(json_text(&conversation.visitor))
        .bind(conversation.lead_captured)
        .bind(conversation.message_count)
        .bind(&conversation.created_at)
        .execute(&self.db)
        .await;
        match inserted {
            Ok(_) => Ok(()),
            Err(err) if is_foreign_key_violation(&err) => {
                Err(StoreError::MissingChatbot(conversation.chatbot_id.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn insert_message(&self, message: &StoredMessage) -> Result<(), StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, role, content, citations, tool_invocations, created_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&message.id)
        .bind(&message.conversation_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(json_text(&message.citations))
        .bind(json_text(&message.tool_invocations))
        .bind(&message.created_at)
        .execute(&self.db)
        .await;
        match inserted {
            Ok(_) => {}
            Err(err) if is_foreign_key_violation(&err) => {
                return Err(StoreError::MissingConversation(
                    message.conversation_id.clone(),
                ))
            }
            Err(err) => return Err(err.into()),
        }
        sqlx::query("UPDATE conversations SET message_count = message_count + 1 WHERE id = $1")
            .bind(&message.conversation_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<StoredMessage>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, role, content, citations, tool_invocations, created_at \
             FROM messages WHERE conversation_id = $1 ORDER BY created_at ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(parse_message_row).collect())
    }

    async fn insert_analytics_event(&self, event: &AnalyticsEvent) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO analytics_events (id, chatbot_id, conversation_id, event_type, payload, created_at) \
             VALUES ($1,$2,$3,$4,$5,$6)",
        )
        .bind(&event.id)
        .bind(&event.chatbot_id)
        .bind(&event.conversation_id)
        .bind(&event.event_type)
        .bind(json_text(&event.payload))
        .bind(&event.created_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn find_lead(&self, conversation_id: &str) -> Result<Option<Lead>, StoreError> {
        let row = sqlx::query(
            "SELECT id, conversation_id, chatbot_id, status, visitor_name, visitor_email, data, summary, created_at, updated_at \
             FROM leads WHERE conversation_id = $1",
        )
        .bind(conversation_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(parse_lead_row))
    }

    async fn upsert_lead(&self, lead: &Lead) -> Result<LeadWrite, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO leads (
                id, conversation_id, chatbot_id, status, visitor_name, visitor_email, data, summary, created_at, updated_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
            ON CONFLICT (conversation_id) DO UPDATE SET
                status = EXCLUDED.status,
                visitor_name = EXCLUDED.visitor_name,
                visitor_email = EXCLUDED.visitor_email,
                data = EXCLUDED.data,
                summary = EXCLUDED.summary,
                updated_at = EXCLUDED.updated_at
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&lead.id)
        .bind(&lead.conversation_id)
        .bind(&lead.chatbot_id)
        .bind(lead.status.as_str())
        .bind(&lead.visitor_name)
        .bind(&lead.visitor_email)
        .bind(json_text(&lead.data))
        .bind(&lead.summary)
        .bind(&lead.created_at)
        .bind(&lead.updated_at)
        .fetch_one(&self.db)
        .await?;
        if row.get::<bool, _>("inserted") {
            Ok(LeadWrite::Inserted)
        } else {
            Ok(LeadWrite::Updated)
        }
    }

    async fn mark_lead_captured(&self, conversation_id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE conversations SET lead_captured = true WHERE id = $1")
            .bind(conversation_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn list_sources(&self, tenant_id: &str, limit: usize) -> Result<Vec<Source>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, tenant_id, title, content, url, updated_at FROM sources \
             WHERE tenant_id = $1 ORDER BY updated_at DESC LIMIT $2",
        )
        .bind(tenant_id)
        .bind(limit as i64)
        .fetch_all(&self.db)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| Source {
                id: row.get("id"),
                tenant_id: row.get("tenant_id"),
                title: row.get("title"),
                content: row.get("content"),
                url: row.get("url"),
                updated_at: row.get("updated_at"),
            })
            .collect())
    }

    async fn list_case_studies(&self) -> Result<Vec<CaseStudy>, StoreError> {
        let rows = sqlx::query("SELECT url, title, description FROM case_studies ORDER BY title ASC")
            .fetch_all(&self.db)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| CaseStudy {
                url: row.get("url"),
                title: row.get("title"),
                description: row.get("description"),
            })
            .collect())
    }

    async fn record_delivery(&self, record: &DeliveryRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO crm_deliveries (id, lead_id, conversation_id, target, status, error, attempted_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7)",
        )
        .bind(&record.id)
        .bind(&record.lead_id)
        .bind(&record.conversation_id)
        .bind(&record.target)
        .bind(record.status.as_str())
        .bind(&record.error)
        .bind(&record.attempted_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }
}

