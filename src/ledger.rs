use std::sync::Arc;

use futures_util::future::{self, BoxFuture, FutureExt, Shared};
use serde_json::json;

use crate::queue::BackgroundQueue;
use crate::store::Store;
use crate::types::{
    AnalyticsEvent, Citation, Conversation, MessageRole, StoredMessage, ToolInvocation,
    EVENT_CHAT_TURN,
};

/// Resolves to `true` once the row it guards is durable. Cloning is cheap and
/// every clone observes the same outcome.
pub type WriteHandle = Shared<BoxFuture<'static, bool>>;

fn settled(ok: bool) -> WriteHandle {
    future::ready(ok).boxed().shared()
}

/// What the router hands over once generation for a turn is over.
#[derive(Debug, Clone)]
pub struct TurnRecord {
    pub chatbot_id: String,
    pub conversation_id: String,
    pub assistant_text: String,
    pub citations: Vec<Citation>,
    pub tool_invocations: Vec<ToolInvocation>,
    pub message_count: usize,
    pub finish_reason: &'static str,
}

/// Owns conversation, message and analytics writes. Every write runs on the
/// background queue and is logged on failure; nothing here can fail a turn.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn Store>,
    queue: BackgroundQueue,
}

impl Ledger {
    pub fn new(store: Arc<dyn Store>, queue: BackgroundQueue) -> Self {
        Self { store, queue }
    }

    /// Starts creating `conversation` unless it already exists. The id is
    /// usable right away; the returned handle settles when the row does.
    pub fn ensure_conversation(&self, conversation: Conversation, exists: bool) -> WriteHandle {
        if exists {
            return settled(true);
        }
        let store = self.store.clone();
        let queue = self.queue.clone();
        let insert = async move {
            match queue.limited(store.insert_conversation(&conversation)).await {
                Ok(()) => true,
                Err(err) => {
                    tracing::error!(
                        conversation_id = %conversation.id,
                        chatbot_id = %conversation.chatbot_id,
                        error = %err,
                        "failed to create conversation"
                    );
                    false
                }
            }
        }
        .boxed()
        .shared();
        self.drive("insert_conversation", insert.clone());
        insert
    }

    /// Inserts the user message once `conversation` has settled, never before.
    pub fn record_user_message(&self, conversation: WriteHandle, message: StoredMessage) -> WriteHandle {
        let store = self.store.clone();
        let queue = self.queue.clone();
        let insert = async move {
            if !conversation.await {
                tracing::warn!(
                    conversation_id = %message.conversation_id,
                    "conversation missing; user message dropped"
                );
                return false;
            }
            match queue.limited(store.insert_message(&message)).await {
                Ok(()) => true,
                Err(err) => {
                    tracing::error!(
                        conversation_id = %message.conversation_id,
                        error = %err,
                        "failed to persist user message"
                    );
                    false
                }
            }
        }
        .boxed()
        .shared();
        self.drive("insert_user_message", insert.clone());
        insert
    }

    /// Persists the assistant message and then the turn's analytics event,
    /// strictly in that order and after the user message. Returns whether the
    /// conversation is durable, which gates lead extraction.
    pub async fn finalize_turn(&self, user_message: WriteHandle, record: &TurnRecord) -> bool {
        if !user_message.await {
            return false;
        }

        let mut message = StoredMessage::new(
            &record.conversation_id,
            MessageRole::Assistant,
            &record.assistant_text,
        );
        message.citations = record.citations.clone();
        message.tool_invocations = record.tool_invocations.clone();
        if let Err(err) = self.queue.limited(self.store.insert_message(&message)).await {
            tracing::error!(
                conversation_id = %record.conversation_id,
                chatbot_id = %record.chatbot_id,
                error = %err,
                "failed to persist assistant message"
            );
        }

        let event = AnalyticsEvent::new(
            &record.chatbot_id,
            Some(&record.conversation_id),
            EVENT_CHAT_TURN,
            json!({
                "messageCount": record.message_count,
                "sourcesUsed": record.citations.len(),
                "toolCalls": record
                    .tool_invocations
                    .iter()
                    .map(|inv| inv.tool_name.as_str())
                    .collect::<Vec<_>>(),
                "finishReason": record.finish_reason,
            }),
        );
        if let Err(err) = self.queue.limited(self.store.insert_analytics_event(&event)).await {
            tracing::error!(
                conversation_id = %record.conversation_id,
                chatbot_id = %record.chatbot_id,
                error = %err,
                "failed to record turn analytics"
            );
        }
        true
    }

    fn drive(&self, label: &'static str, handle: WriteHandle) {
        self.queue.spawn(label, async move {
            handle.await;
        });
    }
}
