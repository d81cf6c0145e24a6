use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const EVENT_CHAT_TURN: &str = "chat_turn";
pub const EVENT_LEAD_CAPTURED: &str = "lead_captured";
pub const EVENT_ALMANAC_SYNCED: &str = "almanac_synced";
pub const EVENT_ALMANAC_SYNC_FAILED: &str = "almanac_sync_failed";

/// Fixed-width RFC 3339 timestamp, so lexical order matches creation order.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chatbot {
    pub id: String,
    pub name: String,
    pub model: String,
    pub temperature: f32,
    pub system_instructions: String,
    pub business_context: String,
    #[serde(default)]
    pub rag_policy: RagPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CitationStyle {
    #[default]
    Inline,
    Footnote,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RagPolicy {
    pub enable_citations: bool,
    pub enable_case_studies: bool,
    pub citation_style: CitationStyle,
    pub custom_instructions: String,
}

impl Default for RagPolicy {
    fn default() -> Self {
        Self {
            enable_citations: true,
            enable_case_studies: true,
            citation_style: CitationStyle::Inline,
            custom_instructions: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VisitorMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub chatbot_id: String,
    pub visitor_name: Option<String>,
    pub visitor_email: Option<String>,
    #[serde(default)]
    pub visitor: VisitorMetadata,
    pub lead_captured: bool,
    pub message_count: i32,
    pub created_at: String,
}

impl Conversation {
    pub fn new(id: &str, chatbot_id: &str, visitor: VisitorMetadata) -> Self {
        Self {
            id: id.to_string(),
            chatbot_id: chatbot_id.to_string(),
            visitor_name: None,
            visitor_email: None,
            visitor,
            lead_captured: false,
            message_count: 0,
            created_at: now_iso(),
        }
    }

    pub fn known_visitor(&self) -> KnownVisitor {
        KnownVisitor {
            name: non_empty(self.visitor_name.as_deref()),
            email: non_empty(self.visitor_email.as_deref()),
        }
    }
}

/// Contact details already on file for a conversation, usually from an intro form.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KnownVisitor {
    pub name: Option<String>,
    pub email: Option<String>,
}

impl KnownVisitor {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.email.is_none()
    }
}

pub fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    pub index: usize,
    pub source_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub tool_call_id: String,
    pub tool_name: String,
    pub input: Value,
    pub output: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub citations: Vec<Citation>,
    #[serde(default)]
    pub tool_invocations: Vec<ToolInvocation>,
    pub created_at: String,
}

impl StoredMessage {
    pub fn new(conversation_id: &str, role: MessageRole, content: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role,
            content: content.to_string(),
            citations: vec![],
            tool_invocations: vec![],
            created_at: now_iso(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub id: String,
    /// Knowledge is scoped per chatbot; this holds the owning chatbot id.
    pub tenant_id: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub url: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievedSource {
    #[serde(flatten)]
    pub source: Source,
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseStudy {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
}

/// Structured attributes pulled out of a transcript.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LeadData {
    pub name: Option<String>,
    pub email: Option<String>,
    pub company: Option<String>,
    pub phone: Option<String>,
    pub budget: Option<String>,
    pub timeline: Option<String>,
    pub needs: Vec<String>,
    pub pain_points: Vec<String>,
    pub next_steps: Vec<String>,
    pub recommendations: Vec<String>,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeadStatus {
    Unqualified,
    Qualified,
    Finalized,
}

impl LeadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LeadStatus::Unqualified => "unqualified",
            LeadStatus::Qualified => "qualified",
            LeadStatus::Finalized => "finalized",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "qualified" => LeadStatus::Qualified,
            "finalized" => LeadStatus::Finalized,
            _ => LeadStatus::Unqualified,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lead {
    pub id: String,
    pub conversation_id: String,
    pub chatbot_id: String,
    pub status: LeadStatus,
    pub visitor_name: Option<String>,
    pub visitor_email: Option<String>,
    pub data: LeadData,
    pub summary: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Outcome of a conversation-keyed lead upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadWrite {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsEvent {
    pub id: String,
    pub chatbot_id: String,
    pub conversation_id: Option<String>,
    pub event_type: String,
    pub payload: Value,
    pub created_at: String,
}

impl AnalyticsEvent {
    pub fn new(chatbot_id: &str, conversation_id: Option<&str>, event_type: &str, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            chatbot_id: chatbot_id.to_string(),
            conversation_id: conversation_id.map(str::to_string),
            event_type: event_type.to_string(),
            payload,
            created_at: now_iso(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRecord {
    pub id: String,
    pub lead_id: String,
    pub conversation_id: String,
    pub target: String,
    pub status: DeliveryStatus,
    pub error: Option<String>,
    pub attempted_at: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub messages: Vec<UiMessage>,
    #[serde(default)]
    pub chatbot_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessagePart {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

impl UiMessage {
    /// Plain text of the message. Text parts are joined with newlines; a flat
    /// `content` string is used when the message has no text parts.
    pub fn plain_text(&self) -> String {
        let texts = self
            .parts
            .iter()
            .filter_map(|part| match part {
                MessagePart::Text { text } => Some(text.as_str()),
                MessagePart::Other => None,
            })
            .collect::<Vec<_>>();
        if !texts.is_empty() {
            return texts.join("\n");
        }
        self.content.clone().unwrap_or_default()
    }
}

/// One entry of the `X-Sources-Used` response header.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceUsed {
    pub index: usize,
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub snippet: String,
}
