//! In-memory fakes for the collaborator traits. Test builds only.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::crm::{CrmClient, CrmLead};
use crate::email::{Mailer, SummaryEmail};
use crate::error::{CrmError, EmailError, ModelError, PreviewError, RetrievalError, StoreError};
use crate::model::{CompletionRequest, ModelClient, StepOutput};
use crate::preview::{PagePreview, PreviewFetcher};
use crate::retrieval::KnowledgeRetriever;
use crate::store::Store;
use crate::types::*;

pub fn chatbot(id: &str) -> Chatbot {
    Chatbot {
        id: id.to_string(),
        name: "Ava".to_string(),
        model: "gpt-test".to_string(),
        temperature: 0.3,
        system_instructions: "Qualify B2B visitors.".to_string(),
        business_context: "Acme builds retail analytics.".to_string(),
        rag_policy: RagPolicy::default(),
    }
}

pub fn retrieved(id: &str, title: &str, similarity: f64, updated_at: &str) -> RetrievedSource {
    RetrievedSource {
        source: Source {
            id: id.to_string(),
            tenant_id: "bot-1".to_string(),
            title: title.to_string(),
            content: format!("{title} details."),
            url: Some(format!("https://acme.test/{id}")),
            updated_at: updated_at.to_string(),
        },
        similarity,
    }
}

pub fn sample_lead(conversation_id: &str) -> Lead {
    Lead {
        id: "lead-1".to_string(),
        conversation_id: conversation_id.to_string(),
        chatbot_id: "bot-1".to_string(),
        status: LeadStatus::Finalized,
        visitor_name: Some("Dana".to_string()),
        visitor_email: Some("dana@corp.test".to_string()),
        data: LeadData {
            email: Some("dana@corp.test".to_string()),
            budget: Some("$60k".to_string()),
            timeline: Some("2 months".to_string()),
            needs: vec!["analytics dashboard".to_string()],
            ..LeadData::default()
        },
        summary: "Retailer wants a dashboard.".to_string(),
        created_at: now_iso(),
        updated_at: now_iso(),
    }
}

#[derive(Default)]
struct MemoryState {
    chatbots: HashMap<String, Chatbot>,
    conversations: HashMap<String, Conversation>,
    messages: Vec<StoredMessage>,
    events: Vec<AnalyticsEvent>,
    leads: Vec<Lead>,
    sources: Vec<Source>,
    case_studies: Vec<CaseStudy>,
    deliveries: Vec<DeliveryRecord>,
    ops: Vec<String>,
}

/// Store fake with the same foreign-key rules as the Postgres schema and a
/// log of every applied write, in order.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    conversation_delay: Duration,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every conversation insert sleeps this long before it is applied.
    pub fn with_conversation_delay(mut self, delay: Duration) -> Self {
        self.conversation_delay = delay;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap()
    }

    pub fn add_chatbot(&self, chatbot: Chatbot) {
        self.state().chatbots.insert(chatbot.id.clone(), chatbot);
    }

    pub fn add_conversation(&self, conversation: Conversation) {
        self.state()
            .conversations
            .insert(conversation.id.clone(), conversation);
    }

    pub fn add_message(&self, message: StoredMessage) {
        self.state().messages.push(message);
    }

    pub fn add_source(&self, source: Source) {
        self.state().sources.push(source);
    }

    pub fn add_case_study(&self, case_study: CaseStudy) {
        self.state().case_studies.push(case_study);
    }

    pub fn ops(&self) -> Vec<String> {
        self.state().ops.clone()
    }

    pub fn conversation(&self, id: &str) -> Option<Conversation> {
        self.state().conversations.get(id).cloned()
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<StoredMessage> {
        self.state()
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    pub fn events(&self) -> Vec<AnalyticsEvent> {
        self.state().events.clone()
    }

    pub fn leads(&self) -> Vec<Lead> {
        self.state().leads.clone()
    }

    pub fn deliveries(&self) -> Vec<DeliveryRecord> {
        self.state().deliveries.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_chatbot(&self, chatbot_id: &str) -> Result<Option<Chatbot>, StoreError> {
        Ok(self.state().chatbots.get(chatbot_id).cloned())
    }

    async fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        Ok(self.conversation(conversation_id))
    }

    async fn insert_conversation(&self, conversation: &Conversation) -> Result<(), StoreError> {
        if !self.conversation_delay.is_zero() {
            tokio::time::sleep(self.conversation_delay).await;
        }
        let mut state = self.state();
        if !state.chatbots.contains_key(&conversation.chatbot_id) {
            return Err(StoreError::MissingChatbot(conversation.chatbot_id.clone()));
        }
        if state.conversations.contains_key(&conversation.id) {
            return Ok(());
        }
        state
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        state.ops.push(format!("insert_conversation:{}", conversation.id));
        Ok(())
    }

    async fn insert_message(&self, message: &StoredMessage) -> Result<(), StoreError> {
        let mut state = self.state();
        let Some(conversation) = state.conversations.get_mut(&message.conversation_id) else {
            return Err(StoreError::MissingConversation(
                message.conversation_id.clone(),
            ));
        };
        conversation.message_count += 1;
        state.messages.push(message.clone());
        state.ops.push(format!(
            "insert_message:{}:{}",
            message.conversation_id,
            message.role.as_str()
        ));
        Ok(())
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<StoredMessage>, StoreError> {
        let mut messages = self.messages(conversation_id);
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(messages)
    }

    async fn insert_analytics_event(&self, event: &AnalyticsEvent) -> Result<(), StoreError> {
        let mut state = self.state();
        state.events.push(event.clone());
        state
            .ops
            .push(format!("insert_analytics_event:{}", event.event_type));
        Ok(())
    }

    async fn find_lead(&self, conversation_id: &str) -> Result<Option<Lead>, StoreError> {
        Ok(self
            .state()
            .leads
            .iter()
            .find(|lead| lead.conversation_id == conversation_id)
            .cloned())
    }

    async fn upsert_lead(&self, lead: &Lead) -> Result<LeadWrite, StoreError> {
        let mut state = self.state();
        if let Some(existing) = state
            .leads
            .iter_mut()
            .find(|row| row.conversation_id == lead.conversation_id)
        {
            let id = existing.id.clone();
            let created_at = existing.created_at.clone();
            *existing = Lead {
                id,
                created_at,
                ..lead.clone()
            };
            return Ok(LeadWrite::Updated);
        }
        state.leads.push(lead.clone());
        Ok(LeadWrite::Inserted)
    }

    async fn mark_lead_captured(&self, conversation_id: &str) -> Result<(), StoreError> {
        if let Some(conversation) = self.state().conversations.get_mut(conversation_id) {
            conversation.lead_captured = true;
        }
        Ok(())
    }

    async fn list_sources(&self, tenant_id: &str, limit: usize) -> Result<Vec<Source>, StoreError> {
        let mut sources = self
            .state()
            .sources
            .iter()
            .filter(|source| source.tenant_id == tenant_id)
            .cloned()
            .collect::<Vec<_>>();
        sources.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        sources.truncate(limit);
        Ok(sources)
    }

    async fn list_case_studies(&self) -> Result<Vec<CaseStudy>, StoreError> {
        let mut studies = self.state().case_studies.clone();
        studies.sort_by(|a, b| a.title.cmp(&b.title));
        Ok(studies)
    }

    async fn record_delivery(&self, record: &DeliveryRecord) -> Result<(), StoreError> {
        self.state().deliveries.push(record.clone());
        Ok(())
    }
}

pub struct CountingRetriever {
    hits: Vec<RetrievedSource>,
    calls: AtomicUsize,
    stall: bool,
}

impl CountingRetriever {
    pub fn new(hits: Vec<RetrievedSource>) -> Self {
        Self {
            hits,
            calls: AtomicUsize::new(0),
            stall: false,
        }
    }

    /// Retrieval that never answers, like a hung embeddings endpoint.
    pub fn stalled() -> Self {
        Self {
            stall: true,
            ..Self::new(vec![])
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KnowledgeRetriever for CountingRetriever {
    async fn retrieve(
        &self,
        _tenant_id: &str,
        _query: &str,
        _limit: usize,
        _min_similarity: f64,
    ) -> Result<Vec<RetrievedSource>, RetrievalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.stall {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(self.hits.clone())
    }
}

/// Plays back canned generation steps in order. Once the script runs out,
/// every further step is a plain `stop`.
#[derive(Default)]
pub struct ScriptedModel {
    steps: Mutex<VecDeque<StepOutput>>,
    json_reply: Option<String>,
    stall: bool,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedModel {
    pub fn new(steps: Vec<StepOutput>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            ..Self::default()
        }
    }

    /// Generation never returns, for exercising the turn timeout.
    pub fn stalled() -> Self {
        Self {
            stall: true,
            ..Self::default()
        }
    }

    pub fn with_json(mut self, reply: &str) -> Self {
        self.json_reply = Some(reply.to_string());
        self
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn stream_step(
        &self,
        request: &CompletionRequest,
        deltas: mpsc::Sender<String>,
    ) -> Result<StepOutput, ModelError> {
        self.requests.lock().unwrap().push(request.clone());
        if self.stall {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        let step = self.steps.lock().unwrap().pop_front();
        let step = step.unwrap_or_else(|| StepOutput {
            finish_reason: Some("stop".to_string()),
            ..StepOutput::default()
        });
        if !step.text.is_empty() {
            let _ = deltas.send(step.text.clone()).await;
        }
        Ok(step)
    }

    async fn complete_json(
        &self,
        _model: &str,
        _system: &str,
        _user: &str,
    ) -> Result<String, ModelError> {
        self.json_reply.clone().ok_or(ModelError::MissingApiKey)
    }
}

pub struct StaticPreview {
    preview: Option<PagePreview>,
    calls: AtomicUsize,
}

impl StaticPreview {
    pub fn ok(preview: PagePreview) -> Self {
        Self {
            preview: Some(preview),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            preview: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PreviewFetcher for StaticPreview {
    async fn fetch(&self, _url: &str) -> Result<PagePreview, PreviewError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.preview.clone().ok_or(PreviewError::Status(503))
    }
}

#[derive(Default)]
pub struct RecordingMailer {
    fail: bool,
    sent: Mutex<Vec<SummaryEmail>>,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<SummaryEmail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send_summary(&self, email: &SummaryEmail) -> Result<Option<String>, EmailError> {
        if self.fail {
            return Err(EmailError::NotConfigured);
        }
        self.sent.lock().unwrap().push(email.clone());
        Ok(Some("email_test".to_string()))
    }
}

#[derive(Default)]
pub struct RecordingCrm {
    fail: bool,
    stall: bool,
    sent: Mutex<Vec<CrmLead>>,
    calls: AtomicUsize,
}

impl RecordingCrm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Delivery that hangs once called.
    pub fn stalled() -> Self {
        Self {
            stall: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<CrmLead> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl CrmClient for RecordingCrm {
    fn target(&self) -> &'static str {
        "almanac"
    }

    async fn send_lead(&self, lead: &CrmLead) -> Result<(), CrmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.stall {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.fail {
            return Err(CrmError::Status {
                status: 502,
                body: "bad gateway".to_string(),
            });
        }
        self.sent.lock().unwrap().push(lead.clone());
        Ok(())
    }
}
