use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;

use crate::config::AlmanacConfig;
use crate::error::CrmError;
use crate::store::Store;
use crate::types::{
    now_iso, AnalyticsEvent, DeliveryRecord, DeliveryStatus, Lead, LeadData, VisitorMetadata,
    EVENT_ALMANAC_SYNCED, EVENT_ALMANAC_SYNC_FAILED,
};

/// Payload pushed to the CRM for one finalized lead.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrmLead {
    pub lead_id: String,
    pub conversation_id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub lead: LeadData,
    pub summary: String,
    pub visitor: VisitorMetadata,
}

impl CrmLead {
    pub fn from_lead(lead: &Lead, visitor: &VisitorMetadata) -> Self {
        Self {
            lead_id: lead.id.clone(),
            conversation_id: lead.conversation_id.clone(),
            name: lead.visitor_name.clone(),
            email: lead.visitor_email.clone(),
            lead: lead.data.clone(),
            summary: lead.summary.clone(),
            visitor: visitor.clone(),
        }
    }
}

#[async_trait]
pub trait CrmClient: Send + Sync {
    fn target(&self) -> &'static str;

    async fn send_lead(&self, lead: &CrmLead) -> Result<(), CrmError>;
}

pub struct AlmanacClient {
    http: reqwest::Client,
    config: AlmanacConfig,
}

impl AlmanacClient {
    pub fn new(http: reqwest::Client, config: AlmanacConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl CrmClient for AlmanacClient {
    fn target(&self) -> &'static str {
        "almanac"
    }

    async fn send_lead(&self, lead: &CrmLead) -> Result<(), CrmError> {
        if self.config.api_url.is_empty() {
            return Err(CrmError::NotConfigured);
        }
        let mut request = self.http.post(&self.config.api_url).json(lead);
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(CrmError::Status { status, body });
        }
        Ok(())
    }
}

/// One delivery attempt per trigger. The outcome is written to
/// `crm_deliveries` and as an analytics event; nothing is retried here.
pub struct CrmPropagator {
    store: Arc<dyn Store>,
    client: Arc<dyn CrmClient>,
}

impl CrmPropagator {
    pub fn new(store: Arc<dyn Store>, client: Arc<dyn CrmClient>) -> Self {
        Self { store, client }
    }

    pub async fn deliver_once(&self, lead: &Lead, visitor: &VisitorMetadata) -> DeliveryStatus {
        let target = self.client.target();
        let result = self
            .client
            .send_lead(&CrmLead::from_lead(lead, visitor))
            .await;

        let (status, error) = match &result {
            Ok(()) => (DeliveryStatus::Delivered, None),
            Err(err) => {
                tracing::warn!(
                    conversation_id = %lead.conversation_id,
                    lead_id = %lead.id,
                    crm = target,
                    error = %err,
                    "lead delivery failed"
                );
                (DeliveryStatus::Failed, Some(err.to_string()))
            }
        };

        let record = DeliveryRecord {
            id: uuid::Uuid::new_v4().to_string(),
            lead_id: lead.id.clone(),
            conversation_id: lead.conversation_id.clone(),
            target: target.to_string(),
            status,
            error: error.clone(),
            attempted_at: now_iso(),
        };
        if let Err(err) = self.store.record_delivery(&record).await {
            tracing::error!(lead_id = %lead.id, error = %err, "failed to record delivery");
        }

        let event = match error {
            Some(error) => AnalyticsEvent::new(
                &lead.chatbot_id,
                Some(&lead.conversation_id),
                EVENT_ALMANAC_SYNC_FAILED,
                json!({ "error": error, "leadId": lead.id }),
            ),
            None => AnalyticsEvent::new(
                &lead.chatbot_id,
                Some(&lead.conversation_id),
                EVENT_ALMANAC_SYNCED,
                json!({ "leadId": lead.id }),
            ),
        };
        if let Err(err) = self.store.insert_analytics_event(&event).await {
            tracing::error!(lead_id = %lead.id, error = %err, "failed to record delivery event");
        }
        status
    }
}
