use std::sync::Arc;

use regex::Regex;
use serde_json::{json, Value};

use crate::config::ChatPolicy;
use crate::crm::CrmPropagator;
use crate::error::StoreError;
use crate::model::{json_object_slice, ModelClient};
use crate::prompting::{
    render_lead_extraction_system_prompt, render_lead_extraction_user_prompt,
    LeadExtractionContext, PromptSource,
};
use crate::store::Store;
use crate::types::{
    non_empty, now_iso, AnalyticsEvent, DeliveryStatus, KnownVisitor, Lead, LeadData, LeadStatus,
    LeadWrite, MessageRole, Source, StoredMessage, EVENT_LEAD_CAPTURED,
};

pub const KNOWLEDGE_SNIPPETS_FOR_EXTRACTION: usize = 20;
const SNIPPET_CHARS: usize = 400;
const MAX_HEURISTIC_NEEDS: usize = 3;
const SCHEDULING_CUES: [&str; 5] = [
    "calendly.com",
    "cal.com",
    "schedule a call",
    "book a call",
    "book a meeting",
];

fn transcript_text(messages: &[StoredMessage]) -> String {
    messages
        .iter()
        .map(|message| {
            let speaker = match message.role {
                MessageRole::User => "Visitor",
                MessageRole::Assistant => "Assistant",
            };
            format!("{speaker}: {}", message.content.trim())
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn is_placeholder(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "null" | "none" | "unknown" | "n/a" | "na" | "not mentioned" | "not provided"
    )
}

fn text_field(value: &Value, key: &str) -> Option<String> {
    let text = match value.get(key)? {
        Value::String(text) => non_empty(Some(text.as_str()))?,
        Value::Number(number) => number.to_string(),
        _ => return None,
    };
    (!is_placeholder(&text)).then_some(text)
}

fn list_field(value: &Value, key: &str) -> Vec<String> {
    let items = match value.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect::<Vec<_>>(),
        Some(Value::String(text)) => vec![text.clone()],
        _ => vec![],
    };
    items
        .into_iter()
        .filter_map(|item| non_empty(Some(item.as_str())))
        .filter(|item| !is_placeholder(item))
        .collect()
}

/// Reads the extraction JSON leniently: numbers become strings, a lone string
/// becomes a one-item list, placeholder values are dropped.
pub fn lead_data_from_value(value: &Value) -> LeadData {
    LeadData {
        name: text_field(value, "name"),
        email: text_field(value, "email"),
        company: text_field(value, "company"),
        phone: text_field(value, "phone"),
        budget: text_field(value, "budget"),
        timeline: text_field(value, "timeline"),
        needs: list_field(value, "needs"),
        pain_points: list_field(value, "painPoints"),
        next_steps: list_field(value, "nextSteps"),
        recommendations: list_field(value, "recommendations"),
        summary: text_field(value, "summary"),
    }
}

fn first_match(pattern: &str, text: &str) -> Option<String> {
    let regex = Regex::new(pattern).ok()?;
    regex
        .find(text)
        .map(|m| m.as_str().trim().to_string())
        .filter(|v| !v.is_empty())
}

fn find_email(text: &str) -> Option<String> {
    first_match(r"(?i)\b[A-Z0-9._%+-]+@[A-Z0-9.-]+\.[A-Z]{2,}\b", text)
}

fn find_budget(text: &str) -> Option<String> {
    first_match(
        r"(?i)\$\s?\d[\d,]*(?:\.\d+)?(?:\s?(?:k|mm|m|million|thousand)\b)?|\b\d[\d,]*(?:\.\d+)?\s?(?:k|mm|m|million|thousand)\b",
        text,
    )
}

fn find_timeline(text: &str) -> Option<String> {
    first_match(
        r"(?i)\b(?:(?:\d+|one|two|three|four|five|six|a few|few|a couple of|couple of)[\s-]+(?:weeks?|months?|quarters?|years?)|next\s+(?:week|month|quarter|year)|this\s+(?:month|quarter|year)|end of (?:the )?(?:month|quarter|year)|q[1-4](?:\s+\d{4})?|asap|right away)\b",
        text,
    )
}

fn find_needs(text: &str) -> Vec<String> {
    let Ok(regex) = Regex::new(
        r"(?i)\b(?:we need|i need|we are looking for|we're looking for|looking for|we want|need help with|struggling with|our problem is)\s+([^.?!\n]{3,120})",
    ) else {
        return vec![];
    };
    let mut needs: Vec<String> = vec![];
    for caps in regex.captures_iter(text) {
        let Some(need) = caps.get(1).map(|m| m.as_str().trim().to_string()) else {
            continue;
        };
        if !need.is_empty() && !needs.contains(&need) {
            needs.push(need);
        }
        if needs.len() == MAX_HEURISTIC_NEEDS {
            break;
        }
    }
    needs
}

/// Deterministic scan of the visitor's own words. Only fills fields that are
/// still empty.
pub fn fill_from_heuristics(data: &mut LeadData, visitor_text: &str) {
    if data.email.is_none() {
        data.email = find_email(visitor_text);
    }
    if data.budget.is_none() {
        data.budget = find_budget(visitor_text);
    }
    if data.timeline.is_none() {
        data.timeline = find_timeline(visitor_text);
    }
    if data.needs.is_empty() && data.pain_points.is_empty() {
        data.needs = find_needs(visitor_text);
    }
}

/// Structured extraction through the model, backed by the heuristic scan when
/// the model is unavailable or leaves fields empty.
pub async fn extract_lead_data(
    model: &dyn ModelClient,
    extraction_model: &str,
    messages: &[StoredMessage],
    sources: &[Source],
    known: &KnownVisitor,
) -> LeadData {
    let contents = sources
        .iter()
        .map(|source| source.content.chars().take(SNIPPET_CHARS).collect::<String>())
        .collect::<Vec<_>>();
    let prompt_sources = sources
        .iter()
        .zip(contents.iter())
        .enumerate()
        .map(|(idx, (source, content))| PromptSource {
            index: idx + 1,
            title: &source.title,
            url: source.url.as_deref(),
            content,
        })
        .collect::<Vec<_>>();
    let transcript = transcript_text(messages);
    let user_prompt = render_lead_extraction_user_prompt(&LeadExtractionContext {
        known_name: known.name.as_deref(),
        known_email: known.email.as_deref(),
        sources: &prompt_sources,
        transcript: &transcript,
    });

    let mut data = match model
        .complete_json(
            extraction_model,
            &render_lead_extraction_system_prompt(),
            &user_prompt,
        )
        .await
    {
        Ok(raw) => match serde_json::from_str::<Value>(json_object_slice(&raw)) {
            Ok(value) => lead_data_from_value(&value),
            Err(err) => {
                tracing::warn!(error = %err, "lead extraction returned invalid JSON");
                LeadData::default()
            }
        },
        Err(err) => {
            tracing::warn!(error = %err, "lead extraction call failed; using heuristics");
            LeadData::default()
        }
    };

    let visitor_text = messages
        .iter()
        .filter(|message| message.role == MessageRole::User)
        .map(|message| message.content.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    fill_from_heuristics(&mut data, &visitor_text);
    data
}

/// Stored contact details fill gaps only; a freshly extracted value wins.
pub fn merge_known_visitor(mut data: LeadData, known: &KnownVisitor) -> LeadData {
    if data.name.is_none() {
        data.name = known.name.clone();
    }
    if data.email.is_none() {
        data.email = known.email.clone();
    }
    data
}

/// Dollar amount of a budget phrase such as `$60k`, `$60,000` or `1.2M`.
/// Ranges resolve to their first figure; a bare first figure borrows the
/// unit of the second (`50-60k`, `50 to 60 thousand`).
pub fn parse_budget_usd(text: &str) -> Option<u64> {
    let figure =
        Regex::new(r"(?i)(\d[\d,]*(?:\.\d+)?)\s*(?:(thousand|million|billion|mm|bn|k|m|b)\b)?").ok()?;
    let connector = Regex::new(r"(?i)^\s*(?:-|\x{2013}|\x{2014}|to|and)\s*\$?\s*$").ok()?;

    let mut figures = figure.captures_iter(text);
    let first = figures.next()?;
    let amount = first.get(1)?.as_str().replace(',', "").parse::<f64>().ok()?;
    let unit = match first.get(2) {
        Some(unit) => Some(unit.as_str()),
        None => figures.next().and_then(|second| {
            let gap = &text[first.get(0)?.end()..second.get(0)?.start()];
            if connector.is_match(gap) {
                second.get(2).map(|unit| unit.as_str())
            } else {
                None
            }
        }),
    };
    let multiplier = match unit.map(str::to_ascii_lowercase).as_deref() {
        Some("k") | Some("thousand") => 1_000.0,
        Some("m") | Some("mm") | Some("million") => 1_000_000.0,
        Some("b") | Some("bn") | Some("billion") => 1_000_000_000.0,
        _ => 1.0,
    };
    Some((amount * multiplier).round() as u64)
}

/// Pure qualification predicate: contact, budget, need and readiness.
pub fn is_qualified_lead(data: &LeadData, policy: &ChatPolicy) -> bool {
    let has_email = data
        .email
        .as_deref()
        .map(|email| email.contains('@'))
        .unwrap_or(false);
    let budget_ok = match data.budget.as_deref() {
        Some(budget) => parse_budget_usd(budget)
            .map(|usd| usd >= policy.min_budget_usd)
            .unwrap_or(true),
        None => false,
    };
    let has_need = !data.needs.is_empty() || !data.pain_points.is_empty();
    let ready = data.timeline.is_some() || !data.next_steps.is_empty();
    has_email && budget_ok && has_need && ready
}

/// Best-effort classifier; a structured `send_email_summary` call is the
/// stronger signal and is checked by the caller.
pub fn looks_like_final_summary(text: &str, policy: &ChatPolicy) -> bool {
    let lower = text.to_lowercase();
    if !lower.contains("summary") {
        return false;
    }
    let link = policy.scheduling_link.trim().to_lowercase();
    (!link.is_empty() && lower.contains(&link))
        || SCHEDULING_CUES.iter().any(|cue| lower.contains(cue))
}

/// Status the lead row should be written with this turn, or `None` when
/// nothing is written. Finalized never moves back.
pub fn next_transition(
    current: Option<LeadStatus>,
    qualified: bool,
    final_summary: bool,
) -> Option<LeadStatus> {
    match current {
        None | Some(LeadStatus::Unqualified) => match (qualified, final_summary) {
            (false, _) => None,
            (true, false) => Some(LeadStatus::Qualified),
            (true, true) => Some(LeadStatus::Finalized),
        },
        Some(LeadStatus::Qualified) => {
            if final_summary {
                Some(LeadStatus::Finalized)
            } else if qualified {
                Some(LeadStatus::Qualified)
            } else {
                None
            }
        }
        Some(LeadStatus::Finalized) => {
            (qualified || final_summary).then_some(LeadStatus::Finalized)
        }
    }
}

fn describe_lead(data: &LeadData) -> String {
    let mut parts = vec![];
    if let Some(company) = &data.company {
        parts.push(format!("Company: {company}."));
    }
    if !data.needs.is_empty() {
        parts.push(format!("Needs: {}.", data.needs.join("; ")));
    }
    if !data.pain_points.is_empty() {
        parts.push(format!("Pain points: {}.", data.pain_points.join("; ")));
    }
    if let Some(budget) = &data.budget {
        parts.push(format!("Budget: {budget}."));
    }
    if let Some(timeline) = &data.timeline {
        parts.push(format!("Timeline: {timeline}."));
    }
    parts.join(" ")
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeadOutcome {
    pub qualified: bool,
    pub status: Option<LeadStatus>,
    pub write: Option<LeadWrite>,
    pub delivery: Option<DeliveryStatus>,
}

pub struct LeadQualifier {
    store: Arc<dyn Store>,
    model: Arc<dyn ModelClient>,
    crm: CrmPropagator,
    policy: ChatPolicy,
    extraction_model: String,
}

impl LeadQualifier {
    pub fn new(
        store: Arc<dyn Store>,
        model: Arc<dyn ModelClient>,
        crm: CrmPropagator,
        policy: ChatPolicy,
        extraction_model: &str,
    ) -> Self {
        Self {
            store,
            model,
            crm,
            policy,
            extraction_model: extraction_model.to_string(),
        }
    }

    /// Re-evaluates the conversation and applies the resulting lead write.
    /// `summary_sent` is set when a summary email went out this turn.
    pub async fn process(
        &self,
        chatbot_id: &str,
        conversation_id: &str,
        assistant_text: &str,
        summary_sent: bool,
    ) -> Result<LeadOutcome, StoreError> {
        let Some(conversation) = self.store.get_conversation(conversation_id).await? else {
            return Err(StoreError::MissingConversation(conversation_id.to_string()));
        };
        let messages = self.store.list_messages(conversation_id).await?;
        let sources = self
            .store
            .list_sources(chatbot_id, KNOWLEDGE_SNIPPETS_FOR_EXTRACTION)
            .await?;
        let known = conversation.known_visitor();

        let extracted = extract_lead_data(
            self.model.as_ref(),
            &self.extraction_model,
            &messages,
            &sources,
            &known,
        )
        .await;
        let data = merge_known_visitor(extracted, &known);
        let qualified = is_qualified_lead(&data, &self.policy);
        let final_summary = summary_sent || looks_like_final_summary(assistant_text, &self.policy);

        let existing = self.store.find_lead(conversation_id).await?;
        let current = existing.as_ref().map(|lead| lead.status);
        let Some(status) = next_transition(current, qualified, final_summary) else {
            return Ok(LeadOutcome {
                qualified,
                status: current,
                write: None,
                delivery: None,
            });
        };

        let now = now_iso();
        let summary = if final_summary && !assistant_text.trim().is_empty() {
            assistant_text.trim().to_string()
        } else if let Some(prev) = existing
            .as_ref()
            .filter(|lead| lead.status == LeadStatus::Finalized)
        {
            prev.summary.clone()
        } else {
            data.summary.clone().unwrap_or_else(|| describe_lead(&data))
        };
        let lead = Lead {
            id: existing
                .as_ref()
                .map(|lead| lead.id.clone())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            conversation_id: conversation_id.to_string(),
            chatbot_id: chatbot_id.to_string(),
            status,
            visitor_name: data.name.clone(),
            visitor_email: data.email.clone(),
            data,
            summary,
            created_at: existing
                .as_ref()
                .map(|lead| lead.created_at.clone())
                .unwrap_or_else(|| now.clone()),
            updated_at: now,
        };

        let write = self.store.upsert_lead(&lead).await?;
        tracing::info!(
            conversation_id,
            chatbot_id,
            lead_id = %lead.id,
            status = status.as_str(),
            inserted = write == LeadWrite::Inserted,
            "lead saved"
        );

        if write == LeadWrite::Inserted {
            self.store.mark_lead_captured(conversation_id).await?;
            let event = AnalyticsEvent::new(
                chatbot_id,
                Some(conversation_id),
                EVENT_LEAD_CAPTURED,
                json!({ "leadId": lead.id, "status": status.as_str() }),
            );
            if let Err(err) = self.store.insert_analytics_event(&event).await {
                tracing::error!(conversation_id, error = %err, "failed to record lead capture");
            }
        }

        let delivery = if status == LeadStatus::Finalized && current != Some(LeadStatus::Finalized) {
            Some(self.crm.deliver_once(&lead, &conversation.visitor).await)
        } else {
            None
        };

        Ok(LeadOutcome {
            qualified,
            status: Some(status),
            write: Some(write),
            delivery,
        })
    }
}

#[cfg(test)]
#[path = "leads_test.rs"]
mod tests;
