use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::email::{Mailer, SummaryEmail, SummaryTone};
use crate::error::ToolError;
use crate::model::RawToolCall;
use crate::preview::PreviewFetcher;
use crate::types::{CaseStudy, ToolInvocation};

pub const THINKING: &str = "thinking";
pub const SUGGEST_QUESTIONS: &str = "suggest_questions";
pub const SHOW_CASE_STUDY: &str = "show_case_study";
pub const SEND_EMAIL_SUMMARY: &str = "send_email_summary";

const MAX_SUGGESTED_QUESTIONS: usize = 3;
const MAX_THINKING_STEPS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Complete,
    Active,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkingStep {
    pub title: String,
    pub status: StepStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseStudyInput {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailSummaryInput {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    pub summary: String,
    pub tone: SummaryTone,
}

/// A validated tool call. Each variant carries its own typed payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    Thinking { steps: Vec<ThinkingStep> },
    SuggestQuestions { questions: Vec<String> },
    ShowCaseStudy(CaseStudyInput),
    SendEmailSummary(EmailSummaryInput),
}

#[derive(Deserialize)]
struct ThinkingArgs {
    steps: Vec<ThinkingStep>,
}

#[derive(Deserialize)]
struct SuggestArgs {
    questions: Vec<String>,
}

fn decode<T: serde::de::DeserializeOwned>(tool: &'static str, args: &Value) -> Result<T, ToolError> {
    serde_json::from_value(args.clone()).map_err(|err| ToolError::InvalidInput {
        tool,
        reason: err.to_string(),
    })
}

fn invalid(tool: &'static str, reason: &str) -> ToolError {
    ToolError::InvalidInput {
        tool,
        reason: reason.to_string(),
    }
}

fn looks_like_email(value: &str) -> bool {
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
}

impl ToolCall {
    pub fn parse(name: &str, args: &Value) -> Result<Self, ToolError> {
        match name {
            THINKING => {
                let parsed: ThinkingArgs = decode(THINKING, args)?;
                let steps = parsed
                    .steps
                    .into_iter()
                    .map(|step| ThinkingStep {
                        title: step.title.trim().to_string(),
                        status: step.status,
                    })
                    .filter(|step| !step.title.is_empty())
                    .collect::<Vec<_>>();
                if steps.is_empty() {
                    return Err(invalid(THINKING, "at least one step is required"));
                }
                if steps.len() > MAX_THINKING_STEPS {
                    return Err(invalid(THINKING, "too many steps"));
                }
                Ok(ToolCall::Thinking { steps })
            }
            SUGGEST_QUESTIONS => {
                let parsed: SuggestArgs = decode(SUGGEST_QUESTIONS, args)?;
                let questions = parsed
                    .questions
                    .into_iter()
                    .map(|q| q.trim().to_string())
                    .filter(|q| !q.is_empty())
                    .collect::<Vec<_>>();
                if questions.is_empty() || questions.len() > MAX_SUGGESTED_QUESTIONS {
                    return Err(invalid(SUGGEST_QUESTIONS, "expected 1 to 3 questions"));
                }
                Ok(ToolCall::SuggestQuestions { questions })
            }
            SHOW_CASE_STUDY => {
                let mut parsed: CaseStudyInput = decode(SHOW_CASE_STUDY, args)?;
                parsed.url = parsed.url.trim().to_string();
                if !(parsed.url.starts_with("https://") || parsed.url.starts_with("http://")) {
                    return Err(invalid(SHOW_CASE_STUDY, "url must be absolute http(s)"));
                }
                Ok(ToolCall::ShowCaseStudy(parsed))
            }
            SEND_EMAIL_SUMMARY => {
                let mut parsed: EmailSummaryInput = decode(SEND_EMAIL_SUMMARY, args)?;
                parsed.email = parsed.email.trim().to_string();
                parsed.name = crate::types::non_empty(parsed.name.as_deref());
                if !looks_like_email(&parsed.email) {
                    return Err(invalid(SEND_EMAIL_SUMMARY, "email is not a valid address"));
                }
                if parsed.summary.trim().is_empty() {
                    return Err(invalid(SEND_EMAIL_SUMMARY, "summary is empty"));
                }
                Ok(ToolCall::SendEmailSummary(parsed))
            }
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ToolCall::Thinking { .. } => THINKING,
            ToolCall::SuggestQuestions { .. } => SUGGEST_QUESTIONS,
            ToolCall::ShowCaseStudy(_) => SHOW_CASE_STUDY,
            ToolCall::SendEmailSummary(_) => SEND_EMAIL_SUMMARY,
        }
    }
}

/// Function schemas advertised to the model on every step.
pub fn tool_definitions() -> Vec<Value> {
    vec![
        json!({
            "type": "function",
            "function": {
                "name": THINKING,
                "description": "Show the visitor a short trace of how you are working through their question.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "steps": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "title": { "type": "string" },
                                    "status": { "type": "string", "enum": ["complete", "active", "pending"] }
                                },
                                "required": ["title", "status"]
                            }
                        }
                    },
                    "required": ["steps"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": SUGGEST_QUESTIONS,
                "description": "Offer one to three short follow-up questions the visitor might ask next.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "questions": {
                            "type": "array",
                            "items": { "type": "string" },
                            "minItems": 1,
                            "maxItems": 3
                        }
                    },
                    "required": ["questions"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": SHOW_CASE_STUDY,
                "description": "Show a preview card for one case study. The url must be copied exactly from the case study list.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "url": { "type": "string" },
                        "title": { "type": "string" },
                        "description": { "type": "string" }
                    },
                    "required": ["url", "title", "description"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": SEND_EMAIL_SUMMARY,
                "description": "Email the visitor a summary of the conversation.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "email": { "type": "string" },
                        "name": { "type": "string" },
                        "summary": { "type": "string" },
                        "tone": { "type": "string", "enum": ["alignment", "evaluation", "engaged"] }
                    },
                    "required": ["email", "summary", "tone"]
                }
            }
        }),
    ]
}

fn same_url(a: &str, b: &str) -> bool {
    a.trim().trim_end_matches('/') == b.trim().trim_end_matches('/')
}

/// Model-supplied arguments as JSON; text that is not JSON is kept as a string.
pub fn parse_arguments(arguments: &str) -> Value {
    serde_json::from_str(arguments).unwrap_or_else(|_| Value::String(arguments.to_string()))
}

/// True when the invocation is a summary email that went out.
pub fn is_summary_dispatch(invocation: &ToolInvocation) -> bool {
    invocation.tool_name == SEND_EMAIL_SUMMARY
        && invocation.output.get("success").and_then(Value::as_bool) == Some(true)
}

pub struct ToolBroker {
    preview: Arc<dyn PreviewFetcher>,
    mailer: Arc<dyn Mailer>,
}

impl ToolBroker {
    pub fn new(preview: Arc<dyn PreviewFetcher>, mailer: Arc<dyn Mailer>) -> Self {
        Self { preview, mailer }
    }

    /// Validates and runs one model tool call. Never fails: invalid input and
    /// collaborator errors come back as `{success:false, error}` for the model.
    pub async fn run(&self, raw: &RawToolCall, case_studies: &[CaseStudy]) -> ToolInvocation {
        let input = parse_arguments(&raw.arguments);
        let output = match ToolCall::parse(&raw.name, &input) {
            Ok(call) => {
                tracing::debug!(tool = call.name(), tool_call_id = %raw.id, "running tool");
                self.execute(&call, case_studies).await
            }
            Err(err) => {
                tracing::warn!(tool = %raw.name, tool_call_id = %raw.id, error = %err, "rejected tool call");
                json!({ "success": false, "error": err.to_string() })
            }
        };
        ToolInvocation {
            tool_call_id: raw.id.clone(),
            tool_name: raw.name.clone(),
            input,
            output,
        }
    }

    pub async fn execute(&self, call: &ToolCall, case_studies: &[CaseStudy]) -> Value {
        match call {
            ToolCall::Thinking { steps } => json!({ "success": true, "steps": steps.len() }),
            ToolCall::SuggestQuestions { questions } => {
                json!({ "success": true, "questions": questions })
            }
            ToolCall::ShowCaseStudy(input) => self.show_case_study(input, case_studies).await,
            ToolCall::SendEmailSummary(input) => self.send_email_summary(input).await,
        }
    }

    async fn show_case_study(&self, input: &CaseStudyInput, case_studies: &[CaseStudy]) -> Value {
        let unchanged = json!({
            "success": true,
            "url": input.url,
            "title": input.title,
            "description": input.description,
        });
        if !case_studies.iter().any(|known| same_url(&known.url, &input.url)) {
            tracing::warn!(url = %input.url, "case study url is not in the known list");
            return unchanged;
        }
        match self.preview.fetch(&input.url).await {
            Ok(preview) => json!({
                "success": true,
                "url": input.url,
                "title": preview.title.unwrap_or_else(|| input.title.clone()),
                "description": preview.description.unwrap_or_else(|| input.description.clone()),
                "image": preview.image,
                "siteName": preview.site_name,
            }),
            Err(err) => {
                tracing::debug!(url = %input.url, error = %err, "case study preview failed");
                unchanged
            }
        }
    }

    async fn send_email_summary(&self, input: &EmailSummaryInput) -> Value {
        let email = SummaryEmail {
            to: input.email.clone(),
            name: input.name.clone(),
            summary: input.summary.clone(),
            tone: input.tone,
        };
        match self.mailer.send_summary(&email).await {
            Ok(id) => json!({ "success": true, "id": id }),
            Err(err) => {
                tracing::warn!(tone = input.tone.as_str(), error = %err, "summary email failed");
                json!({ "success": false, "error": err.to_string() })
            }
        }
    }
}
