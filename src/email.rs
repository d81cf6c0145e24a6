use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::EmailConfig;
use crate::error::EmailError;
use crate::prompting::{render_summary_email, SummaryEmailContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryTone {
    Alignment,
    Evaluation,
    Engaged,
}

impl SummaryTone {
    pub fn as_str(self) -> &'static str {
        match self {
            SummaryTone::Alignment => "alignment",
            SummaryTone::Evaluation => "evaluation",
            SummaryTone::Engaged => "engaged",
        }
    }

    pub fn subject(self) -> &'static str {
        match self {
            SummaryTone::Alignment => "Recap and next steps from our conversation",
            SummaryTone::Evaluation => "Your evaluation summary",
            SummaryTone::Engaged => "Summary of what we discussed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryEmail {
    pub to: String,
    pub name: Option<String>,
    pub summary: String,
    pub tone: SummaryTone,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    /// Sends the summary and returns the provider message id when there is one.
    async fn send_summary(&self, email: &SummaryEmail) -> Result<Option<String>, EmailError>;
}

pub struct HttpMailer {
    http: reqwest::Client,
    config: EmailConfig,
    scheduling_link: String,
}

impl HttpMailer {
    pub fn new(http: reqwest::Client, config: EmailConfig, scheduling_link: &str) -> Self {
        Self {
            http,
            config,
            scheduling_link: scheduling_link.to_string(),
        }
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send_summary(&self, email: &SummaryEmail) -> Result<Option<String>, EmailError> {
        if self.config.api_key.is_empty() || self.config.from.is_empty() {
            return Err(EmailError::NotConfigured);
        }
        let html = render_summary_email(&SummaryEmailContext {
            heading: email.tone.subject(),
            recipient_name: email.name.as_deref(),
            summary: &email.summary,
            scheduling_link: &self.scheduling_link,
        });
        let response = self
            .http
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&json!({
                "from": self.config.from,
                "to": [email.to],
                "subject": email.tone.subject(),
                "html": html,
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(EmailError::Status { status, body });
        }
        let payload = response.json::<Value>().await.unwrap_or(Value::Null);
        Ok(payload
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string))
    }
}
