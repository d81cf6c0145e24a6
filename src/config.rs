use std::{env, str::FromStr, time::Duration};

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub database_url: String,
    pub default_chatbot_id: Option<String>,
    pub openai: OpenAiConfig,
    pub retrieval_limit: usize,
    pub retrieval_min_similarity: f64,
    pub turn_timeout: Duration,
    pub retrieval_timeout: Duration,
    pub http_timeout: Duration,
    pub max_generation_steps: usize,
    pub lead_trigger_turns: usize,
    pub background_concurrency: usize,
    pub email: EmailConfig,
    pub almanac: AlmanacConfig,
    pub policy: ChatPolicy,
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub chat_model: String,
    pub extraction_model: String,
    pub embedding_model: String,
}

#[derive(Debug, Clone, Default)]
pub struct EmailConfig {
    pub api_url: String,
    pub api_key: String,
    pub from: String,
}

#[derive(Debug, Clone, Default)]
pub struct AlmanacConfig {
    pub api_url: String,
    pub api_key: String,
}

/// Conversation policy injected into prompt assembly and lead qualification.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ChatPolicy {
    pub persona: String,
    pub disqualification_rules: Vec<String>,
    pub scheduling_link: String,
    pub summary_templates: SummaryTemplates,
    pub min_budget_usd: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SummaryTemplates {
    pub alignment: String,
    pub evaluation: String,
    pub engaged: String,
}

impl Default for SummaryTemplates {
    fn default() -> Self {
        Self {
            alignment: "Recap the shared goals, the agreed scope and the proposed next step. Close with the scheduling link.".to_string(),
            evaluation: "Recap what the visitor is evaluating, the open questions and the criteria they mentioned. Offer the scheduling link for a deeper review.".to_string(),
            engaged: "Recap the visitor's needs, budget and timeline, then propose a call using the scheduling link.".to_string(),
        }
    }
}

impl Default for ChatPolicy {
    fn default() -> Self {
        Self {
            persona: "You are a friendly, sharp sales engineer. Answer from the knowledge provided, keep replies short, and ask at most one question per message.".to_string(),
            disqualification_rules: vec![
                "Job seekers and recruiters: point them to the careers page and do not qualify them.".to_string(),
                "Students asking for homework help: answer briefly and do not ask for contact details.".to_string(),
                "Vendors pitching their own services: thank them and end politely.".to_string(),
            ],
            scheduling_link: String::new(),
            summary_templates: SummaryTemplates::default(),
            min_budget_usd: 10_000,
        }
    }
}

impl ChatPolicy {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::PolicyRead {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::PolicyParse {
            path: path.to_string(),
            source,
        })
    }
}

fn env_text(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_or(key: &str, fallback: &str) -> String {
    env_text(key).unwrap_or_else(|| fallback.to_string())
}

fn env_parse<T: FromStr>(key: &str, fallback: T) -> T {
    env_text(key)
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(fallback)
}

fn resolve_database_url() -> String {
    if let Some(url) = env_text("DATABASE_URL") {
        return url;
    }
    let host = env_text("POSTGRES_HOST")
        .or_else(|| env_text("PGHOST"))
        .unwrap_or_else(|| "localhost".to_string());
    let port = env_text("POSTGRES_PORT")
        .or_else(|| env_text("PGPORT"))
        .unwrap_or_else(|| "5432".to_string());
    let user = env_text("POSTGRES_USER")
        .or_else(|| env_text("PGUSER"))
        .unwrap_or_else(|| "postgres".to_string());
    let password = env_text("POSTGRES_PASSWORD")
        .or_else(|| env_text("PGPASSWORD"))
        .unwrap_or_else(|| "postgres".to_string());
    let db = env_text("POSTGRES_DB")
        .or_else(|| env_text("PGDATABASE"))
        .unwrap_or_else(|| "lead_chat".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let policy = match env_text("CHAT_POLICY_PATH") {
            Some(path) => ChatPolicy::load(&path)?,
            None => ChatPolicy::default(),
        };

        Ok(Self {
            port: env_parse("PORT", 4000),
            database_url: resolve_database_url(),
            default_chatbot_id: env_text("DEFAULT_CHATBOT_ID"),
            openai: OpenAiConfig {
                api_key: env_or("OPENAI_API_KEY", ""),
                base_url: env_or("OPENAI_BASE_URL", "https://api.openai.com/v1")
                    .trim_end_matches('/')
                    .to_string(),
                chat_model: env_or("OPENAI_CHAT_MODEL", "gpt-4.1"),
                extraction_model: env_or("OPENAI_EXTRACTION_MODEL", "gpt-4.1-mini"),
                embedding_model: env_or("OPENAI_EMBEDDING_MODEL", "text-embedding-3-small"),
            },
            retrieval_limit: env_parse("RETRIEVAL_LIMIT", 5),
            retrieval_min_similarity: env_parse("RETRIEVAL_MIN_SIMILARITY", 0.3),
            turn_timeout: Duration::from_secs(env_parse("TURN_TIMEOUT_SECS", 30)),
            retrieval_timeout: Duration::from_secs(env_parse("RETRIEVAL_TIMEOUT_SECS", 5)),
            http_timeout: Duration::from_secs(env_parse("HTTP_TIMEOUT_SECS", 30)),
            max_generation_steps: env_parse("MAX_GENERATION_STEPS", 5),
            lead_trigger_turns: env_parse("LEAD_TRIGGER_TURNS", 3),
            background_concurrency: env_parse("BACKGROUND_CONCURRENCY", 8),
            email: EmailConfig {
                api_url: env_or("EMAIL_API_URL", "https://api.resend.com/emails"),
                api_key: env_or("EMAIL_API_KEY", ""),
                from: env_or("EMAIL_FROM", ""),
            },
            almanac: AlmanacConfig {
                api_url: env_or("ALMANAC_API_URL", ""),
                api_key: env_or("ALMANAC_API_KEY", ""),
            },
            policy,
        })
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 4000,
            database_url: String::new(),
            default_chatbot_id: None,
            openai: OpenAiConfig {
                api_key: String::new(),
                base_url: "https://api.openai.com/v1".to_string(),
                chat_model: "gpt-4.1".to_string(),
                extraction_model: "gpt-4.1-mini".to_string(),
                embedding_model: "text-embedding-3-small".to_string(),
            },
            retrieval_limit: 5,
            retrieval_min_similarity: 0.3,
            turn_timeout: Duration::from_secs(30),
            retrieval_timeout: Duration::from_secs(5),
            http_timeout: Duration::from_secs(30),
            max_generation_steps: 5,
            lead_trigger_turns: 3,
            background_concurrency: 8,
            email: EmailConfig::default(),
            almanac: AlmanacConfig::default(),
            policy: ChatPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_file_overrides_only_given_fields() {
        let policy: ChatPolicy = toml::from_str(
            r#"
            scheduling_link = "https://cal.com/acme/intro"
            min_budget_usd = 25000

            [summary_templates]
            engaged = "Short recap."
            "#,
        )
        .unwrap();
        assert_eq!(policy.scheduling_link, "https://cal.com/acme/intro");
        assert_eq!(policy.min_budget_usd, 25_000);
        assert_eq!(policy.summary_templates.engaged, "Short recap.");
        assert_eq!(
            policy.summary_templates.alignment,
            SummaryTemplates::default().alignment
        );
        assert!(!policy.disqualification_rules.is_empty());
    }
}
