use minijinja::{context, Environment};
use serde::Serialize;

use crate::config::{ChatPolicy, SummaryTemplates};
use crate::types::CaseStudy;

const SYSTEM_PROMPT_TEMPLATE: &str = include_str!("prompts/system_prompt.j2");
const LEAD_EXTRACTION_SYSTEM_TEMPLATE: &str = include_str!("prompts/lead_extraction_system.j2");
const LEAD_EXTRACTION_USER_TEMPLATE: &str = include_str!("prompts/lead_extraction_user.j2");
const SUMMARY_EMAIL_TEMPLATE: &str = include_str!("prompts/summary_email.j2");

#[derive(Debug, Clone, Serialize)]
pub struct PromptSource<'a> {
    pub index: usize,
    pub title: &'a str,
    pub url: Option<&'a str>,
    pub content: &'a str,
}

pub struct SystemPromptContext<'a> {
    pub bot_name: &'a str,
    pub policy: &'a ChatPolicy,
    pub system_instructions: &'a str,
    pub business_context: &'a str,
    pub sources: &'a [PromptSource<'a>],
    pub enable_citations: bool,
    pub citation_style: &'a str,
    pub case_studies: &'a [CaseStudy],
    pub known_name: Option<&'a str>,
    pub known_email: Option<&'a str>,
    pub custom_instructions: &'a str,
}

fn render_one(name: &str, source: &str, ctx: minijinja::Value) -> Option<String> {
    let mut env = Environment::new();
    if let Err(err) = env.add_template(name, source) {
        tracing::error!(template = name, error = %err, "template failed to compile");
        return None;
    }
    let template = env.get_template(name).ok()?;
    match template.render(ctx) {
        Ok(text) => Some(text),
        Err(err) => {
            tracing::error!(template = name, error = %err, "template failed to render");
            None
        }
    }
}

pub fn render_system_prompt(ctx: &SystemPromptContext<'_>) -> String {
    let bot_name = if ctx.bot_name.trim().is_empty() {
        "the assistant"
    } else {
        ctx.bot_name.trim()
    };
    render_one(
        "system_prompt",
        SYSTEM_PROMPT_TEMPLATE,
        context! {
            bot_name => bot_name,
            persona => ctx.policy.persona.trim(),
            system_instructions => ctx.system_instructions.trim(),
            business_context => ctx.business_context.trim(),
            disqualification_rules => &ctx.policy.disqualification_rules,
            known_name => ctx.known_name,
            known_email => ctx.known_email,
            sources => ctx.sources,
            enable_citations => ctx.enable_citations,
            citation_style => ctx.citation_style,
            case_studies => ctx.case_studies,
            summary_templates => summary_templates_value(&ctx.policy.summary_templates),
            scheduling_link => ctx.policy.scheduling_link.trim(),
            custom_instructions => ctx.custom_instructions.trim(),
        },
    )
    .unwrap_or_else(|| fallback_system_prompt(ctx, bot_name))
}

fn summary_templates_value(templates: &SummaryTemplates) -> minijinja::Value {
    context! {
        alignment => templates.alignment.trim(),
        evaluation => templates.evaluation.trim(),
        engaged => templates.engaged.trim(),
    }
}

fn fallback_system_prompt(ctx: &SystemPromptContext<'_>, bot_name: &str) -> String {
    let mut prompt = format!("You are {}.\n{}\n", bot_name, ctx.policy.persona.trim());

    if !ctx.system_instructions.trim().is_empty() {
        prompt.push_str("\nInstructions:\n");
        prompt.push_str(ctx.system_instructions.trim());
        prompt.push('\n');
    }

    if !ctx.business_context.trim().is_empty() {
        prompt.push_str("\nAbout the business:\n");
        prompt.push_str(ctx.business_context.trim());
        prompt.push('\n');
    }

    if ctx.known_name.is_some() || ctx.known_email.is_some() {
        prompt.push_str("\nThe visitor already shared their contact details. Do not ask for them again.\n");
    }

    for source in ctx.sources {
        prompt.push_str(&format!("\n[{}] {}\n{}\n", source.index, source.title, source.content));
    }

    prompt.push_str("\nAfter any tool call, always continue with a short reply to the visitor.\n");
    prompt
}

pub struct LeadExtractionContext<'a> {
    pub known_name: Option<&'a str>,
    pub known_email: Option<&'a str>,
    pub sources: &'a [PromptSource<'a>],
    pub transcript: &'a str,
}

pub fn render_lead_extraction_system_prompt() -> String {
    LEAD_EXTRACTION_SYSTEM_TEMPLATE.trim().to_string()
}

pub fn render_lead_extraction_user_prompt(ctx: &LeadExtractionContext<'_>) -> String {
    render_one(
        "lead_extraction_user",
        LEAD_EXTRACTION_USER_TEMPLATE,
        context! {
            known_name => ctx.known_name,
            known_email => ctx.known_email,
            sources => ctx.sources,
            transcript => ctx.transcript,
        },
    )
    .unwrap_or_else(|| format!("Transcript:\n{}\n\nReturn the JSON object now.", ctx.transcript))
}

pub struct SummaryEmailContext<'a> {
    pub heading: &'a str,
    pub recipient_name: Option<&'a str>,
    pub summary: &'a str,
    pub scheduling_link: &'a str,
}

/// HTML body of the summary email. The template name ends in `.html`, so
/// every interpolated value is escaped.
pub fn render_summary_email(ctx: &SummaryEmailContext<'_>) -> String {
    let paragraphs = ctx
        .summary
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>();
    render_one(
        "summary_email.html",
        SUMMARY_EMAIL_TEMPLATE,
        context! {
            heading => ctx.heading,
            recipient_name => ctx.recipient_name,
            paragraphs => &paragraphs,
            scheduling_link => ctx.scheduling_link.trim(),
        },
    )
    .unwrap_or_else(|| plain_email_html(&paragraphs))
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Template-free body used when rendering fails.
fn plain_email_html(paragraphs: &[&str]) -> String {
    paragraphs
        .iter()
        .map(|p| format!("<p>{}</p>", escape_html(p)))
        .collect::<Vec<_>>()
        .join("\n")
}
