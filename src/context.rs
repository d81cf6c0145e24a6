use crate::config::ChatPolicy;
use crate::prompting::{render_system_prompt, PromptSource, SystemPromptContext};
use crate::types::{
    CaseStudy, Chatbot, Citation, CitationStyle, KnownVisitor, RetrievedSource, SourceUsed,
};

pub const MAX_CASE_STUDIES: usize = 15;
const SOURCE_CONTENT_CHARS: usize = 1200;
const HEADER_SNIPPET_CHARS: usize = 150;

/// Grounded system instructions for one turn plus the citation index that
/// maps `[n]` markers back to sources.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceContext {
    pub instructions: String,
    pub citations: Vec<Citation>,
}

pub struct ContextInput<'a> {
    pub chatbot: &'a Chatbot,
    pub policy: &'a ChatPolicy,
    pub sources: &'a [RetrievedSource],
    pub case_studies: &'a [CaseStudy],
    pub known_visitor: &'a KnownVisitor,
}

fn clip(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let mut clipped = collapsed.chars().take(max_chars).collect::<String>();
    clipped.push_str("...");
    clipped
}

/// Deterministic: identical input always yields identical output.
pub fn build_source_context(input: &ContextInput<'_>) -> SourceContext {
    let rag = &input.chatbot.rag_policy;

    let citations = input
        .sources
        .iter()
        .enumerate()
        .map(|(idx, hit)| Citation {
            index: idx + 1,
            source_id: hit.source.id.clone(),
            title: hit.source.title.clone(),
            url: hit.source.url.clone(),
        })
        .collect::<Vec<_>>();

    let contents = input
        .sources
        .iter()
        .map(|hit| clip(&hit.source.content, SOURCE_CONTENT_CHARS))
        .collect::<Vec<_>>();
    let prompt_sources = citations
        .iter()
        .zip(contents.iter())
        .map(|(citation, content)| PromptSource {
            index: citation.index,
            title: &citation.title,
            url: citation.url.as_deref(),
            content,
        })
        .collect::<Vec<_>>();

    let case_studies = if rag.enable_case_studies {
        &input.case_studies[..input.case_studies.len().min(MAX_CASE_STUDIES)]
    } else {
        &[]
    };

    let citation_style = match rag.citation_style {
        CitationStyle::Inline => "inline",
        CitationStyle::Footnote => "footnote",
        CitationStyle::None => "none",
    };

    let instructions = render_system_prompt(&SystemPromptContext {
        bot_name: &input.chatbot.name,
        policy: input.policy,
        system_instructions: &input.chatbot.system_instructions,
        business_context: &input.chatbot.business_context,
        sources: &prompt_sources,
        enable_citations: rag.enable_citations && rag.citation_style != CitationStyle::None,
        citation_style,
        case_studies,
        known_name: input.known_visitor.name.as_deref(),
        known_email: input.known_visitor.email.as_deref(),
        custom_instructions: &rag.custom_instructions,
    });

    SourceContext {
        instructions,
        citations,
    }
}

pub fn sources_used(sources: &[RetrievedSource]) -> Vec<SourceUsed> {
    sources
        .iter()
        .enumerate()
        .map(|(idx, hit)| SourceUsed {
            index: idx + 1,
            id: hit.source.id.clone(),
            title: hit.source.title.clone(),
            url: hit.source.url.clone(),
            snippet: clip(&hit.source.content, HEADER_SNIPPET_CHARS),
        })
        .collect()
}

/// Folds typographic punctuation to ASCII and drops anything outside the
/// printable range, so the text is a valid header value.
pub fn to_header_ascii(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' | '\u{2032}' => out.push('\''),
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' | '\u{2033}' => out.push('"'),
            '\u{2010}'..='\u{2015}' | '\u{2212}' => out.push('-'),
            '\u{2026}' => out.push_str("..."),
            '\u{00A0}' | '\u{2002}'..='\u{200A}' | '\u{202F}' => out.push(' '),
            '\n' | '\r' | '\t' => out.push(' '),
            ' '..='~' => out.push(ch),
            _ => {}
        }
    }
    out
}

/// JSON for the `X-Sources-Used` header. Fields are folded to ASCII before
/// encoding so the escaping stays intact.
pub fn sources_used_header(sources: &[RetrievedSource]) -> String {
    let entries = sources_used(sources)
        .into_iter()
        .map(|entry| SourceUsed {
            title: to_header_ascii(&entry.title),
            url: entry.url.as_deref().map(to_header_ascii),
            snippet: to_header_ascii(&entry.snippet),
            id: to_header_ascii(&entry.id),
            ..entry
        })
        .collect::<Vec<_>>();
    serde_json::to_string(&entries).unwrap_or_else(|_| "[]".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{chatbot, retrieved};
    use crate::types::RagPolicy;

    fn case_studies(n: usize) -> Vec<CaseStudy> {
        (0..n)
            .map(|i| CaseStudy {
                url: format!("https://acme.test/cases/{i}"),
                title: format!("Case {i}"),
                description: String::new(),
            })
            .collect()
    }

    #[test]
    fn citations_follow_source_order() {
        let bot = chatbot("bot-1");
        let policy = ChatPolicy::default();
        let sources = vec![
            retrieved("s-a", "Pricing", 0.9, "2024-01-01"),
            retrieved("s-b", "Security", 0.8, "2024-01-01"),
        ];
        let ctx = build_source_context(&ContextInput {
            chatbot: &bot,
            policy: &policy,
            sources: &sources,
            case_studies: &[],
            known_visitor: &KnownVisitor::default(),
        });
        assert_eq!(ctx.citations.len(), 2);
        assert_eq!(ctx.citations[0].index, 1);
        assert_eq!(ctx.citations[0].source_id, "s-a");
        assert_eq!(ctx.citations[1].index, 2);
        assert!(ctx.instructions.contains("[1] Pricing"));
        assert!(ctx.instructions.contains("[2] Security"));
    }

    #[test]
    fn output_is_deterministic() {
        let bot = chatbot("bot-1");
        let policy = ChatPolicy::default();
        let sources = vec![retrieved("s-a", "Pricing", 0.9, "2024-01-01")];
        let studies = case_studies(3);
        let visitor = KnownVisitor {
            name: Some("Dana".to_string()),
            email: None,
        };
        let input = ContextInput {
            chatbot: &bot,
            policy: &policy,
            sources: &sources,
            case_studies: &studies,
            known_visitor: &visitor,
        };
        assert_eq!(build_source_context(&input), build_source_context(&input));
    }

    #[test]
    fn case_studies_are_capped_and_respect_policy() {
        let mut bot = chatbot("bot-1");
        let policy = ChatPolicy::default();
        let studies = case_studies(20);
        let visitor = KnownVisitor::default();
        let ctx = build_source_context(&ContextInput {
            chatbot: &bot,
            policy: &policy,
            sources: &[],
            case_studies: &studies,
            known_visitor: &visitor,
        });
        assert!(ctx.instructions.contains("https://acme.test/cases/14"));
        assert!(!ctx.instructions.contains("https://acme.test/cases/15"));

        bot.rag_policy = RagPolicy {
            enable_case_studies: false,
            ..RagPolicy::default()
        };
        let ctx = build_source_context(&ContextInput {
            chatbot: &bot,
            policy: &policy,
            sources: &[],
            case_studies: &studies,
            known_visitor: &visitor,
        });
        assert!(!ctx.instructions.contains("acme.test/cases"));
    }

    #[test]
    fn header_value_is_printable_ascii() {
        let mut hit = retrieved("s-1", "\u{201C}Smart\u{201D} pricing", 0.9, "2024-01-01");
        hit.source.content =
            "It\u{2019}s fast \u{2014} really fast\u{2026} caf\u{e9} \u{1F680}".to_string();
        let header = sources_used_header(&[hit]);
        assert!(header.bytes().all(|b| (0x20..=0x7E).contains(&b)));
        assert!(header.contains(r#"\"Smart\" pricing"#));
        assert!(header.contains("It's fast - really fast... caf"));
        assert!(axum::http::HeaderValue::from_str(&header).is_ok());
    }

    #[test]
    fn header_snippets_are_clipped() {
        let mut hit = retrieved("s-1", "Long", 0.9, "2024-01-01");
        hit.source.content = "word ".repeat(200);
        let used = sources_used(&[hit]);
        assert_eq!(used[0].index, 1);
        assert!(used[0].snippet.chars().count() <= HEADER_SNIPPET_CHARS + 3);
    }
}
