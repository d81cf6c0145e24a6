use super::*;
use crate::testing::{chatbot, MemoryStore, RecordingCrm, ScriptedModel};
use crate::types::{Conversation, VisitorMetadata, EVENT_ALMANAC_SYNC_FAILED};

const INTRO_EMAIL: &str = "dana@corp.test";

fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.add_chatbot(chatbot("bot-1"));
    let mut conversation = Conversation::new("conv-1", "bot-1", VisitorMetadata::default());
    conversation.visitor_name = Some("Dana".to_string());
    conversation.visitor_email = Some(INTRO_EMAIL.to_string());
    store.add_conversation(conversation);
    for (role, text) in [
        (MessageRole::User, "Hi, we need a customer analytics dashboard for our stores."),
        (MessageRole::Assistant, "Happy to help. What budget are you working with?"),
        (MessageRole::User, "Our budget is around $60k."),
        (MessageRole::Assistant, "Great. When would you like to launch?"),
        (MessageRole::User, "We want to go live in 2 months."),
    ] {
        store.add_message(StoredMessage::new("conv-1", role, text));
    }
    store
}

fn qualifier(
    store: Arc<MemoryStore>,
    model: ScriptedModel,
    crm: Arc<RecordingCrm>,
) -> LeadQualifier {
    LeadQualifier::new(
        store.clone(),
        Arc::new(model),
        CrmPropagator::new(store, crm),
        ChatPolicy::default(),
        "gpt-test-mini",
    )
}

fn extraction_without_email() -> ScriptedModel {
    ScriptedModel::new(vec![]).with_json(
        r#"{"name":null,"email":null,"budget":"$60k","timeline":"2 months",
            "needs":["customer analytics dashboard"],"painPoints":[],"nextSteps":[],
            "recommendations":[],"summary":"Retailer wants a dashboard."}"#,
    )
}

#[tokio::test]
async fn qualified_conversation_creates_one_lead_with_intro_email() {
    let store = seeded_store();
    let crm = Arc::new(RecordingCrm::new());
    let qualifier = qualifier(store.clone(), extraction_without_email(), crm.clone());

    let outcome = qualifier
        .process("bot-1", "conv-1", "Sounds like a good fit.", false)
        .await
        .unwrap();

    assert!(outcome.qualified);
    assert_eq!(outcome.status, Some(LeadStatus::Qualified));
    assert_eq!(outcome.write, Some(LeadWrite::Inserted));
    assert_eq!(outcome.delivery, None);

    let leads = store.leads();
    assert_eq!(leads.len(), 1);
    assert_eq!(leads[0].visitor_email.as_deref(), Some(INTRO_EMAIL));
    assert_eq!(leads[0].data.budget.as_deref(), Some("$60k"));
    assert!(store.conversation("conv-1").unwrap().lead_captured);
    assert_eq!(crm.calls(), 0);
}

#[tokio::test]
async fn heuristics_qualify_when_extraction_is_unavailable() {
    let store = seeded_store();
    let qualifier = qualifier(
        store.clone(),
        ScriptedModel::new(vec![]),
        Arc::new(RecordingCrm::new()),
    );

    let outcome = qualifier
        .process("bot-1", "conv-1", "Thanks!", false)
        .await
        .unwrap();

    assert!(outcome.qualified);
    let lead = &store.leads()[0];
    assert_eq!(lead.visitor_email.as_deref(), Some(INTRO_EMAIL));
    assert_eq!(lead.data.budget.as_deref(), Some("$60k"));
    assert_eq!(lead.data.timeline.as_deref(), Some("2 months"));
    assert!(!lead.data.needs.is_empty());
}

#[tokio::test]
async fn second_run_updates_instead_of_inserting() {
    let store = seeded_store();
    let qualifier = qualifier(
        store.clone(),
        extraction_without_email(),
        Arc::new(RecordingCrm::new()),
    );

    let first = qualifier.process("bot-1", "conv-1", "Noted.", false).await.unwrap();
    let second = qualifier.process("bot-1", "conv-1", "Noted.", false).await.unwrap();

    assert_eq!(first.write, Some(LeadWrite::Inserted));
    assert_eq!(second.write, Some(LeadWrite::Updated));
    let leads = store.leads();
    assert_eq!(leads.len(), 1);
    assert_eq!(
        store
            .events()
            .iter()
            .filter(|event| event.event_type == EVENT_LEAD_CAPTURED)
            .count(),
        1
    );
}

#[tokio::test]
async fn final_summary_finalizes_and_delivers_once() {
    let store = seeded_store();
    let crm = Arc::new(RecordingCrm::failing());
    let qualifier = qualifier(store.clone(), extraction_without_email(), crm.clone());

    qualifier.process("bot-1", "conv-1", "Noted.", false).await.unwrap();
    let summary = "Here is a summary of what we covered. You can book a call at https://cal.com/acme.";
    let finalized = qualifier
        .process("bot-1", "conv-1", summary, false)
        .await
        .unwrap();
    assert_eq!(finalized.status, Some(LeadStatus::Finalized));
    assert_eq!(finalized.write, Some(LeadWrite::Updated));
    assert_eq!(finalized.delivery, Some(DeliveryStatus::Failed));

    let lead = &store.leads()[0];
    assert_eq!(lead.summary, summary);

    let again = qualifier
        .process("bot-1", "conv-1", summary, false)
        .await
        .unwrap();
    assert_eq!(again.status, Some(LeadStatus::Finalized));
    assert_eq!(again.delivery, None);
    assert_eq!(crm.calls(), 1);
    assert_eq!(store.deliveries().len(), 1);
    assert_eq!(
        store
            .events()
            .iter()
            .filter(|event| event.event_type == EVENT_ALMANAC_SYNC_FAILED)
            .count(),
        1
    );
}

#[tokio::test]
async fn unqualified_conversation_writes_nothing() {
    let store = Arc::new(MemoryStore::new());
    store.add_chatbot(chatbot("bot-1"));
    store.add_conversation(Conversation::new("conv-9", "bot-1", VisitorMetadata::default()));
    store.add_message(StoredMessage::new("conv-9", MessageRole::User, "Just browsing."));
    let qualifier = qualifier(
        store.clone(),
        ScriptedModel::new(vec![]),
        Arc::new(RecordingCrm::new()),
    );

    let outcome = qualifier.process("bot-1", "conv-9", "Sure!", false).await.unwrap();
    assert!(!outcome.qualified);
    assert_eq!(outcome.write, None);
    assert!(store.leads().is_empty());
}

#[test]
fn stored_contact_never_overrides_extracted_values() {
    let known = KnownVisitor {
        name: Some("Dana".to_string()),
        email: Some(INTRO_EMAIL.to_string()),
    };
    let extracted = LeadData {
        email: Some("dana.work@corp.test".to_string()),
        ..LeadData::default()
    };
    let merged = merge_known_visitor(extracted, &known);
    assert_eq!(merged.email.as_deref(), Some("dana.work@corp.test"));
    assert_eq!(merged.name.as_deref(), Some("Dana"));
}

#[test]
fn budget_parsing() {
    assert_eq!(parse_budget_usd("$60k"), Some(60_000));
    assert_eq!(parse_budget_usd("$60,000"), Some(60_000));
    assert_eq!(parse_budget_usd("1.2M"), Some(1_200_000));
    assert_eq!(parse_budget_usd("between 50k and 80k"), Some(50_000));
    assert_eq!(parse_budget_usd("flexible"), None);
    assert_eq!(parse_budget_usd("50-60k"), Some(50_000));
    assert_eq!(parse_budget_usd("$50 - $60k"), Some(50_000));
    assert_eq!(parse_budget_usd("between 50 and 60 thousand"), Some(50_000));
    assert_eq!(parse_budget_usd("50 to 60 thousand"), Some(50_000));
    assert_eq!(parse_budget_usd("1-2M"), Some(1_000_000));
    assert_eq!(parse_budget_usd("about 500 for 3 seats"), Some(500));
}

#[test]
fn qualification_predicate() {
    let policy = ChatPolicy::default();
    let lead = LeadData {
        email: Some(INTRO_EMAIL.to_string()),
        budget: Some("$60k".to_string()),
        timeline: Some("2 months".to_string()),
        needs: vec!["dashboard".to_string()],
        ..LeadData::default()
    };
    assert!(is_qualified_lead(&lead, &policy));

    let small = LeadData {
        budget: Some("$5k".to_string()),
        ..lead.clone()
    };
    assert!(!is_qualified_lead(&small, &policy));

    let vague_budget = LeadData {
        budget: Some("flexible".to_string()),
        ..lead.clone()
    };
    assert!(is_qualified_lead(&vague_budget, &policy));

    let ranged_budget = LeadData {
        budget: Some("50-60k".to_string()),
        ..lead.clone()
    };
    assert!(is_qualified_lead(&ranged_budget, &policy));

    let no_timeline = LeadData {
        timeline: None,
        ..lead.clone()
    };
    assert!(!is_qualified_lead(&no_timeline, &policy));

    let with_next_steps = LeadData {
        next_steps: vec!["demo".to_string()],
        ..no_timeline
    };
    assert!(is_qualified_lead(&with_next_steps, &policy));

    let no_email = LeadData {
        email: None,
        ..lead
    };
    assert!(!is_qualified_lead(&no_email, &policy));
}

#[test]
fn final_summary_heuristic() {
    let mut policy = ChatPolicy::default();
    assert!(looks_like_final_summary(
        "Quick summary: ... Feel free to schedule a call.",
        &policy
    ));
    assert!(!looks_like_final_summary("Feel free to schedule a call.", &policy));
    assert!(!looks_like_final_summary("Here is a summary of pricing.", &policy));

    policy.scheduling_link = "https://meet.acme.test/intro".to_string();
    assert!(looks_like_final_summary(
        "Summary attached. Pick a slot at https://meet.acme.test/intro",
        &policy
    ));
}

#[test]
fn transitions_never_regress() {
    use LeadStatus::*;
    assert_eq!(next_transition(None, false, true), None);
    assert_eq!(next_transition(None, true, false), Some(Qualified));
    assert_eq!(next_transition(None, true, true), Some(Finalized));
    assert_eq!(next_transition(Some(Qualified), false, false), None);
    assert_eq!(next_transition(Some(Qualified), true, false), Some(Qualified));
    assert_eq!(next_transition(Some(Qualified), false, true), Some(Finalized));
    assert_eq!(next_transition(Some(Finalized), true, false), Some(Finalized));
    assert_eq!(next_transition(Some(Finalized), false, false), None);
}

#[test]
fn lenient_extraction_parsing() {
    let data = lead_data_from_value(&serde_json::json!({
        "budget": 60000,
        "email": "unknown",
        "needs": "reporting",
        "painPoints": ["", "slow exports"],
        "timeline": null
    }));
    assert_eq!(data.budget.as_deref(), Some("60000"));
    assert_eq!(data.email, None);
    assert_eq!(data.needs, vec!["reporting".to_string()]);
    assert_eq!(data.pain_points, vec!["slow exports".to_string()]);
    assert_eq!(data.timeline, None);
}

#[test]
fn heuristic_scan_fills_gaps() {
    let mut data = LeadData::default();
    fill_from_heuristics(
        &mut data,
        "Reach me at ops@shop.test. Budget is 1.2M and we need a new loyalty app ASAP.",
    );
    assert_eq!(data.email.as_deref(), Some("ops@shop.test"));
    assert_eq!(data.budget.as_deref(), Some("1.2M"));
    assert_eq!(data.timeline.as_deref(), Some("ASAP"));
    assert_eq!(data.needs, vec!["a new loyalty app ASAP".to_string()]);
}
