#[cfg(test)]
#[path = "router_test.rs"]
mod tests;

use std::{convert::Infallible, sync::Arc, time::Duration};

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderMap, HeaderName, HeaderValue},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use serde::Serialize;
use serde_json::Value;
use tokio::{sync::mpsc, time::Instant};
use tokio_stream::wrappers::ReceiverStream;

use crate::app::AppState;
use crate::context::{build_source_context, sources_used_header, to_header_ascii, ContextInput};
use crate::error::ChatError;
use crate::ledger::{TurnRecord, WriteHandle};
use crate::model::{CompletionRequest, ModelMessage};
use crate::retrieval::retrieve_relevant_sources;
use crate::tools::{is_summary_dispatch, parse_arguments, tool_definitions};
use crate::types::{
    non_empty, CaseStudy, ChatRequest, Citation, Conversation, MessageRole, StoredMessage,
    ToolInvocation, UiMessage,
};
use crate::visitor::build_visitor_metadata;

pub const CONVERSATION_ID_HEADER: &str = "x-conversation-id";
pub const SOURCES_USED_HEADER: &str = "x-sources-used";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Received,
    ContextResolved,
    Streaming,
    Finalizing,
}

impl TurnPhase {
    fn as_str(self) -> &'static str {
        match self {
            TurnPhase::Received => "received",
            TurnPhase::ContextResolved => "context-resolved",
            TurnPhase::Streaming => "streaming",
            TurnPhase::Finalizing => "finalizing",
        }
    }
}

fn enter(phase: TurnPhase, conversation_id: &str) {
    tracing::debug!(phase = phase.as_str(), conversation_id, "turn phase");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    Stop,
    StepLimit,
    Timeout,
    Incomplete,
}

impl FinishReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::StepLimit => "step-limit",
            FinishReason::Timeout => "timeout",
            FinishReason::Incomplete => "incomplete",
        }
    }
}

/// Events on the `/api/chat` stream. None of them ever carries an error.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TurnEvent {
    Start {
        #[serde(rename = "conversationId")]
        conversation_id: String,
    },
    TextDelta {
        text: String,
    },
    ToolCall {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        input: Value,
    },
    ToolResult {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        output: Value,
    },
    StepFinish {
        step: usize,
        #[serde(rename = "finishReason")]
        finish_reason: String,
    },
    Finish {
        #[serde(rename = "finishReason")]
        finish_reason: FinishReason,
        steps: usize,
    },
}

impl TurnEvent {
    fn event_type(&self) -> &'static str {
        match self {
            TurnEvent::Start { .. } => "start",
            TurnEvent::TextDelta { .. } => "text-delta",
            TurnEvent::ToolCall { .. } => "tool-call",
            TurnEvent::ToolResult { .. } => "tool-result",
            TurnEvent::StepFinish { .. } => "step-finish",
            TurnEvent::Finish { .. } => "finish",
        }
    }

    pub fn to_sse_event(&self) -> Result<Event, serde_json::Error> {
        let data = serde_json::to_string(self)?;
        Ok(Event::default().event(self.event_type()).data(data))
    }
}

type EventSender = mpsc::Sender<Result<Event, Infallible>>;

/// A closed receiver means the client left; generation carries on so the
/// turn can still be persisted.
async fn emit(events: &EventSender, event: TurnEvent) {
    match event.to_sse_event() {
        Ok(sse) => {
            let _ = events.send(Ok(sse)).await;
        }
        Err(err) => tracing::error!(error = %err, "failed to encode stream event"),
    }
}

/// Plain text of the most recent user message, if there is one.
pub fn last_user_text(messages: &[UiMessage]) -> Option<String> {
    messages
        .iter()
        .rev()
        .find(|message| message.role == MessageRole::User.as_str())
        .map(UiMessage::plain_text)
}

fn history_messages(messages: &[UiMessage]) -> Vec<ModelMessage> {
    messages
        .iter()
        .filter_map(|message| {
            let text = message.plain_text();
            if text.trim().is_empty() {
                return None;
            }
            match MessageRole::parse(&message.role)? {
                MessageRole::User => Some(ModelMessage::user(&text)),
                MessageRole::Assistant => Some(ModelMessage::assistant(&text, &[])),
            }
        })
        .collect()
}

/// Everything the spawned generation task owns.
struct TurnJob {
    state: Arc<AppState>,
    chatbot_id: String,
    conversation_id: String,
    request: CompletionRequest,
    citations: Vec<Citation>,
    case_studies: Vec<CaseStudy>,
    user_message: WriteHandle,
    user_turns: usize,
    message_count: usize,
    deadline: Instant,
}

#[derive(Default)]
struct TurnProgress {
    text: String,
    tool_invocations: Vec<ToolInvocation>,
    steps: usize,
    text_after_tools: bool,
}

pub async fn post_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, ChatError> {
    let Json(request) = payload.map_err(|err| ChatError::BadRequest(err.body_text()))?;

    let chatbot_id = non_empty(request.chatbot_id.as_deref())
        .or_else(|| state.config.default_chatbot_id.clone())
        .ok_or_else(|| ChatError::BadRequest("chatbotId is required".to_string()))?;
    let query = last_user_text(&request.messages)
        .ok_or_else(|| ChatError::BadRequest("messages must include a user message".to_string()))?;
    let requested_id = non_empty(request.conversation_id.as_deref());
    enter(
        TurnPhase::Received,
        requested_id.as_deref().unwrap_or_default(),
    );

    // The whole turn, setup included, runs against one wall-clock budget.
    let deadline = Instant::now() + state.config.turn_timeout;
    let retrieval_deadline = deadline.min(Instant::now() + state.config.retrieval_timeout);
    let store = state.store.as_ref();
    let setup = tokio::time::timeout_at(deadline, async {
        tokio::join!(
            store.get_chatbot(&chatbot_id),
            async {
                match requested_id.as_deref() {
                    Some(id) => store.get_conversation(id).await,
                    None => Ok(None),
                }
            },
            tokio::time::timeout_at(
                retrieval_deadline,
                retrieve_relevant_sources(
                    state.retriever.as_ref(),
                    &chatbot_id,
                    &query,
                    state.config.retrieval_limit,
                    state.config.retrieval_min_similarity,
                ),
            ),
            store.list_case_studies(),
        )
    })
    .await;
    let Ok((chatbot, prior, sources, case_studies)) = setup else {
        tracing::error!(chatbot_id = %chatbot_id, "turn budget exhausted before generation");
        return Err(ChatError::Internal("timed out resolving chat context".to_string()));
    };

    let chatbot = chatbot?.ok_or_else(|| ChatError::ChatbotNotFound {
        chatbot_id: chatbot_id.clone(),
    })?;
    let prior = prior?;
    let sources = match sources {
        Ok(Ok(sources)) => sources,
        Ok(Err(err)) => {
            tracing::warn!(chatbot_id = %chatbot.id, error = %err, "retrieval failed; answering ungrounded");
            vec![]
        }
        Err(_) => {
            tracing::warn!(chatbot_id = %chatbot.id, "retrieval timed out; answering ungrounded");
            vec![]
        }
    };
    let case_studies = case_studies.unwrap_or_else(|err| {
        tracing::warn!(chatbot_id = %chatbot.id, error = %err, "case studies unavailable");
        vec![]
    });

    let conversation_id = requested_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let known = prior
        .as_ref()
        .map(Conversation::known_visitor)
        .unwrap_or_default();
    let exists = prior.is_some();
    let conversation = prior.unwrap_or_else(|| {
        Conversation::new(&conversation_id, &chatbot.id, build_visitor_metadata(&headers))
    });
    enter(TurnPhase::ContextResolved, &conversation_id);

    let created = state.ledger.ensure_conversation(conversation, exists);
    let user_message = state.ledger.record_user_message(
        created,
        StoredMessage::new(&conversation_id, MessageRole::User, &query),
    );

    let context = build_source_context(&ContextInput {
        chatbot: &chatbot,
        policy: &state.config.policy,
        sources: &sources,
        case_studies: &case_studies,
        known_visitor: &known,
    });

    let model = non_empty(request.model.as_deref())
        .or_else(|| non_empty(Some(chatbot.model.as_str())))
        .unwrap_or_else(|| state.config.openai.chat_model.clone());
    let mut messages = vec![ModelMessage::system(&context.instructions)];
    messages.extend(history_messages(&request.messages));

    let job = TurnJob {
        state: state.clone(),
        chatbot_id: chatbot.id.clone(),
        conversation_id: conversation_id.clone(),
        request: CompletionRequest {
            model,
            temperature: request.temperature.unwrap_or(chatbot.temperature),
            messages,
            tools: tool_definitions(),
        },
        citations: context.citations,
        case_studies,
        user_message,
        user_turns: request
            .messages
            .iter()
            .filter(|message| message.role == MessageRole::User.as_str())
            .count(),
        message_count: request.messages.len() + 1,
        deadline,
    };

    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(100);
    tokio::spawn(run_turn(job, tx));

    let mut response = Sse::new(ReceiverStream::new(rx))
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("keep-alive"),
        )
        .into_response();
    let response_headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&to_header_ascii(&conversation_id)) {
        response_headers.insert(HeaderName::from_static(CONVERSATION_ID_HEADER), value);
    }
    if let Ok(value) = HeaderValue::from_str(&sources_used_header(&sources)) {
        response_headers.insert(HeaderName::from_static(SOURCES_USED_HEADER), value);
    }
    Ok(response)
}

async fn run_turn(job: TurnJob, events: EventSender) {
    emit(
        &events,
        TurnEvent::Start {
            conversation_id: job.conversation_id.clone(),
        },
    )
    .await;
    enter(TurnPhase::Streaming, &job.conversation_id);

    let mut progress = TurnProgress::default();
    let finish = match tokio::time::timeout_at(job.deadline, generate(&job, &events, &mut progress))
        .await
    {
        Ok(reason) => reason,
        Err(_) => {
            tracing::warn!(
                conversation_id = %job.conversation_id,
                chatbot_id = %job.chatbot_id,
                "turn hit the wall-clock budget"
            );
            FinishReason::Timeout
        }
    };
    emit(
        &events,
        TurnEvent::Finish {
            finish_reason: finish,
            steps: progress.steps,
        },
    )
    .await;

    enter(TurnPhase::Finalizing, &job.conversation_id);
    finalize(job, progress, finish);
}

async fn generate(job: &TurnJob, events: &EventSender, progress: &mut TurnProgress) -> FinishReason {
    let state = &job.state;
    let mut request = job.request.clone();

    for step in 1..=state.config.max_generation_steps {
        progress.steps = step;
        let (delta_tx, mut delta_rx) = mpsc::channel::<String>(100);
        let forward = async {
            while let Some(text) = delta_rx.recv().await {
                emit(events, TurnEvent::TextDelta { text }).await;
            }
        };
        let (result, _) = tokio::join!(state.model.stream_step(&request, delta_tx), forward);

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                tracing::error!(
                    conversation_id = %job.conversation_id,
                    chatbot_id = %job.chatbot_id,
                    step,
                    error = %err,
                    "generation failed"
                );
                return FinishReason::Incomplete;
            }
        };
        progress.text.push_str(&output.text);
        if !output.text.trim().is_empty() {
            progress.text_after_tools = true;
        }

        if output.tool_calls.is_empty() {
            emit(
                events,
                TurnEvent::StepFinish {
                    step,
                    finish_reason: output.finish_reason.unwrap_or_else(|| "stop".to_string()),
                },
            )
            .await;
            if !progress.tool_invocations.is_empty() && !progress.text_after_tools {
                tracing::warn!(
                    conversation_id = %job.conversation_id,
                    "turn ended on a bare tool call"
                );
            }
            return FinishReason::Stop;
        }

        request
            .messages
            .push(ModelMessage::assistant(&output.text, &output.tool_calls));
        for call in &output.tool_calls {
            emit(
                events,
                TurnEvent::ToolCall {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    input: parse_arguments(&call.arguments),
                },
            )
            .await;
            let invocation = state.broker.run(call, &job.case_studies).await;
            emit(
                events,
                TurnEvent::ToolResult {
                    tool_call_id: invocation.tool_call_id.clone(),
                    tool_name: invocation.tool_name.clone(),
                    output: invocation.output.clone(),
                },
            )
            .await;
            request
                .messages
                .push(ModelMessage::tool_result(&invocation.tool_call_id, &invocation.output));
            progress.tool_invocations.push(invocation);
        }
        progress.text_after_tools = false;
        emit(
            events,
            TurnEvent::StepFinish {
                step,
                finish_reason: "tool-calls".to_string(),
            },
        )
        .await;
    }

    tracing::warn!(
        conversation_id = %job.conversation_id,
        steps = progress.steps,
        "turn ended on a bare tool call; step budget exhausted"
    );
    FinishReason::StepLimit
}

/// Queues the after-stream writes. Must run before the event sender drops so
/// the work is tracked by the time the client sees the stream end.
fn finalize(job: TurnJob, progress: TurnProgress, finish: FinishReason) {
    if finish == FinishReason::Timeout {
        tracing::warn!(conversation_id = %job.conversation_id, "timed out turn not persisted");
        return;
    }
    if progress.text.is_empty() && progress.tool_invocations.is_empty() {
        tracing::warn!(conversation_id = %job.conversation_id, "empty turn not persisted");
        return;
    }

    let summary_sent = progress.tool_invocations.iter().any(is_summary_dispatch);
    let record = TurnRecord {
        chatbot_id: job.chatbot_id,
        conversation_id: job.conversation_id,
        assistant_text: progress.text,
        citations: job.citations,
        tool_invocations: progress.tool_invocations,
        message_count: job.message_count,
        finish_reason: finish.as_str(),
    };
    let state = job.state;
    let user_message = job.user_message;
    let trigger = job.user_turns >= state.config.lead_trigger_turns;

    let task_state = state.clone();
    state.queue.spawn("finalize_turn", async move {
        if !task_state.ledger.finalize_turn(user_message, &record).await || !trigger {
            return;
        }
        let outcome = task_state
            .qualifier
            .process(
                &record.chatbot_id,
                &record.conversation_id,
                &record.assistant_text,
                summary_sent,
            )
            .await;
        if let Err(err) = outcome {
            tracing::error!(
                conversation_id = %record.conversation_id,
                chatbot_id = %record.chatbot_id,
                error = %err,
                "lead qualification failed"
            );
        }
    });
}
