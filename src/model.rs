#[cfg(test)]
#[path = "model_test.rs"]
mod tests;

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{io::AsyncBufReadExt, sync::mpsc};
use tokio_util::io::StreamReader;

use crate::config::OpenAiConfig;
use crate::error::ModelError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<WireToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ModelMessage {
    pub fn system(content: &str) -> Self {
        Self {
            role: "system".to_string(),
            content: content.to_string(),
            ..Default::default()
        }
    }

    pub fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: content.to_string(),
            ..Default::default()
        }
    }

    pub fn assistant(content: &str, tool_calls: &[RawToolCall]) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.to_string(),
            tool_calls: tool_calls.iter().map(WireToolCall::from).collect(),
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: &str, output: &Value) -> Self {
        Self {
            role: "tool".to_string(),
            content: output.to_string(),
            tool_calls: vec![],
            tool_call_id: Some(tool_call_id.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: WireFunction,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireFunction {
    pub name: String,
    pub arguments: String,
}

impl From<&RawToolCall> for WireToolCall {
    fn from(call: &RawToolCall) -> Self {
        Self {
            id: call.id.clone(),
            call_type: "function".to_string(),
            function: WireFunction {
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            },
        }
    }
}

/// A tool call as emitted by the model, before schema validation.
#[derive(Debug, Clone, PartialEq)]
pub struct RawToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub temperature: f32,
    pub messages: Vec<ModelMessage>,
    pub tools: Vec<Value>,
}

/// Result of one generation step: the streamed text and any tool calls the
/// model asked for at the end of the step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutput {
    pub text: String,
    pub tool_calls: Vec<RawToolCall>,
    pub finish_reason: Option<String>,
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Runs one streamed completion step, forwarding text deltas as they arrive.
    async fn stream_step(
        &self,
        request: &CompletionRequest,
        deltas: mpsc::Sender<String>,
    ) -> Result<StepOutput, ModelError>;

    /// Single non-streamed completion expected to return a JSON object.
    async fn complete_json(&self, model: &str, system: &str, user: &str)
        -> Result<String, ModelError>;
}

pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    embedding_model: String,
}

impl OpenAiClient {
    pub fn new(http: reqwest::Client, config: &OpenAiConfig) -> Self {
        Self {
            http,
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            embedding_model: config.embedding_model.clone(),
        }
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    fn api_key(&self) -> Result<&str, ModelError> {
        if self.has_api_key() {
            Ok(&self.api_key)
        } else {
            Err(ModelError::MissingApiKey)
        }
    }

    async fn post(&self, path: &str, body: &impl Serialize) -> Result<reqwest::Response, ModelError> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(self.api_key()?)
            .json(body)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Status { status, body });
        }
        Ok(response)
    }

    pub async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        if inputs.is_empty() {
            return Ok(vec![]);
        }
        let response = self
            .post(
                "/embeddings",
                &json!({ "model": self.embedding_model, "input": inputs }),
            )
            .await?;
        let payload = response.json::<EmbeddingResponse>().await?;
        if payload.data.len() != inputs.len() {
            return Err(ModelError::Parse(format!(
                "expected {} embeddings, got {}",
                inputs.len(),
                payload.data.len()
            )));
        }
        Ok(payload.data.into_iter().map(|item| item.embedding).collect())
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    async fn stream_step(
        &self,
        request: &CompletionRequest,
        deltas: mpsc::Sender<String>,
    ) -> Result<StepOutput, ModelError> {
        let body = StreamRequest {
            model: &request.model,
            temperature: request.temperature,
            messages: &request.messages,
            stream: true,
            tool_choice: (!request.tools.is_empty()).then_some("auto"),
            tools: &request.tools,
        };
        let response = self.post("/chat/completions", &body).await?;

        let stream = response
            .bytes_stream()
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Interrupted, err.to_string()));
        let mut lines = StreamReader::new(stream).lines();

        let mut output = StepOutput::default();
        let mut pending_calls: BTreeMap<usize, PendingToolCall> = BTreeMap::new();

        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                break;
            }
            let chunk = serde_json::from_str::<StreamChunk>(data)
                .map_err(|err| ModelError::Parse(format!("{err}; line={data}")))?;
            let Some(choice) = chunk.choices.into_iter().next() else {
                continue;
            };

            for call in choice.delta.tool_calls {
                let entry = pending_calls.entry(call.index).or_default();
                if let Some(id) = call.id {
                    entry.id = id;
                }
                if let Some(function) = call.function {
                    if let Some(name) = function.name {
                        entry.name.push_str(&name);
                    }
                    if let Some(arguments) = function.arguments {
                        entry.arguments.push_str(&arguments);
                    }
                }
            }

            if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                output.text.push_str(&text);
                // A closed receiver means the client went away; keep collecting
                // so the turn can still be persisted.
                let _ = deltas.send(text).await;
            }

            if choice.finish_reason.is_some() {
                output.finish_reason = choice.finish_reason;
            }
        }

        output.tool_calls = pending_calls
            .into_values()
            .filter(|call| !call.name.is_empty())
            .map(|call| RawToolCall {
                id: if call.id.is_empty() {
                    format!("call_{}", uuid::Uuid::new_v4().simple())
                } else {
                    call.id
                },
                name: call.name,
                arguments: call.arguments,
            })
            .collect();
        Ok(output)
    }

    async fn complete_json(
        &self,
        model: &str,
        system: &str,
        user: &str,
    ) -> Result<String, ModelError> {
        let response = self
            .post(
                "/chat/completions",
                &json!({
                    "model": model,
                    "messages": [
                        { "role": "system", "content": system },
                        { "role": "user", "content": user }
                    ],
                    "temperature": 0.1,
                    "response_format": { "type": "json_object" }
                }),
            )
            .await?;
        let payload = response.json::<Value>().await?;
        let text = payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|msg| msg.get("content"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("")
            .to_string();
        if text.is_empty() {
            return Err(ModelError::Parse("response had empty content".to_string()));
        }
        Ok(text)
    }
}

/// Slices the first `{ ... }` object out of model output that may be wrapped
/// in prose or a markdown fence.
pub fn json_object_slice(raw: &str) -> &str {
    match (raw.find('{'), raw.rfind('}')) {
        (Some(start), Some(end)) if end > start => &raw[start..=end],
        _ => raw,
    }
}

#[derive(Debug, Serialize)]
struct StreamRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: &'a [ModelMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    #[serde(skip_serializing_if = "no_tools")]
    tools: &'a [Value],
}

fn no_tools(tools: &&[Value]) -> bool {
    tools.is_empty()
}

#[derive(Debug, Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Providers send `null` for absent arrays and objects as often as they omit them.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StreamChunk {
    #[serde(default, deserialize_with = "null_as_default")]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StreamChoice {
    #[serde(default, deserialize_with = "null_as_default")]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    tool_calls: Vec<StreamToolCall>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StreamToolCall {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunction>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StreamFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
}
