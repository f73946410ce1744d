//! OpenAI-compatible binding over `async-openai`.
//!
//! OpenAI, DeepSeek and Gemini (through its OpenAI endpoint) all speak the
//! chat-completions protocol, so one adapter serves every `ProviderKind`; only
//! the base URL, API key and default model differ.

use std::collections::BTreeMap;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessageArgs,
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestToolMessageArgs, ChatCompletionRequestUserMessageArgs,
    ChatCompletionStreamOptions, ChatCompletionTool, ChatCompletionToolArgs,
    ChatCompletionToolType, CompletionUsage, CreateChatCompletionRequest,
    CreateChatCompletionRequestArgs, FinishReason as VendorFinishReason, FunctionCall,
    FunctionObjectArgs,
};
use async_openai::Client;
use futures::future::BoxFuture;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use super::{
    DeltaStream, ModelDelta, ModelRequest, ModelResponse, ProviderAdapter, ProviderError,
    ProviderErrorKind, ProviderKind, ToolSpec,
};
use crate::config::ProviderSettings;
use crate::types::{new_id, FinishReason, Message, Role, ToolCall, Usage};

/// Adapter for any endpoint implementing OpenAI chat completions.
#[derive(Clone)]
pub struct OpenAiCompatibleProvider {
    name: String,
    kind: ProviderKind,
    /// `None` when no API key is configured; every call then fails as not configured.
    client: Option<Client<OpenAIConfig>>,
}

impl OpenAiCompatibleProvider {
    pub fn new(name: impl Into<String>, kind: ProviderKind, client: Client<OpenAIConfig>) -> Self {
        Self {
            name: name.into(),
            kind,
            client: Some(client),
        }
    }

    pub fn from_settings(name: &str, settings: &ProviderSettings) -> Self {
        let client = settings.resolve_api_key().map(|key| {
            let mut config = OpenAIConfig::new().with_api_key(key);
            if let Some(base) = settings.base_url() {
                config = config.with_api_base(base);
            }
            Client::with_config(config)
        });
        if client.is_none() {
            debug!(provider = name, "no API key configured; provider calls will fail over");
        }
        Self {
            name: name.to_string(),
            kind: settings.kind,
            client,
        }
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn client(&self) -> Result<Client<OpenAIConfig>, ProviderError> {
        self.client.clone().ok_or_else(|| {
            ProviderError::not_configured(format!("API key for provider {} is not configured", self.name))
        })
    }
}

impl ProviderAdapter for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, request: ModelRequest) -> BoxFuture<'static, Result<ModelResponse, ProviderError>> {
        let client = self.client();
        Box::pin(async move {
            let client = client?;
            let req = build_request(&request)?;
            let resp = client.chat().create(req).await?;
            let usage = resp.usage.map(usage_from).unwrap_or_default();
            let choice = resp.choices.into_iter().next().ok_or_else(|| {
                ProviderError::new(ProviderErrorKind::Protocol, "response contained no choices")
            })?;
            let tool_calls: Vec<ToolCall> = choice
                .message
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(|tc| {
                    let id = if tc.id.is_empty() { new_id("call") } else { tc.id };
                    ToolCall::pending(id, tc.function.name, parse_arguments(&tc.function.arguments))
                })
                .collect();
            let finish_reason = map_finish(choice.finish_reason, !tool_calls.is_empty());
            Ok(ModelResponse {
                content: choice.message.content.unwrap_or_default(),
                tool_calls,
                finish_reason,
                usage,
            })
        })
    }

    fn stream(&self, request: ModelRequest) -> BoxFuture<'static, Result<DeltaStream, ProviderError>> {
        let client = self.client();
        Box::pin(async move {
            let client = client?;
            let mut req = build_request(&request)?;
            req.stream_options = Some(ChatCompletionStreamOptions {
                include_usage: true,
            });
            let mut upstream = client.chat().create_stream(req).await?;

            let (tx, rx) = mpsc::channel::<Result<ModelDelta, ProviderError>>(64);
            tokio::spawn(async move {
                let mut pending: BTreeMap<u32, PartialToolCall> = BTreeMap::new();
                let mut finish = None;
                while let Some(item) = upstream.next().await {
                    let chunk = match item {
                        Ok(chunk) => chunk,
                        Err(err) => {
                            let _ = tx.send(Err(err.into())).await;
                            return;
                        }
                    };
                    if let Some(usage) = chunk.usage {
                        if tx.send(Ok(ModelDelta::Usage(usage_from(usage)))).await.is_err() {
                            return;
                        }
                    }
                    for choice in chunk.choices {
                        if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                            if tx.send(Ok(ModelDelta::Text(text))).await.is_err() {
                                return;
                            }
                        }
                        for fragment in choice.delta.tool_calls.unwrap_or_default() {
                            let entry = pending.entry(fragment.index).or_default();
                            if let Some(id) = fragment.id.filter(|id| !id.is_empty()) {
                                entry.id = id;
                            }
                            if let Some(function) = fragment.function {
                                if let Some(name) = function.name.filter(|n| !n.is_empty()) {
                                    entry.name = name;
                                }
                                if let Some(arguments) = function.arguments {
                                    entry.arguments.push_str(&arguments);
                                }
                            }
                        }
                        if choice.finish_reason.is_some() {
                            finish = choice.finish_reason;
                        }
                    }
                }
                let has_calls = !pending.is_empty();
                for (_, partial) in pending {
                    if tx.send(Ok(ModelDelta::ToolCall(partial.into_call()))).await.is_err() {
                        return;
                    }
                }
                let _ = tx
                    .send(Ok(ModelDelta::Finish(map_finish(finish, has_calls))))
                    .await;
            });

            Ok(Box::pin(ReceiverStream::new(rx)) as DeltaStream)
        })
    }
}

#[derive(Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

impl PartialToolCall {
    fn into_call(self) -> ToolCall {
        let id = if self.id.is_empty() { new_id("call") } else { self.id };
        ToolCall::pending(id, self.name, parse_arguments(&self.arguments))
    }
}

/// Arguments arrive as JSON text; text that does not parse is kept as a JSON
/// string so schema validation rejects it instead of the call silently
/// receiving `null`.
fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn arguments_text(arguments: &Value) -> String {
    match arguments {
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    }
}

fn usage_from(usage: CompletionUsage) -> Usage {
    Usage::new(
        u64::from(usage.prompt_tokens),
        u64::from(usage.completion_tokens),
        u64::from(usage.total_tokens),
    )
}

fn map_finish(reason: Option<VendorFinishReason>, has_tool_calls: bool) -> FinishReason {
    match reason {
        Some(VendorFinishReason::Stop) => FinishReason::Stop,
        Some(VendorFinishReason::Length) => FinishReason::Length,
        Some(VendorFinishReason::ToolCalls) | Some(VendorFinishReason::FunctionCall) => {
            FinishReason::ToolCalls
        }
        Some(_) => FinishReason::Error,
        None if has_tool_calls => FinishReason::ToolCalls,
        None => FinishReason::Stop,
    }
}

pub(crate) fn build_request(request: &ModelRequest) -> Result<CreateChatCompletionRequest, OpenAIError> {
    let messages = request
        .messages
        .iter()
        .map(to_openai_message)
        .collect::<Result<Vec<_>, _>>()?;

    let mut builder = CreateChatCompletionRequestArgs::default();
    builder.model(request.model.clone()).messages(messages);
    if let Some(t) = request.params.temperature {
        builder.temperature(t);
    }
    if let Some(mt) = request.params.max_tokens {
        builder.max_tokens(mt);
    }
    if !request.tools.is_empty() {
        let tools = request
            .tools
            .iter()
            .map(to_openai_tool)
            .collect::<Result<Vec<_>, _>>()?;
        builder.tools(tools);
    }
    builder.build()
}

fn to_openai_message(message: &Message) -> Result<ChatCompletionRequestMessage, OpenAIError> {
    let mapped: ChatCompletionRequestMessage = match message.role {
        Role::System => ChatCompletionRequestSystemMessageArgs::default()
            .content(message.content.clone())
            .build()?
            .into(),
        Role::User => ChatCompletionRequestUserMessageArgs::default()
            .content(message.content.clone())
            .build()?
            .into(),
        Role::Assistant => {
            let mut builder = ChatCompletionRequestAssistantMessageArgs::default();
            builder.content(message.content.clone());
            if message.has_tool_calls() {
                let calls: Vec<ChatCompletionMessageToolCall> = message
                    .tool_calls
                    .iter()
                    .map(|call| ChatCompletionMessageToolCall {
                        id: call.id.clone(),
                        r#type: ChatCompletionToolType::Function,
                        function: FunctionCall {
                            name: call.name.clone(),
                            arguments: arguments_text(&call.arguments),
                        },
                    })
                    .collect();
                builder.tool_calls(calls);
            }
            builder.build()?.into()
        }
        Role::Tool => ChatCompletionRequestToolMessageArgs::default()
            .content(message.content.clone())
            .tool_call_id(message.tool_call_id.clone().unwrap_or_default())
            .build()?
            .into(),
    };
    Ok(mapped)
}

fn to_openai_tool(spec: &ToolSpec) -> Result<ChatCompletionTool, OpenAIError> {
    let function = FunctionObjectArgs::default()
        .name(spec.name.clone())
        .description(spec.description.clone())
        .parameters(spec.parameters.clone())
        .build()?;
    ChatCompletionToolArgs::default()
        .r#type(ChatCompletionToolType::Function)
        .function(function)
        .build()
}

impl From<OpenAIError> for ProviderError {
    fn from(err: OpenAIError) -> Self {
        let message = err.to_string();
        match &err {
            OpenAIError::Reqwest(inner) => {
                if inner.is_timeout() {
                    ProviderError::timeout(message)
                } else if let Some(status) = inner.status() {
                    ProviderError::from_status(status.as_u16(), message)
                } else {
                    ProviderError::new(ProviderErrorKind::Unavailable, message)
                }
            }
            OpenAIError::ApiError(_) => classify_message(&message, ProviderErrorKind::InvalidRequest),
            OpenAIError::InvalidArgument(_) => {
                ProviderError::new(ProviderErrorKind::InvalidRequest, message)
            }
            OpenAIError::JSONDeserialize(_) => ProviderError::new(ProviderErrorKind::Protocol, message),
            _ => classify_message(&message, ProviderErrorKind::Unavailable),
        }
    }
}

/// Vendors report most failures as text; sort them by the words they use.
fn classify_message(message: &str, fallback: ProviderErrorKind) -> ProviderError {
    let lower = message.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));
    let kind = if has(&["rate limit", "rate_limit", "too many requests", "quota", "429"]) {
        ProviderErrorKind::RateLimited
    } else if has(&["timed out", "timeout"]) {
        ProviderErrorKind::Timeout
    } else if has(&["api key", "api_key", "unauthorized", "authentication", "permission"]) {
        ProviderErrorKind::Auth
    } else if has(&[
        "overloaded",
        "server error",
        "internal error",
        "bad gateway",
        "service unavailable",
        "502",
        "503",
    ]) {
        ProviderErrorKind::Server
    } else if has(&["connection", "eof", "reset by peer"]) {
        ProviderErrorKind::Unavailable
    } else {
        fallback
    };
    ProviderError::new(kind, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ModelParams;
    use serde_json::json;

    fn request() -> ModelRequest {
        let call = ToolCall::pending("call_1", "echo", json!({"text": "hi"}));
        let mut resolved = call.clone();
        resolved.succeed(json!({"text": "hi"}));
        ModelRequest {
            model: "gpt-4o-mini".into(),
            messages: vec![
                Message::system("be brief"),
                Message::user("say hi"),
                Message::assistant_with_tools("", vec![call]),
                Message::tool_result(&resolved),
            ],
            tools: vec![ToolSpec {
                name: "echo".into(),
                description: "Echo text".into(),
                parameters: json!({"type": "object", "properties": {"text": {"type": "string"}}}),
            }],
            params: ModelParams {
                temperature: Some(0.2),
                max_tokens: None,
            },
        }
    }

    #[test]
    fn request_maps_roles_and_tool_calls() {
        let req = build_request(&request()).unwrap();
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["model"], "gpt-4o-mini");
        let messages = value["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(messages[2]["tool_calls"][0]["function"]["name"], "echo");
        assert_eq!(
            messages[2]["tool_calls"][0]["function"]["arguments"],
            "{\"text\":\"hi\"}"
        );
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "call_1");
        assert_eq!(value["tools"][0]["function"]["name"], "echo");
    }

    #[test]
    fn unparseable_arguments_stay_as_text() {
        assert_eq!(parse_arguments("{\"a\":1}"), json!({"a": 1}));
        assert_eq!(parse_arguments("{oops"), Value::String("{oops".into()));
        assert_eq!(parse_arguments(""), json!({}));
        assert_eq!(arguments_text(&Value::String("{oops".into())), "{oops");
    }

    #[test]
    fn finish_reason_mapping() {
        assert_eq!(map_finish(Some(VendorFinishReason::Stop), false), FinishReason::Stop);
        assert_eq!(
            map_finish(Some(VendorFinishReason::ToolCalls), true),
            FinishReason::ToolCalls
        );
        assert_eq!(
            map_finish(Some(VendorFinishReason::ContentFilter), false),
            FinishReason::Error
        );
        assert_eq!(map_finish(None, true), FinishReason::ToolCalls);
        assert_eq!(map_finish(None, false), FinishReason::Stop);
    }

    #[test]
    fn vendor_messages_are_classified() {
        let k = |m: &str| classify_message(m, ProviderErrorKind::InvalidRequest).kind;
        assert_eq!(k("Rate limit reached for requests"), ProviderErrorKind::RateLimited);
        assert_eq!(k("Incorrect API key provided"), ProviderErrorKind::Auth);
        assert_eq!(k("The server is overloaded"), ProviderErrorKind::Server);
        assert_eq!(k("unknown parameter: foo"), ProviderErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn missing_key_fails_as_not_configured() {
        let settings = ProviderSettings {
            kind: ProviderKind::DeepSeek,
            base_url: None,
            api_key_env: Some("TOWER_TURNS_TEST_UNSET_KEY".into()),
            api_key: None,
            default_model: "deepseek-chat".into(),
            models: vec![],
            timeout_secs: None,
        };
        let provider = OpenAiCompatibleProvider::from_settings("deepseek", &settings);
        let err = provider.send(request()).await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::NotConfigured);
    }
}
