//! Bounded tool-calling session driver.
//!
//! One session is one conversation with a chat provider: send the transcript
//! and tool catalog, dispatch whatever tool calls come back, append the
//! results, repeat. The loop is bounded; a model that never stops calling
//! tools exhausts the budget and returns [`SessionOutcome::DidNotConverge`]
//! instead of hanging.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::tools::{ToolContext, ToolRegistry, ToolSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One transcript turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Set on tool-result turns, echoing the call being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Set on assistant turns that requested tool calls.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }
}

/// One tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// What a provider returned for one completion.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderReply {
    /// Plain text, no tool calls: the session is over.
    Final(String),
    ToolCalls(Vec<ToolCall>),
}

/// One completion request: the full transcript plus the tool catalog.
#[derive(Debug)]
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [Message],
    pub tools: &'a [ToolSpec],
}

/// Seam to the model backend. Implementations own transport, auth, retries.
pub trait ChatProvider {
    fn complete(&mut self, request: &ChatRequest<'_>) -> Result<ProviderReply>;
}

impl<P: ChatProvider + ?Sized> ChatProvider for &mut P {
    fn complete(&mut self, request: &ChatRequest<'_>) -> Result<ProviderReply> {
        (**self).complete(request)
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The model answered with text and no tool calls.
    Final(String),
    /// A handler invoked the stop tool.
    Stopped { reason: String },
    /// The iteration budget ran out before the model finished.
    DidNotConverge,
}

pub struct ToolSession<'a, P: ChatProvider> {
    provider: P,
    registry: &'a ToolRegistry,
    model: String,
    max_iterations: usize,
    messages: Vec<Message>,
}

impl<'a, P: ChatProvider> ToolSession<'a, P> {
    pub fn new(
        provider: P,
        registry: &'a ToolRegistry,
        model: impl Into<String>,
        max_iterations: usize,
    ) -> Self {
        Self {
            provider,
            registry,
            model: model.into(),
            max_iterations,
            messages: Vec::new(),
        }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Drive the conversation to completion within the iteration budget.
    ///
    /// Tool handler failures become structured error results in the
    /// transcript; they never abort the session.
    #[instrument(skip_all, fields(model = %self.model))]
    pub fn run(&mut self, context: &ToolContext) -> Result<SessionOutcome> {
        for iteration in 1..=self.max_iterations {
            let request = ChatRequest {
                model: &self.model,
                messages: &self.messages,
                tools: self.registry.specs(),
            };
            let reply = self.provider.complete(&request)?;

            match reply {
                ProviderReply::Final(text) => {
                    debug!(iteration, "session finished with text");
                    self.messages.push(Message::assistant(text.clone()));
                    return Ok(SessionOutcome::Final(text));
                }
                ProviderReply::ToolCalls(calls) => {
                    debug!(iteration, calls = calls.len(), "dispatching tool calls");
                    self.messages.push(Message {
                        role: Role::Assistant,
                        content: String::new(),
                        tool_call_id: None,
                        tool_calls: calls.clone(),
                    });
                    for call in &calls {
                        let result =
                            self.registry.dispatch(&call.name, call.args.clone(), context);
                        self.messages.push(Message {
                            role: Role::Tool,
                            content: result.to_string(),
                            tool_call_id: Some(call.id.clone()),
                            tool_calls: Vec::new(),
                        });
                    }
                    // Every call in the turn got its result before the stop
                    // takes effect, so the transcript stays well-formed.
                    if let Some(reason) = context.take_stop_reason() {
                        return Ok(SessionOutcome::Stopped { reason });
                    }
                }
            }
        }
        debug!(budget = self.max_iterations, "session budget exhausted");
        Ok(SessionOutcome::DidNotConverge)
    }
}
