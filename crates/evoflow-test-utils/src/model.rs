use std::collections::VecDeque;
use std::sync::Mutex;

use futures::future::BoxFuture;

use evoflow_core::error::{EvoflowError, ProviderErrorKind, Result};
use evoflow_core::traits::ModelClient;
use evoflow_core::types::*;

pub fn text_response(text: &str) -> ModelResponse {
    ModelResponse {
        content: vec![ContentBlock::Text { text: text.into() }],
        usage: TokenUsage::new(100, 50),
    }
}

pub fn json_response(value: serde_json::Value) -> ModelResponse {
    text_response(&value.to_string())
}

pub fn tool_call_response(name: &str, input: serde_json::Value) -> ModelResponse {
    ModelResponse {
        content: vec![ContentBlock::ToolUse {
            id: format!("call_{}", uuid::Uuid::new_v4().simple()),
            name: name.into(),
            input,
        }],
        usage: TokenUsage::new(100, 20),
    }
}

enum Scripted {
    Response(ModelResponse),
    Failure(ProviderErrorKind, String),
}

/// Model client that replays a fixed queue of replies, then a fallback text.
pub struct ScriptedModelClient {
    queue: Mutex<VecDeque<Scripted>>,
    fallback: String,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModelClient {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            fallback: "done".into(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_fallback(mut self, text: &str) -> Self {
        self.fallback = text.into();
        self
    }

    pub fn then(self, response: ModelResponse) -> Self {
        self.queue
            .lock()
            .unwrap()
            .push_back(Scripted::Response(response));
        self
    }

    pub fn then_text(self, text: &str) -> Self {
        self.then(text_response(text))
    }

    pub fn then_error(self, kind: ProviderErrorKind, message: &str) -> Self {
        self.queue
            .lock()
            .unwrap()
            .push_back(Scripted::Failure(kind, message.into()));
        self
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl Default for ScriptedModelClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelClient for ScriptedModelClient {
    fn complete(&self, request: ModelRequest) -> BoxFuture<'_, Result<ModelResponse>> {
        self.requests.lock().unwrap().push(request);
        let next = self.queue.lock().unwrap().pop_front();
        let fallback = self.fallback.clone();
        Box::pin(async move {
            match next {
                Some(Scripted::Response(r)) => Ok(r),
                Some(Scripted::Failure(kind, message)) => Err(EvoflowError::provider(kind, message)),
                None => Ok(text_response(&fallback)),
            }
        })
    }
}

/// Model client that answers through a closure, for tests where calls
/// arrive concurrently and a fixed order cannot be scripted.
pub struct FnModelClient<F> {
    respond: F,
    requests: Mutex<Vec<ModelRequest>>,
}

impl<F> FnModelClient<F>
where
    F: Fn(&ModelRequest) -> Result<ModelResponse> + Send + Sync + 'static,
{
    pub fn new(respond: F) -> Self {
        Self {
            respond,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl<F> ModelClient for FnModelClient<F>
where
    F: Fn(&ModelRequest) -> Result<ModelResponse> + Send + Sync + 'static,
{
    fn complete(&self, request: ModelRequest) -> BoxFuture<'_, Result<ModelResponse>> {
        let result = (self.respond)(&request);
        self.requests.lock().unwrap().push(request);
        Box::pin(async move { result })
    }
}

/// The system prompt of a request, if any.
pub fn system_text(request: &ModelRequest) -> String {
    request
        .messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.text())
        .collect::<Vec<_>>()
        .join("\n")
}

/// The last user text of a request.
pub fn last_user_text(request: &ModelRequest) -> String {
    request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User && !m.text().is_empty())
        .map(|m| m.text())
        .unwrap_or_default()
}
