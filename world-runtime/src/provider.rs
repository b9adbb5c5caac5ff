//! LLM provider abstraction (§4.5.6). Real SDKs are out of scope; this trait
//! is the contract the responder drives, generalizing the teacher's
//! `LlmClient` to a streamed, tool-call-aware turn.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ResponderError;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<serde_json::Value>,
}

#[derive(Clone, Debug)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub history: Vec<ProviderMessage>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One token/event of a streamed completion.
#[derive(Clone, Debug)]
pub enum ResponseEvent {
    TextDelta(String),
    ToolCall(ToolCallRequest),
    Usage { prompt_tokens: u32, completion_tokens: u32 },
    Done,
}

/// A provider turn: full text plus any requested tool calls, after the stream
/// has been drained.
#[derive(Clone, Debug, Default)]
pub struct CompletionOutcome {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
}

#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Runs one turn; streams events through `chunk_tx` (when present) as
    /// they arrive and returns the aggregated outcome at the end.
    async fn complete(
        &self,
        request: CompletionRequest,
        chunk_tx: Option<mpsc::Sender<ResponseEvent>>,
    ) -> Result<CompletionOutcome, ResponderError>;
}

/// Fixed-response provider for tests, generalizing the teacher's `MockLlm`.
pub struct MockProvider {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
}

impl MockProvider {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn with_tool_call(content: impl Into<String>, call: ToolCallRequest) -> Self {
        Self {
            content: content.into(),
            tool_calls: vec![call],
        }
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    async fn complete(
        &self,
        _request: CompletionRequest,
        chunk_tx: Option<mpsc::Sender<ResponseEvent>>,
    ) -> Result<CompletionOutcome, ResponderError> {
        if let Some(tx) = chunk_tx {
            if !self.content.is_empty() {
                let _ = tx.send(ResponseEvent::TextDelta(self.content.clone())).await;
            }
            for call in &self.tool_calls {
                let _ = tx.send(ResponseEvent::ToolCall(call.clone())).await;
            }
            let _ = tx.send(ResponseEvent::Done).await;
        }
        Ok(CompletionOutcome {
            content: self.content.clone(),
            tool_calls: self.tool_calls.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_provider_streams_full_content_as_one_chunk() {
        let provider = MockProvider::text("hello");
        let (tx, mut rx) = mpsc::channel(4);
        let outcome = provider
            .complete(
                CompletionRequest {
                    system_prompt: String::new(),
                    history: vec![],
                    temperature: 0.7,
                    max_tokens: None,
                },
                Some(tx),
            )
            .await
            .unwrap();
        assert_eq!(outcome.content, "hello");
        match rx.recv().await.unwrap() {
            ResponseEvent::TextDelta(s) => assert_eq!(s, "hello"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
