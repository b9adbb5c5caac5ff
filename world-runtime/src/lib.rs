//! World hydration (C4) and the agent responder pipeline (C5).

pub mod addressing;
pub mod error;
pub mod provider;
pub mod responder;
pub mod runtime;

pub use addressing::{extract_mentions, should_respond, with_auto_mention};
pub use error::{ResponderError, RuntimeError};
pub use provider::{
    CompletionOutcome, CompletionRequest, ModelProvider, MockProvider, ProviderMessage,
    ResponseEvent, ToolCallRequest,
};
pub use responder::{
    parse_tool_result_envelope, AgentResponder, NoopToolExecutor, PipelineState, ToolExecutor,
    TurnOutcome,
};
pub use runtime::{Dispatcher, WorldRuntime};
