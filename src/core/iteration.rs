// src/core/iteration.rs — One LLM round: ask, optionally run one tool, ask again
//
// The two-phase bound is carried by the types: `LlmReply::Text` is terminal,
// `LlmReply::FunctionCall` buys exactly one tool round, and a second function
// call in the follow-up reply is a parse error, not a deeper recursion.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::prompt::build_core_prompt;
use crate::core::types::{CycleState, GoalInfo, IterationResult, ProgressEvent, ProgressSender, Proposal};
use crate::infra::config::Config;
use crate::infra::errors::CycleError;
use crate::provider::{sanitize_json_reply, ApiClient, ChatRequest, HistoryEntry, LlmReply};
use crate::storage::Storage;
use crate::tools::{ToolDeclaration, ToolRunner};

const SYSTEM_INSTRUCTION: &str =
    "You are the core reasoning engine of a self-modifying agent. You read \
     your own artifacts, propose mutations, and must answer in strict JSON.";

pub struct IterationRunner {
    api: Arc<dyn ApiClient>,
    tools: Arc<dyn ToolRunner>,
    static_tools: Vec<ToolDeclaration>,
    config: Config,
}

impl IterationRunner {
    pub fn new(
        api: Arc<dyn ApiClient>,
        tools: Arc<dyn ToolRunner>,
        static_tools: Vec<ToolDeclaration>,
        config: Config,
    ) -> Self {
        Self {
            api,
            tools,
            static_tools,
            config,
        }
    }

    /// Run one iteration for `cycle`. Retry policy lives in the caller; this
    /// returns the first error it hits. Success resets `retry_count` and
    /// pushes the token sample.
    pub async fn run_once(
        &self,
        state: &mut CycleState,
        goal: &GoalInfo,
        cycle: u64,
        storage: &dyn Storage,
        cancel: &CancellationToken,
        progress: &ProgressSender,
    ) -> Result<IterationResult, CycleError> {
        let started = Instant::now();

        let prompt = build_core_prompt(state, goal, &self.config, &self.static_tools, storage);
        let mut declarations = self.static_tools.clone();
        declarations.extend(state.dynamic_tools.iter().map(|t| t.declaration.clone()));

        let first = self
            .api
            .call(
                ChatRequest {
                    prompt: Some(prompt.clone()),
                    system_instruction: SYSTEM_INSTRUCTION.into(),
                    model: self.config.api.core_model.clone(),
                    function_decls: declarations.clone(),
                    history: Vec::new(),
                },
                cancel,
            )
            .await?;

        let mut total_tokens = first.token_count();

        let content = match first {
            LlmReply::Text { content, .. } => content,
            LlmReply::FunctionCall { call, .. } => {
                debug!(cycle, tool = %call.name, "model requested tool");
                let _ = progress.send(ProgressEvent::ToolCall {
                    name: call.name.clone(),
                });

                // A failed tool run goes back to the model as a function
                // error; the model sees the failure and can still answer.
                // Only an abort cuts the round short.
                let tool_entry = match self
                    .tools
                    .run_tool(&call.name, &call.args, &self.static_tools, &state.dynamic_tools)
                    .await
                {
                    Ok(response) => HistoryEntry::FunctionResult {
                        name: call.name.clone(),
                        response,
                    },
                    Err(e) if e.is_abort() => return Err(e),
                    Err(e) => {
                        warn!(cycle, tool = %call.name, "tool failed: {}", e);
                        HistoryEntry::FunctionError {
                            name: call.name.clone(),
                            error: format!("Tool failed: {}", e),
                        }
                    }
                };

                let history = vec![
                    HistoryEntry::User(prompt),
                    HistoryEntry::ModelFunctionCall(call.clone()),
                    tool_entry,
                ];

                let second = self
                    .api
                    .call(
                        ChatRequest {
                            prompt: None,
                            system_instruction: SYSTEM_INSTRUCTION.into(),
                            model: self.config.api.core_model.clone(),
                            function_decls: declarations,
                            history,
                        },
                        cancel,
                    )
                    .await?;
                total_tokens += second.token_count();

                match second {
                    LlmReply::Text { content, .. } => content,
                    LlmReply::FunctionCall { call, .. } => {
                        return Err(CycleError::Parse(format!(
                            "model requested a second tool call ('{}') after the tool round",
                            call.name
                        )));
                    }
                }
            }
        };

        let sanitized = sanitize_json_reply(&content);
        let proposal: Proposal = serde_json::from_str(&sanitized)
            .map_err(|e| CycleError::Parse(format!("proposal JSON invalid: {}", e)))?;

        state.retry_count = 0;
        state.record_tokens(total_tokens);

        Ok(IterationResult {
            proposal,
            cycle_time: started.elapsed(),
            token_count: total_tokens,
        })
    }
}
