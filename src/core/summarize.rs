// src/core/summarize.rs — Out-of-band context compaction
//
// Replaces the cumulative goal with an LLM-produced summary, records it as a
// versioned artifact, and re-bases the context token estimate. Runs only
// between cycles; the orchestrator guards that.

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::core::prompt::build_summary_prompt;
use crate::core::types::{ArtifactMetadata, CycleState, Goal};
use crate::infra::config::Config;
use crate::infra::errors::CycleError;
use crate::provider::{sanitize_json_reply, ApiClient, ChatRequest, LlmReply};
use crate::storage::Storage;
use crate::ui::{LogLevel, UiSink};

pub const SUMMARY_ARTIFACT: &str = "meta.summary_context";

#[derive(Debug, Deserialize)]
struct SummaryReply {
    summary: String,
}

/// Rough token re-estimate for the compacted context: chars/4 with 10%
/// headroom plus a fixed overhead for the scaffolding around it.
fn estimate_tokens(summary: &str) -> u64 {
    ((summary.len() as f64 / 4.0) * 1.1).round() as u64 + 500
}

pub async fn summarize_context(
    api: &dyn ApiClient,
    config: &Config,
    state: &mut CycleState,
    storage: &dyn Storage,
    ui: &dyn UiSink,
    cancel: &CancellationToken,
) -> Result<(), CycleError> {
    let current_cycle = state.total_cycles;
    let next_cycle = current_cycle + 1;

    ui.update_status("Summarizing context...", true);
    ui.log_timeline(
        current_cycle,
        "[CONTEXT] Running summarization...",
        LogLevel::Info,
    );

    let goal = state.goal_info();
    let reply = api
        .call(
            ChatRequest {
                prompt: Some(build_summary_prompt(state, &goal)),
                system_instruction: "You compress agent history without losing decisions.".into(),
                model: config.api.core_model.clone(),
                function_decls: Vec::new(),
                history: Vec::new(),
            },
            cancel,
        )
        .await?;

    let content = match reply {
        LlmReply::Text { content, .. } => content,
        LlmReply::FunctionCall { .. } => {
            return Err(CycleError::Parse(
                "summarization replied with a function call".into(),
            ))
        }
    };
    let parsed: SummaryReply = serde_json::from_str(&sanitize_json_reply(&content))
        .map_err(|e| CycleError::Parse(format!("summary JSON invalid: {}", e)))?;
    let summary = parsed.summary;

    storage.set_artifact(SUMMARY_ARTIFACT, next_cycle, &summary)?;
    state.artifact_metadata.insert(
        SUMMARY_ARTIFACT.into(),
        ArtifactMetadata {
            id: SUMMARY_ARTIFACT.into(),
            kind: "TEXT".into(),
            description: "Last Context Summary".into(),
            latest_cycle: next_cycle,
        },
    );

    let seed = state
        .goal
        .as_ref()
        .map(|g| g.seed.clone())
        .unwrap_or_default();
    state.goal = Some(Goal {
        cumulative: format!(
            "Context summarized up to Cycle {}. Original Seed: {}. New Summary:\n{}",
            current_cycle,
            if seed.is_empty() { "None" } else { &seed },
            summary
        ),
        seed,
        latest_type: "Idle".into(),
        summary_context: Some(summary.clone()),
    });

    state.context_token_estimate = estimate_tokens(&summary);
    state.last_feedback = format!("Context summarized at Cycle {}.", current_cycle);
    state.last_critique_type = "Context Summary".into();
    state.total_cycles = next_cycle;

    info!(
        cycle = current_cycle,
        tokens = state.context_token_estimate,
        "context summarized"
    );
    ui.log_timeline(
        current_cycle,
        &format!(
            "[CONTEXT] Summarized. Saved as {}_{}. Est. tokens: {}.",
            SUMMARY_ARTIFACT, next_cycle, state.context_token_estimate
        ),
        LogLevel::Info,
    );
    ui.notify("Context summarized and applied.", LogLevel::Info);
    ui.update_status("Idle", false);

    storage.save_state(state)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::ui::NullUi;
    use async_trait::async_trait;

    struct OneShotApi(Result<String, CycleError>);

    #[async_trait]
    impl ApiClient for OneShotApi {
        async fn call(
            &self,
            _request: ChatRequest,
            _cancel: &CancellationToken,
        ) -> Result<LlmReply, CycleError> {
            match &self.0 {
                Ok(content) => Ok(LlmReply::Text {
                    content: content.clone(),
                    token_count: 30,
                }),
                Err(CycleError::Aborted) => Err(CycleError::Aborted),
                Err(_) => Err(CycleError::Api {
                    message: "down".into(),
                    retriable: false,
                }),
            }
        }
    }

    #[tokio::test]
    async fn test_summarize_replaces_goal_and_advances() {
        let api = OneShotApi(Ok(r#"{"summary": "all history so far"}"#.into()));
        let storage = MemoryStorage::new();
        let mut state = CycleState::default();
        state.total_cycles = 9;
        state.goal = Some(Goal::new("make it fast", "System"));
        state.context_token_estimate = 900_000;

        summarize_context(
            &api,
            &Config::default(),
            &mut state,
            &storage,
            &NullUi,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(state.total_cycles, 10);
        let goal = state.goal.as_ref().unwrap();
        assert_eq!(goal.seed, "make it fast");
        assert!(goal.cumulative.contains("Context summarized up to Cycle 9"));
        assert_eq!(goal.summary_context.as_deref(), Some("all history so far"));
        assert_eq!(goal.latest_type, "Idle");

        assert_eq!(
            storage.get_artifact(SUMMARY_ARTIFACT, 10).unwrap().as_deref(),
            Some("all history so far")
        );
        assert_eq!(state.artifact_metadata[SUMMARY_ARTIFACT].latest_cycle, 10);
        assert_eq!(state.last_critique_type, "Context Summary");

        let expected = estimate_tokens("all history so far");
        assert_eq!(state.context_token_estimate, expected);

        // Checkpointed.
        assert_eq!(storage.load_state().unwrap().unwrap().total_cycles, 10);
    }

    #[tokio::test]
    async fn test_summarize_parse_failure_leaves_state() {
        let api = OneShotApi(Ok("not json".into()));
        let storage = MemoryStorage::new();
        let mut state = CycleState::default();
        state.total_cycles = 3;

        let err = summarize_context(
            &api,
            &Config::default(),
            &mut state,
            &storage,
            &NullUi,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, CycleError::Parse(_)));
        assert_eq!(state.total_cycles, 3);
        assert_eq!(storage.get_artifact(SUMMARY_ARTIFACT, 4).unwrap(), None);
    }

    #[tokio::test]
    async fn test_summarize_abort_propagates() {
        let api = OneShotApi(Err(CycleError::Aborted));
        let storage = MemoryStorage::new();
        let mut state = CycleState::default();

        let err = summarize_context(
            &api,
            &Config::default(),
            &mut state,
            &storage,
            &NullUi,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(err.is_abort());
    }

    #[test]
    fn test_token_estimate_formula() {
        assert_eq!(estimate_tokens(""), 500);
        // 400 chars -> 100 tokens * 1.1 = 110, plus overhead.
        assert_eq!(estimate_tokens(&"x".repeat(400)), 610);
    }
}
