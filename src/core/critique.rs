// src/core/critique.rs — Escalation policy and auto-critique
//
// Rules run in strict priority order and the first match wins. The rule
// chain is a pure function of state, config, timing, confidence and the
// injected random source; only the optional auto-critique reaches the network.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::prompt::build_critique_prompt;
use crate::core::types::{
    CritiqueVerdict, CycleState, GoalInfo, IterationResult, RandomSource, FULL_SOURCE_ARTIFACT,
};
use crate::infra::config::{Config, CycleConfig};
use crate::infra::errors::CycleError;
use crate::provider::{sanitize_json_reply, ApiClient, ChatRequest, LlmReply};
use crate::ui::HitlMode;

/// First matching escalation rule, or `None` when no human is needed.
/// Clears `force_human_review` as a side effect when that rule fires.
pub fn escalation_reason(
    state: &mut CycleState,
    cfg: &CycleConfig,
    cycle_time: Duration,
    confidence: f64,
    current_cycle: u64,
    rng: &mut dyn RandomSource,
) -> Option<(String, HitlMode)> {
    let cycle_secs = cycle_time.as_secs_f64();
    let human_prob = cfg.human_review_prob as f64 / 100.0;

    if state.force_human_review {
        state.force_human_review = false;
        return Some(("Forced Review".into(), HitlMode::Prompt));
    }
    if cfg.pause_after_cycles > 0
        && current_cycle > 0
        && current_cycle % cfg.pause_after_cycles == 0
    {
        return Some((
            format!("Auto Pause ({}/{})", current_cycle, cfg.pause_after_cycles),
            HitlMode::Prompt,
        ));
    }
    if rng.next_f64() < human_prob {
        return Some((
            format!("Random Review ({:.0}%)", human_prob * 100.0),
            HitlMode::CodeEdit,
        ));
    }
    if cycle_secs > cfg.max_cycle_time_secs as f64 {
        return Some((
            format!(
                "Time Limit ({:.1}s > {}s)",
                cycle_secs, cfg.max_cycle_time_secs
            ),
            HitlMode::Prompt,
        ));
    }
    if confidence < cfg.auto_critique_thresh {
        return Some((
            format!(
                "Low Confidence ({:.2} < {})",
                confidence, cfg.auto_critique_thresh
            ),
            HitlMode::Prompt,
        ));
    }
    None
}

#[derive(Debug, Deserialize)]
struct CritiqueReply {
    #[serde(default)]
    critique_passed: bool,
    #[serde(default)]
    critique_report: String,
}

pub struct CritiquePolicy {
    api: Arc<dyn ApiClient>,
    config: Config,
}

impl CritiquePolicy {
    pub fn new(api: Arc<dyn ApiClient>, config: Config) -> Self {
        Self { api, config }
    }

    /// Decide the fate of a successful iteration. Mutates the bookkeeping
    /// fields (`last_critique_type`, `critique_fail_history`, `fail_count`)
    /// exactly as each branch demands; the caller drives UI and transitions
    /// from the returned verdict.
    pub async fn decide(
        &self,
        state: &mut CycleState,
        iteration: &IterationResult,
        goal: &GoalInfo,
        current_cycle: u64,
        rng: &mut dyn RandomSource,
        cancel: &CancellationToken,
    ) -> Result<CritiqueVerdict, CycleError> {
        let confidence = iteration.proposal.agent_confidence_score;
        let llm_prob = self.config.cycle.llm_critique_prob as f64 / 100.0;

        if let Some((reason, mode)) = escalation_reason(
            state,
            &self.config.cycle,
            iteration.cycle_time,
            confidence,
            current_cycle,
            rng,
        ) {
            state.last_critique_type = format!("Human ({})", reason);
            state.record_critique_outcome(false);
            info!(cycle = current_cycle, %reason, "escalating to human");

            let mut verdict = CritiqueVerdict::human(
                &reason,
                mode,
                &format!("Human Intervention: {}", reason),
            );
            verdict.artifact_hint = artifact_hint(&iteration.proposal);
            return Ok(verdict);
        }

        if rng.next_f64() < llm_prob {
            info!(cycle = current_cycle, "running auto-critique");
            let reply = self.run_auto_critique(&iteration.proposal, goal, cancel).await?;

            let label = if reply.critique_passed { "Pass" } else { "Fail" };
            state.last_critique_type = format!("Automated ({})", label);
            state.record_critique_outcome(!reply.critique_passed);

            if !reply.critique_passed {
                warn!(cycle = current_cycle, "auto-critique failed, forcing human review");
                state.fail_count += 1;
                let reason = format!(
                    "Auto Critique Failed: {}",
                    truncate(&reply.critique_report, 150)
                );
                return Ok(CritiqueVerdict::human(
                    &reason,
                    HitlMode::Prompt,
                    &reply.critique_report,
                ));
            }
            return Ok(CritiqueVerdict::proceed(
                "AutoCrit Pass",
                true,
                &reply.critique_report,
            ));
        }

        state.last_critique_type = "Skipped".into();
        state.record_critique_outcome(false);
        Ok(CritiqueVerdict::proceed("Skipped", true, "Critique Skipped"))
    }

    /// Single-shot critique sub-call. API or parse failure counts as a failed
    /// critique rather than an iteration error; only an abort propagates.
    async fn run_auto_critique(
        &self,
        proposal: &crate::core::types::Proposal,
        goal: &GoalInfo,
        cancel: &CancellationToken,
    ) -> Result<CritiqueReply, CycleError> {
        let request = ChatRequest {
            prompt: Some(build_critique_prompt(goal, proposal)),
            system_instruction: "You are a terse, rigorous code reviewer.".into(),
            model: self.config.api.critique_model.clone(),
            function_decls: Vec::new(),
            history: Vec::new(),
        };

        let reply = match self.api.call(request, cancel).await {
            Ok(reply) => reply,
            Err(e) if e.is_abort() => return Err(e),
            Err(e) => {
                return Ok(CritiqueReply {
                    critique_passed: false,
                    critique_report: format!("Critique API error: {}", e),
                })
            }
        };

        let content = match reply {
            LlmReply::Text { content, .. } => content,
            LlmReply::FunctionCall { .. } => {
                return Ok(CritiqueReply {
                    critique_passed: false,
                    critique_report: "Critique replied with a function call".into(),
                })
            }
        };

        match serde_json::from_str::<CritiqueReply>(&sanitize_json_reply(&content)) {
            Ok(parsed) => Ok(parsed),
            Err(e) => Ok(CritiqueReply {
                critique_passed: false,
                critique_report: format!("Critique parse error: {}", e),
            }),
        }
    }
}

fn artifact_hint(proposal: &crate::core::types::Proposal) -> Option<String> {
    proposal
        .modified_artifacts
        .first()
        .map(|a| a.id.clone())
        .or_else(|| proposal.new_artifacts.first().map(|a| a.id.clone()))
        .or_else(|| {
            proposal
                .full_source
                .as_ref()
                .map(|_| FULL_SOURCE_ARTIFACT.to_string())
        })
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        let cut: String = text.chars().take(limit).collect();
        format!("{}...", cut)
    }
}
