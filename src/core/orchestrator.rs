// src/core/orchestrator.rs — Top-level cycle state machine
//
// Drives prepare → iterate (bounded retry) → decide → apply, parking on
// AwaitingHuman / AwaitingSandbox when an external actor must act. Exactly
// one cycle runs at a time; `CycleState` is single-writer through `&mut self`
// and checkpointed after every transition so the process can be torn down
// while parked.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::apply::apply_proposal;
use crate::core::critique::CritiquePolicy;
use crate::core::iteration::IterationRunner;
use crate::core::resume::{apply_feedback, HumanFeedback};
use crate::core::summarize;
use crate::core::types::{
    CritiqueStatus, CycleState, Goal, GoalInfo, IterationResult, PersonaMode, ProgressEvent,
    ProgressSender, RandomSource,
};
use crate::infra::config::Config;
use crate::infra::errors::CycleError;
use crate::provider::ApiClient;
use crate::storage::Storage;
use crate::tools::{ToolDeclaration, ToolRunner};
use crate::ui::{HitlMode, LogLevel, UiSink};

/// How a cycle invocation ended. Fatal-config failures are `Err` instead;
/// they leave no trace on the state.
#[derive(Debug, Clone)]
pub enum CycleOutcome {
    Completed { next_cycle: u64, apply_source: String },
    AwaitingHuman { reason: String },
    AwaitingSandbox,
    Aborted,
}

/// Cloneable handle for cancelling the in-flight cycle from another task.
#[derive(Clone)]
pub struct AbortHandle {
    cancel: Arc<StdMutex<CancellationToken>>,
}

impl AbortHandle {
    pub fn abort(&self) {
        if let Ok(token) = self.cancel.lock() {
            token.cancel();
        }
    }
}

pub struct CycleOrchestrator {
    config: Config,
    api: Arc<dyn ApiClient>,
    storage: Arc<dyn Storage>,
    ui: Arc<dyn UiSink>,
    runner: IterationRunner,
    critique: CritiquePolicy,
    rng: Box<dyn RandomSource>,
    progress: ProgressSender,
    state: CycleState,
    running: Arc<AtomicBool>,
    cancel: Arc<StdMutex<CancellationToken>>,
}

impl CycleOrchestrator {
    /// Build the orchestrator, resuming from the last checkpoint when one
    /// exists.
    pub fn new(
        config: Config,
        api: Arc<dyn ApiClient>,
        storage: Arc<dyn Storage>,
        tools: Arc<dyn ToolRunner>,
        static_tools: Vec<ToolDeclaration>,
        ui: Arc<dyn UiSink>,
        rng: Box<dyn RandomSource>,
        progress: ProgressSender,
    ) -> Result<Self, CycleError> {
        let state = storage.load_state()?.unwrap_or_default();
        let runner = IterationRunner::new(
            Arc::clone(&api),
            tools,
            static_tools,
            config.clone(),
        );
        let critique = CritiquePolicy::new(Arc::clone(&api), config.clone());
        Ok(Self {
            config,
            api,
            storage,
            ui,
            runner,
            critique,
            rng,
            progress,
            state,
            running: Arc::new(AtomicBool::new(false)),
            cancel: Arc::new(StdMutex::new(CancellationToken::new())),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> &CycleState {
        &self.state
    }

    pub fn active_goal_info(&self) -> GoalInfo {
        self.state.goal_info()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            cancel: Arc::clone(&self.cancel),
        }
    }

    /// Cancel the in-flight LLM call and retry backoff. Safe from any state;
    /// a no-op when nothing is running.
    pub fn abort_current_cycle(&self) {
        info!("abort requested");
        if let Ok(token) = self.cancel.lock() {
            token.cancel();
        }
    }

    /// Run one full cycle. `goal_text` seeds or refines the goal; pass `None`
    /// to continue with the existing one.
    pub async fn execute_cycle(
        &mut self,
        goal_text: Option<&str>,
        goal_type: &str,
    ) -> Result<CycleOutcome, CycleError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(CycleError::FatalConfig("Cycle already running".into()));
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        info!(%run_id, cycle = self.state.total_cycles, "cycle invocation started");

        let cancel = self.fresh_cancel_token()?;
        let result = self.run_cycle(goal_text, goal_type, &cancel).await;
        self.running.store(false, Ordering::SeqCst);

        match result {
            Ok(outcome) => {
                self.checkpoint();
                Ok(outcome)
            }
            Err(e) if e.is_abort() => {
                self.ui.log_timeline(
                    self.state.total_cycles,
                    "[CYCLE] Cycle aborted by user.",
                    LogLevel::Warn,
                );
                self.ui.update_status("Aborted", false);
                let _ = self.progress.send(ProgressEvent::Aborted);
                self.checkpoint();
                Ok(CycleOutcome::Aborted)
            }
            // Fatal-config: no transition happened, nothing to checkpoint.
            Err(e) => Err(e),
        }
    }

    async fn run_cycle(
        &mut self,
        goal_text: Option<&str>,
        goal_type: &str,
        cancel: &CancellationToken,
    ) -> Result<CycleOutcome, CycleError> {
        let (goal, current_cycle) = self.prepare(goal_text, goal_type)?;
        self.checkpoint();

        let iteration = match self.iterate(&goal, current_cycle, cancel).await? {
            Ok(iteration) => iteration,
            Err(reason) => {
                self.checkpoint();
                return Ok(self.pause_for_human(HitlMode::Prompt, &reason, None));
            }
        };
        self.checkpoint();

        let verdict = self
            .critique
            .decide(
                &mut self.state,
                &iteration,
                &goal,
                current_cycle,
                self.rng.as_mut(),
                cancel,
            )
            .await?;
        self.ui.update_metrics(&self.state);
        let _ = self.progress.send(ProgressEvent::Decision {
            apply_source: verdict.apply_source.clone(),
        });
        self.checkpoint();

        if verdict.status == CritiqueStatus::HitlRequired {
            let reason = verdict.reason.clone().unwrap_or_default();
            return Ok(self.pause_for_human(
                verdict.hitl_mode,
                &reason,
                verdict.artifact_hint.as_deref(),
            ));
        }

        self.ui.update_status("Applying Changes...", true);
        let apply = apply_proposal(
            &iteration.proposal,
            current_cycle,
            &verdict.apply_source,
            &mut self.state,
            self.storage.as_ref(),
        );

        if apply.requires_sandbox {
            self.state.last_critique_type =
                format!("{} (Sandbox Pending)", verdict.apply_source);
            if let Some(source) = &self.state.last_generated_full_source {
                self.ui.show_sandbox(source);
            }
            self.ui.update_status("Sandbox Pending...", false);
            let _ = self.progress.send(ProgressEvent::Paused {
                reason: "Sandbox Pending".into(),
            });
            return Ok(CycleOutcome::AwaitingSandbox);
        }

        if !apply.success {
            self.state.fail_count += 1;
            let joined = apply.errors.join(", ");
            self.state.last_feedback =
                format!("{}, apply failed: {}", verdict.apply_source, joined);
            self.ui.log_timeline(
                current_cycle,
                &format!("[APPLY ERR] Failed apply: {}. Forcing HITL.", joined),
                LogLevel::Error,
            );
            let reason = format!("Failed apply after critique: {}", joined);
            return Ok(self.pause_for_human(HitlMode::Prompt, &reason, None));
        }

        self.state.agent_iterations += 1;
        self.state.total_cycles = apply.next_cycle;
        self.state.last_feedback = format!(
            "{}, applied successfully for Cycle {}.",
            verdict.apply_source, apply.next_cycle
        );
        self.ui.update_metrics(&self.state);
        self.ui.log_timeline(
            apply.next_cycle,
            &format!(
                "[STATE] Cycle ended ({}). Ready.",
                self.state.last_critique_type
            ),
            LogLevel::Info,
        );
        self.ui.update_status("Idle", false);
        let _ = self.progress.send(ProgressEvent::Applied {
            next_cycle: apply.next_cycle,
            changes: apply.changes.len(),
        });
        let _ = self.progress.send(ProgressEvent::Completed {
            cycle: apply.next_cycle,
        });

        Ok(CycleOutcome::Completed {
            next_cycle: apply.next_cycle,
            apply_source: verdict.apply_source,
        })
    }

    /// Precondition pass. Fatal-config failures happen before any state
    /// mutation; the goal seed/refine is the first mutation and only runs
    /// once all checks hold.
    fn prepare(
        &mut self,
        goal_text: Option<&str>,
        goal_type: &str,
    ) -> Result<(GoalInfo, u64), CycleError> {
        if self.ui.is_sandbox_pending() {
            return Err(CycleError::FatalConfig("Sandbox approval pending".into()));
        }
        if !self.ui.is_intervention_hidden() {
            return Err(CycleError::FatalConfig("Human intervention required".into()));
        }
        if self.config.api.key.trim().len() < 10 {
            return Err(CycleError::FatalConfig("Valid API key required".into()));
        }

        let goal_text = goal_text.map(str::trim).filter(|t| !t.is_empty());
        if goal_text.is_none() && self.state.goal.is_none() {
            return Err(CycleError::FatalConfig("Initial goal required".into()));
        }

        let max_cycles = self.config.cycle.max_cycles;
        if max_cycles > 0 && self.state.total_cycles >= max_cycles {
            return Err(CycleError::FatalConfig(format!(
                "Max cycles ({}) reached",
                max_cycles
            )));
        }

        if self.state.context_token_estimate >= self.config.context.token_warn_threshold {
            self.ui.notify(
                "Context tokens high. Consider summarizing.",
                LogLevel::Warn,
            );
        }

        let current_cycle = self.state.total_cycles;
        if let Some(text) = goal_text {
            match &mut self.state.goal {
                Some(goal) => goal.refine(current_cycle, text, goal_type),
                None => self.state.goal = Some(Goal::new(text, goal_type)),
            }
        }

        self.state.retry_count = 0;
        self.state.persona_mode = PersonaMode::from_balance(self.config.cycle.persona_balance);

        let goal = self.state.goal_info();
        self.ui.update_status("Starting Cycle...", true);
        self.ui.log_timeline(
            current_cycle,
            &format!(
                "[CYCLE] === Cycle {} Start === Goal: {}, Persona: {:?}",
                current_cycle, goal.goal_type, self.state.persona_mode
            ),
            LogLevel::Info,
        );
        let _ = self.progress.send(ProgressEvent::CycleStart {
            cycle: current_cycle,
        });

        Ok((goal, current_cycle))
    }

    /// Iteration retry loop. `Ok(Ok(result))` on success, `Ok(Err(reason))`
    /// when retries are exhausted and a human must take over; aborts
    /// propagate as `Err`.
    async fn iterate(
        &mut self,
        goal: &GoalInfo,
        current_cycle: u64,
        cancel: &CancellationToken,
    ) -> Result<Result<IterationResult, String>, CycleError> {
        loop {
            self.ui.log_timeline(
                current_cycle,
                &format!(
                    "[STATE] Agent Iteration Attempt (Retry: {})",
                    self.state.retry_count
                ),
                LogLevel::Info,
            );
            let _ = self.progress.send(ProgressEvent::IterationAttempt {
                cycle: current_cycle,
                attempt: self.state.retry_count,
            });

            let attempt = self
                .runner
                .run_once(
                    &mut self.state,
                    goal,
                    current_cycle,
                    self.storage.as_ref(),
                    cancel,
                    &self.progress,
                )
                .await;

            let err = match attempt {
                Ok(result) => return Ok(Ok(result)),
                Err(e) if e.is_abort() => return Err(e),
                Err(e) => e,
            };

            error!(
                cycle = current_cycle,
                retry = self.state.retry_count,
                "iteration failed: {}",
                err
            );
            self.state.retry_count += 1;

            let budget_spent = self.state.retry_count > self.config.cycle.max_retries;
            if budget_spent || !err.is_retriable() {
                self.state.fail_count += 1;
                self.ui.update_metrics(&self.state);
                self.ui.log_timeline(
                    current_cycle,
                    "[RETRY] Max retries exceeded. Forcing HITL.",
                    LogLevel::Error,
                );
                return Ok(Err(format!(
                    "Cycle failed after {} attempts: {}",
                    self.state.retry_count, err
                )));
            }

            self.state.last_feedback =
                format!("Retry {}: {}", self.state.retry_count, truncate(&err.to_string(), 100));
            let delay = Duration::from_millis(1000 * self.state.retry_count as u64);
            tokio::select! {
                _ = cancel.cancelled() => return Err(CycleError::Aborted),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn pause_for_human(
        &mut self,
        mode: HitlMode,
        reason: &str,
        artifact_hint: Option<&str>,
    ) -> CycleOutcome {
        warn!(cycle = self.state.total_cycles, %reason, "pausing for human");
        self.ui.update_status(&format!("Paused: Human Review ({})", reason), false);
        self.ui.show_intervention(mode, reason, artifact_hint);
        let _ = self.progress.send(ProgressEvent::Paused {
            reason: reason.to_string(),
        });
        CycleOutcome::AwaitingHuman {
            reason: reason.to_string(),
        }
    }

    /// Resolve a pause with human feedback. Refused while a cycle is running.
    pub fn proceed_after_human_intervention(
        &mut self,
        feedback: &HumanFeedback,
        skip_cycle_increment: bool,
    ) -> Result<(), CycleError> {
        if self.is_running() {
            return Err(CycleError::FatalConfig(
                "Cannot resume while a cycle is running".into(),
            ));
        }
        apply_feedback(
            feedback,
            skip_cycle_increment,
            &mut self.state,
            self.storage.as_ref(),
            self.ui.as_ref(),
            &self.config,
        );
        Ok(())
    }

    /// Out-of-band context compaction. Refused while a cycle is running.
    pub async fn summarize_context(&mut self) -> Result<(), CycleError> {
        if self.config.api.key.trim().len() < 10 {
            return Err(CycleError::FatalConfig(
                "Valid API key required for summarization".into(),
            ));
        }
        if self.is_running() {
            return Err(CycleError::FatalConfig(
                "Cannot summarize context while cycle is running".into(),
            ));
        }
        let cancel = self.fresh_cancel_token()?;
        summarize::summarize_context(
            self.api.as_ref(),
            &self.config,
            &mut self.state,
            self.storage.as_ref(),
            self.ui.as_ref(),
            &cancel,
        )
        .await
    }

    /// Replace a token consumed by a previous abort so cancellation never
    /// leaks across cycles.
    fn fresh_cancel_token(&self) -> Result<CancellationToken, CycleError> {
        let mut guard = self
            .cancel
            .lock()
            .map_err(|_| CycleError::FatalConfig("cancellation token lock poisoned".into()))?;
        if guard.is_cancelled() {
            *guard = CancellationToken::new();
        }
        Ok(guard.clone())
    }

    /// Checkpoint failures are logged, never fatal: the cycle's own result
    /// matters more than the persistence of this snapshot.
    fn checkpoint(&self) {
        if let Err(e) = self.storage.save_state(&self.state) {
            warn!("checkpoint failed: {}", e);
        }
    }
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        text.chars().take(limit).collect()
    }
}
