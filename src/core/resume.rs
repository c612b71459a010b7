// src/core/resume.rs — Reconciles state after a human pause resolves
//
// Invoked out-of-band once the intervention UI or sandbox closes. The cycle
// counter moves here, not in the UI: informational feedback advances it by
// one, a human code edit advances it to the edit's write cycle, and a
// re-staged full source holds it until sandbox approval.

use tracing::{info, warn};

use crate::core::types::{ArtifactMetadata, CycleState, PersonaMode, FULL_SOURCE_ARTIFACT};
use crate::infra::config::Config;
use crate::storage::Storage;
use crate::ui::{LogLevel, UiSink};

#[derive(Debug, Clone)]
pub enum HumanFeedback {
    /// Free-text guidance for the next cycle.
    Prompt(String),
    /// One of the options the intervention UI offered.
    Options(String),
    /// A validated artifact edit from the code-edit surface.
    CodeEdit {
        artifact_id: String,
        success: bool,
        content_changed: bool,
        validated_content: String,
        error: Option<String>,
    },
    /// The staged self-modification was rejected in the sandbox.
    SandboxDiscarded,
}

impl HumanFeedback {
    pub fn label(&self) -> &'static str {
        match self {
            HumanFeedback::Prompt(_) => "Human Prompt",
            HumanFeedback::Options(_) => "Human Options",
            HumanFeedback::CodeEdit { .. } => "Human Code Edit",
            HumanFeedback::SandboxDiscarded => "Sandbox Discarded",
        }
    }

    /// Only feedback a human actively authored counts as an intervention.
    fn is_human(&self) -> bool {
        self.label().starts_with("Human")
    }

    fn is_informational(&self) -> bool {
        matches!(
            self,
            HumanFeedback::Prompt(_) | HumanFeedback::Options(_) | HumanFeedback::SandboxDiscarded
        )
    }
}

/// Apply resolved human feedback to `state`. `skip_cycle_increment` holds the
/// cycle counter (it is also forced on when a code edit re-stages the full
/// source). Checkpoints state before returning.
pub fn apply_feedback(
    feedback: &HumanFeedback,
    mut skip_cycle_increment: bool,
    state: &mut CycleState,
    storage: &dyn Storage,
    ui: &dyn UiSink,
    config: &Config,
) {
    let current_cycle = state.total_cycles;
    let mut next_cycle = current_cycle;
    let mut apply_success = true;
    let mut code_edit_success = false;
    let mut feedback_msg;

    match feedback {
        HumanFeedback::CodeEdit {
            artifact_id,
            success,
            content_changed,
            validated_content,
            error,
        } => {
            feedback_msg = format!(
                "Edited {}: {}",
                artifact_id,
                if *success {
                    if *content_changed {
                        "Applied successfully.".to_string()
                    } else {
                        "No changes detected.".to_string()
                    }
                } else {
                    format!(
                        "Validation Failed: {}",
                        error.as_deref().unwrap_or("Unknown")
                    )
                }
            );
            code_edit_success = *success && *content_changed;

            if code_edit_success && artifact_id != FULL_SOURCE_ARTIFACT {
                next_cycle = current_cycle + 1;
                match storage.set_artifact(artifact_id, next_cycle, validated_content) {
                    Ok(()) => {
                        match state.artifact_metadata.get_mut(artifact_id) {
                            Some(meta) => meta.latest_cycle = next_cycle,
                            None => {
                                state.artifact_metadata.insert(
                                    artifact_id.clone(),
                                    ArtifactMetadata {
                                        id: artifact_id.clone(),
                                        kind: "Unknown".into(),
                                        description: "Human edit".into(),
                                        latest_cycle: next_cycle,
                                    },
                                );
                            }
                        }
                        info!(artifact = %artifact_id, cycle = next_cycle, "human edit applied");
                        ui.log_timeline(
                            current_cycle,
                            &format!(
                                "[HUMAN] Applied edit to {} for cycle {}",
                                artifact_id, next_cycle
                            ),
                            LogLevel::Info,
                        );
                    }
                    Err(e) => {
                        warn!(artifact = %artifact_id, "failed saving human edit: {}", e);
                        ui.notify(&format!("Failed saving edit: {}", e), LogLevel::Error);
                        apply_success = false;
                        next_cycle = current_cycle;
                    }
                }
            } else if code_edit_success {
                // Full source edited by hand: back through the sandbox gate.
                warn!("full source edited via intervention, re-staging for sandbox");
                state.last_generated_full_source = Some(validated_content.clone());
                skip_cycle_increment = true;
                ui.show_sandbox(validated_content);
            } else if !success {
                apply_success = false;
            }
        }
        HumanFeedback::Options(selected) => {
            feedback_msg = format!("Selected: {}", if selected.is_empty() { "None" } else { selected });
        }
        HumanFeedback::Prompt(text) => {
            feedback_msg = text.clone();
        }
        HumanFeedback::SandboxDiscarded => {
            feedback_msg = "Sandbox changes discarded".into();
            // The staged source lives in CycleState, not in any sandbox
            // surface, so a discard must clear it here or nothing will.
            state.last_generated_full_source = None;
        }
    }

    if feedback_msg.chars().count() > 150 {
        feedback_msg = feedback_msg.chars().take(150).collect();
    }
    state.last_feedback = format!("{}: {}", feedback.label(), feedback_msg);

    if !code_edit_success && !feedback.is_informational() {
        state.record_critique_outcome(!apply_success);
    }
    if feedback.is_human() {
        state.human_interventions += 1;
    }

    ui.log_timeline(
        current_cycle,
        &format!("[STATE] {} processed.", feedback.label()),
        LogLevel::Info,
    );
    ui.hide_intervention();

    if apply_success && !skip_cycle_increment {
        state.total_cycles = if next_cycle == current_cycle {
            current_cycle + 1
        } else {
            next_cycle
        };
    }

    if !skip_cycle_increment {
        state.persona_mode = PersonaMode::from_balance(config.cycle.persona_balance);
        state.retry_count = 0;
        ui.update_status("Idle", false);
    } else {
        ui.update_status("Sandbox Pending...", false);
    }
    ui.update_metrics(state);

    if let Err(e) = storage.save_state(state) {
        warn!("checkpoint after resume failed: {}", e);
    }
}
