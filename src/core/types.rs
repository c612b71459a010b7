// src/core/types.rs — Cycle state, goal, proposal and verdict types

use std::collections::HashMap;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::tools::{DynamicTool, ToolDeclaration};
use crate::ui::HitlMode;

/// Sentinel artifact id for the staged self-modification payload. A human
/// code edit targeting this id re-stages the sandbox instead of writing a
/// versioned artifact.
pub const FULL_SOURCE_ARTIFACT: &str = "full_source";

/// Ring buffers feeding the rolling metrics keep at most this many samples.
pub const HISTORY_CAP: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersonaMode {
    Divergent,
    Convergent,
}

impl PersonaMode {
    /// Balance is a 0-100 ratio; the divergent persona leads at >= 50.
    pub fn from_balance(balance: u32) -> Self {
        if balance >= 50 {
            PersonaMode::Divergent
        } else {
            PersonaMode::Convergent
        }
    }
}

impl Default for PersonaMode {
    fn default() -> Self {
        PersonaMode::Divergent
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub id: String,
    pub kind: String,
    pub description: String,
    /// Highest cycle for which content was durably written. Never advanced
    /// before the write lands.
    pub latest_cycle: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Goal {
    pub seed: String,
    /// Append-only refinement log; replaced wholesale only by summarization.
    pub cumulative: String,
    pub latest_type: String,
    pub summary_context: Option<String>,
}

impl Goal {
    pub fn new(seed: &str, goal_type: &str) -> Self {
        Self {
            seed: seed.to_string(),
            cumulative: seed.to_string(),
            latest_type: goal_type.to_string(),
            summary_context: None,
        }
    }

    pub fn refine(&mut self, cycle: u64, text: &str, goal_type: &str) {
        self.cumulative
            .push_str(&format!("\n[Cycle {} Refinement ({})]: {}", cycle, goal_type, text));
        self.latest_type = goal_type.to_string();
    }
}

/// Read-only snapshot of the goal handed to prompt assembly and critique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalInfo {
    pub seed: String,
    pub cumulative: String,
    pub latest_goal: String,
    pub goal_type: String,
    pub summary_context: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleState {
    #[serde(default)]
    pub total_cycles: u64,
    #[serde(default)]
    pub agent_iterations: u64,
    #[serde(default)]
    pub human_interventions: u64,
    #[serde(default)]
    pub fail_count: u64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub force_human_review: bool,
    #[serde(default)]
    pub persona_mode: PersonaMode,

    #[serde(default)]
    pub confidence_history: Vec<f64>,
    #[serde(default)]
    pub critique_fail_history: Vec<bool>,
    #[serde(default)]
    pub token_history: Vec<u64>,
    #[serde(default)]
    pub avg_confidence: Option<f64>,
    #[serde(default)]
    pub critique_fail_rate: Option<f64>,
    #[serde(default)]
    pub avg_tokens: Option<f64>,
    #[serde(default)]
    pub context_token_estimate: u64,

    #[serde(default)]
    pub last_critique_type: String,
    #[serde(default)]
    pub last_feedback: String,

    #[serde(default)]
    pub dynamic_tools: Vec<DynamicTool>,
    #[serde(default)]
    pub last_generated_full_source: Option<String>,
    #[serde(default)]
    pub artifact_metadata: HashMap<String, ArtifactMetadata>,
    #[serde(default)]
    pub goal: Option<Goal>,
}

impl CycleState {
    pub fn record_confidence(&mut self, confidence: f64) {
        push_capped(&mut self.confidence_history, confidence);
        let sum: f64 = self.confidence_history.iter().sum();
        self.avg_confidence = Some(sum / self.confidence_history.len() as f64);
    }

    /// `failed = true` means the critique (auto or human) rejected the cycle.
    pub fn record_critique_outcome(&mut self, failed: bool) {
        push_capped(&mut self.critique_fail_history, failed);
        let fails = self.critique_fail_history.iter().filter(|f| **f).count();
        self.critique_fail_rate =
            Some(fails as f64 * 100.0 / self.critique_fail_history.len() as f64);
    }

    pub fn record_tokens(&mut self, tokens: u64) {
        push_capped(&mut self.token_history, tokens);
        let sum: u64 = self.token_history.iter().sum();
        self.avg_tokens = Some(sum as f64 / self.token_history.len() as f64);
        self.context_token_estimate = self.context_token_estimate.saturating_add(tokens);
    }

    /// Upsert keyed by declaration name: replace in place or append.
    pub fn upsert_dynamic_tool(&mut self, tool: DynamicTool) {
        match self
            .dynamic_tools
            .iter_mut()
            .find(|t| t.declaration.name == tool.declaration.name)
        {
            Some(slot) => *slot = tool,
            None => self.dynamic_tools.push(tool),
        }
    }

    pub fn goal_info(&self) -> GoalInfo {
        match &self.goal {
            Some(goal) => GoalInfo {
                seed: goal.seed.clone(),
                cumulative: goal.cumulative.clone(),
                latest_goal: if goal.cumulative.is_empty() {
                    goal.seed.clone()
                } else {
                    goal.cumulative.clone()
                },
                goal_type: goal.latest_type.clone(),
                summary_context: goal.summary_context.clone(),
            },
            None => GoalInfo {
                seed: "Idle".into(),
                cumulative: "Idle".into(),
                latest_goal: "Idle".into(),
                goal_type: "Idle".into(),
                summary_context: None,
            },
        }
    }
}

fn push_capped<T>(history: &mut Vec<T>, value: T) {
    history.push(value);
    if history.len() > HISTORY_CAP {
        let excess = history.len() - HISTORY_CAP;
        history.drain(..excess);
    }
}

/// The agent's parsed JSON proposal: artifact mutations, optional dynamic
/// tool registration, optional full-source self-modification, and the
/// self-reported confidence driving the critique policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Proposal {
    #[serde(default)]
    pub proposed_changes_description: String,
    #[serde(default)]
    pub agent_confidence_score: f64,
    #[serde(default)]
    pub modified_artifacts: Vec<ArtifactEdit>,
    #[serde(default)]
    pub new_artifacts: Vec<NewArtifact>,
    #[serde(default)]
    pub deleted_artifacts: Vec<String>,
    #[serde(default)]
    pub proposed_new_tool_declaration: Option<ToolDeclaration>,
    #[serde(default)]
    pub generated_tool_implementation: Option<String>,
    #[serde(default)]
    pub full_source: Option<String>,
    #[serde(default)]
    pub persona_analysis_musing: Option<String>,
    #[serde(default)]
    pub justification_persona_musing: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactEdit {
    pub id: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewArtifact {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    pub content: String,
}

/// Output of one successful LLM round.
#[derive(Debug, Clone)]
pub struct IterationResult {
    pub proposal: Proposal,
    pub cycle_time: Duration,
    pub token_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CritiqueStatus {
    Proceed,
    HitlRequired,
}

#[derive(Debug, Clone)]
pub struct CritiqueVerdict {
    pub status: CritiqueStatus,
    pub critique_passed: bool,
    pub critique_report: String,
    /// Label recorded against the apply step ("Skipped", "Critique OK", ...).
    pub apply_source: String,
    pub hitl_mode: HitlMode,
    /// Escalation reason, present iff status is HitlRequired.
    pub reason: Option<String>,
    /// Artifact the intervention UI should open for editing, when one exists.
    pub artifact_hint: Option<String>,
}

impl CritiqueVerdict {
    pub fn proceed(apply_source: &str, passed: bool, report: &str) -> Self {
        Self {
            status: CritiqueStatus::Proceed,
            critique_passed: passed,
            critique_report: report.to_string(),
            apply_source: apply_source.to_string(),
            hitl_mode: HitlMode::Prompt,
            reason: None,
            artifact_hint: None,
        }
    }

    pub fn human(reason: &str, mode: HitlMode, report: &str) -> Self {
        Self {
            status: CritiqueStatus::HitlRequired,
            critique_passed: false,
            critique_report: report.to_string(),
            apply_source: String::new(),
            hitl_mode: mode,
            reason: Some(reason.to_string()),
            artifact_hint: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApplyResult {
    pub success: bool,
    pub changes: Vec<String>,
    pub errors: Vec<String>,
    pub next_cycle: u64,
    pub requires_sandbox: bool,
}

/// Typed progress stream emitted by the orchestrator over an mpsc channel.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    CycleStart { cycle: u64 },
    IterationAttempt { cycle: u64, attempt: u32 },
    ToolCall { name: String },
    Decision { apply_source: String },
    Applied { next_cycle: u64, changes: usize },
    Paused { reason: String },
    Completed { cycle: u64 },
    Aborted,
    Failed { message: String },
}

pub type ProgressSender = tokio::sync::mpsc::UnboundedSender<ProgressEvent>;

/// Injected randomness for the critique policy. Production uses `StdRandom`;
/// tests script the sequence to pin decisions.
pub trait RandomSource: Send {
    /// Uniform sample in [0, 1).
    fn next_f64(&mut self) -> f64;
}

pub struct StdRandom {
    rng: StdRng,
}

impl StdRandom {
    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl RandomSource for StdRandom {
    fn next_f64(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }
}
