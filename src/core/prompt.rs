// src/core/prompt.rs — Assembles the core, critique and summary prompts
//
// Sections (in order) for the core prompt:
//   1. Identity — persona framing from the configured balance
//   2. Goal — seed, cumulative refinements, compacted summary context
//   3. Cycle metrics — counters and rolling averages
//   4. Artifacts — registry summary plus recent content snippets
//   5. Tools — static and dynamic declarations
//   6. Output contract — the strict JSON shape the reply must carry

use crate::core::types::{CycleState, GoalInfo, PersonaMode, Proposal};
use crate::infra::config::Config;
use crate::storage::{latest_artifact, Storage};
use crate::tools::ToolDeclaration;

/// Characters of artifact content included per snippet.
const SNIPPET_CHAR_LIMIT: usize = 1500;

pub fn build_core_prompt(
    state: &CycleState,
    goal: &GoalInfo,
    config: &Config,
    static_tools: &[ToolDeclaration],
    storage: &dyn Storage,
) -> String {
    let mut prompt = String::with_capacity(8192);

    append_identity_section(&mut prompt, state.persona_mode);
    append_goal_section(&mut prompt, goal);
    append_metrics_section(&mut prompt, state);
    append_artifact_section(&mut prompt, state, storage, config.context.snippet_limit);
    append_tools_section(&mut prompt, static_tools, state);
    append_output_contract(&mut prompt);

    prompt
}

/// Prompt for the auto-critique sub-call. The reply must be
/// `{"critique_passed": bool, "critique_report": string}`.
pub fn build_critique_prompt(goal: &GoalInfo, proposal: &Proposal) -> String {
    let mut prompt = String::with_capacity(2048);

    prompt.push_str("# Critique\n\n");
    prompt.push_str(
        "You are a strict reviewer of a self-modifying agent's proposal. \
         Judge whether the proposal advances the goal without regressions.\n\n",
    );
    prompt.push_str("## Goal\n\n");
    prompt.push_str(&goal.latest_goal);
    prompt.push_str("\n\n## Proposed Changes\n\n");
    prompt.push_str(&proposal.proposed_changes_description);
    prompt.push_str(&format!(
        "\n\nArtifacts: {} modified, {} new, {} deleted.",
        proposal.modified_artifacts.len(),
        proposal.new_artifacts.len(),
        proposal.deleted_artifacts.len(),
    ));
    if proposal.full_source.is_some() {
        prompt.push_str(" Includes a full-source self-modification.");
    }
    prompt.push_str(&format!(
        "\nSelf-reported confidence: {:.2}.",
        proposal.agent_confidence_score
    ));
    prompt.push_str(
        "\n\nReply with exactly one JSON object: \
         {\"critique_passed\": true|false, \"critique_report\": \"...\"}\n",
    );

    prompt
}

/// Prompt for out-of-band context summarization. The reply must be
/// `{"summary": string}`.
pub fn build_summary_prompt(state: &CycleState, goal: &GoalInfo) -> String {
    let mut prompt = String::with_capacity(2048);

    prompt.push_str("# Context Summarization\n\n");
    prompt.push_str(
        "Compact the following agent history into a dense summary that \
         preserves the goal, key decisions, and the current artifact layout.\n\n",
    );
    append_goal_section(&mut prompt, goal);
    append_metrics_section(&mut prompt, state);

    prompt.push_str("## Artifact Registry\n\n");
    for meta in sorted_metadata(state) {
        prompt.push_str(&format!(
            "- {} ({}) latest cycle {}\n",
            meta.id, meta.kind, meta.latest_cycle
        ));
    }

    prompt.push_str("\nReply with exactly one JSON object: {\"summary\": \"...\"}\n");
    prompt
}

fn append_identity_section(prompt: &mut String, persona: PersonaMode) {
    prompt.push_str("# Identity\n\n");
    match persona {
        PersonaMode::Divergent => prompt.push_str(
            "You are the divergent persona: explore bold restructurings, \
             favor novel approaches over incremental polish.\n\n",
        ),
        PersonaMode::Convergent => prompt.push_str(
            "You are the convergent persona: consolidate, simplify, and \
             harden what already exists before adding anything new.\n\n",
        ),
    }
}

fn append_goal_section(prompt: &mut String, goal: &GoalInfo) {
    prompt.push_str("# Goal\n\n");
    prompt.push_str(&format!("Seed goal: {}\n", goal.seed));
    prompt.push_str(&format!("Cumulative goal: {}\n", goal.cumulative));
    prompt.push_str(&format!("Latest goal type: {}\n", goal.goal_type));
    if let Some(summary) = &goal.summary_context {
        prompt.push_str("\n## Compacted Context\n\n");
        prompt.push_str(summary);
        prompt.push('\n');
    }
    prompt.push('\n');
}

fn append_metrics_section(prompt: &mut String, state: &CycleState) {
    prompt.push_str("# Cycle Metrics\n\n");
    prompt.push_str(&format!(
        "Cycle {} | iterations {} | human interventions {} | failures {}\n",
        state.total_cycles, state.agent_iterations, state.human_interventions, state.fail_count
    ));
    if let Some(avg) = state.avg_confidence {
        prompt.push_str(&format!("Average confidence: {:.2}\n", avg));
    }
    if let Some(rate) = state.critique_fail_rate {
        prompt.push_str(&format!("Critique fail rate: {:.1}%\n", rate));
    }
    if let Some(tokens) = state.avg_tokens {
        prompt.push_str(&format!("Average tokens per cycle: {:.0}\n", tokens));
    }
    prompt.push('\n');
}

fn append_artifact_section(
    prompt: &mut String,
    state: &CycleState,
    storage: &dyn Storage,
    snippet_limit: usize,
) {
    prompt.push_str("# Artifacts\n\n");
    if state.artifact_metadata.is_empty() {
        prompt.push_str("(none registered)\n\n");
        return;
    }

    let sorted = sorted_metadata(state);
    for meta in &sorted {
        prompt.push_str(&format!(
            "- {} ({}) latest cycle {}: {}\n",
            meta.id, meta.kind, meta.latest_cycle, meta.description
        ));
    }

    prompt.push_str("\n## Recent Content\n\n");
    for meta in sorted.iter().take(snippet_limit) {
        let content = match latest_artifact(storage, state, &meta.id) {
            Ok(Some(content)) => content,
            _ => continue,
        };
        let snippet: String = content.chars().take(SNIPPET_CHAR_LIMIT).collect();
        prompt.push_str(&format!("### {} (cycle {})\n", meta.id, meta.latest_cycle));
        prompt.push_str(&snippet);
        if content.chars().count() > SNIPPET_CHAR_LIMIT {
            prompt.push_str("\n[truncated]");
        }
        prompt.push_str("\n\n");
    }
}

fn append_tools_section(
    prompt: &mut String,
    static_tools: &[ToolDeclaration],
    state: &CycleState,
) {
    if static_tools.is_empty() && state.dynamic_tools.is_empty() {
        return;
    }
    prompt.push_str("# Available Tools\n\n");
    for tool in static_tools {
        prompt.push_str(&format!("- {}: {}\n", tool.name, tool.description));
    }
    for tool in &state.dynamic_tools {
        prompt.push_str(&format!(
            "- {} (dynamic): {}\n",
            tool.declaration.name, tool.declaration.description
        ));
    }
    prompt.push('\n');
}

fn append_output_contract(prompt: &mut String) {
    prompt.push_str("# Output Contract\n\n");
    prompt.push_str(
        "Reply with exactly one JSON object carrying these keys:\n\
         - proposed_changes_description (string)\n\
         - agent_confidence_score (number 0-1)\n\
         - modified_artifacts (array of {id, content})\n\
         - new_artifacts (array of {id, type, content})\n\
         - deleted_artifacts (array of ids)\n\
         - proposed_new_tool_declaration (object or null)\n\
         - generated_tool_implementation (string or null)\n\
         - full_source (string or null, only for full self-modification)\n\
         No prose outside the JSON object.\n",
    );
}

/// Metadata ordered newest-first so the snippet budget favors what the agent
/// touched most recently.
fn sorted_metadata(state: &CycleState) -> Vec<&crate::core::types::ArtifactMetadata> {
    let mut sorted: Vec<_> = state.artifact_metadata.values().collect();
    sorted.sort_by(|a, b| b.latest_cycle.cmp(&a.latest_cycle).then(a.id.cmp(&b.id)));
    sorted
}
