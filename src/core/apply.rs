// src/core/apply.rs — Applies proposal mutations and stages self-modification
//
// The four op groups run independently and errors accumulate instead of
// aborting the batch, so a failing create does not roll back an earlier
// modify. Callers must treat a non-empty error list as a partial apply.

use tracing::{info, warn};

use crate::core::types::{ApplyResult, ArtifactMetadata, CycleState, Proposal};
use crate::storage::Storage;
use crate::tools::{validate_dynamic_tool, DynamicTool};

/// Apply `proposal` against `state` and `storage` for `current_cycle`.
///
/// Writes land at `current_cycle + 1`; metadata advances only after a write
/// succeeds. Does not touch `total_cycles` — the caller advances it from
/// `ApplyResult::next_cycle`.
pub fn apply_proposal(
    proposal: &Proposal,
    current_cycle: u64,
    source: &str,
    state: &mut CycleState,
    storage: &dyn Storage,
) -> ApplyResult {
    let next_cycle = current_cycle + 1;
    let mut changes: Vec<String> = Vec::new();
    let mut errors: Vec<String> = Vec::new();
    let mut requires_sandbox = false;

    for edit in &proposal.modified_artifacts {
        if edit.id.trim().is_empty() {
            errors.push("Invalid mod artifact structure: missing id".into());
            continue;
        }
        let Some(meta) = state.artifact_metadata.get(&edit.id).cloned() else {
            errors.push(format!("Modify failed (artifact not found): {}", edit.id));
            continue;
        };
        let current = match storage.get_artifact(&edit.id, meta.latest_cycle) {
            Ok(content) => content,
            Err(e) => {
                errors.push(format!("Failed read {}: {}", edit.id, e));
                continue;
            }
        };
        if current.as_deref() == Some(edit.content.as_str()) {
            // Identical content is a no-op, not an error.
            continue;
        }
        match storage.set_artifact(&edit.id, next_cycle, &edit.content) {
            Ok(()) => {
                if let Some(meta) = state.artifact_metadata.get_mut(&edit.id) {
                    meta.latest_cycle = next_cycle;
                }
                changes.push(format!("Modified: {}", edit.id));
            }
            Err(e) => errors.push(format!("Failed save mod {}: {}", edit.id, e)),
        }
    }

    for new_art in &proposal.new_artifacts {
        if new_art.id.trim().is_empty() || new_art.kind.trim().is_empty() {
            errors.push(format!(
                "Invalid new artifact structure: ID={}",
                if new_art.id.is_empty() { "?" } else { &new_art.id }
            ));
            continue;
        }
        if state.artifact_metadata.contains_key(&new_art.id) {
            errors.push(format!("Create failed (ID exists): {}", new_art.id));
            continue;
        }
        match storage.set_artifact(&new_art.id, next_cycle, &new_art.content) {
            Ok(()) => {
                state.artifact_metadata.insert(
                    new_art.id.clone(),
                    ArtifactMetadata {
                        id: new_art.id.clone(),
                        kind: new_art.kind.clone(),
                        description: format!("New {}", new_art.kind),
                        latest_cycle: next_cycle,
                    },
                );
                changes.push(format!("Created: {} ({})", new_art.id, new_art.kind));
            }
            Err(e) => errors.push(format!("Failed save new {}: {}", new_art.id, e)),
        }
    }

    for id in &proposal.deleted_artifacts {
        // Content bytes stay in storage for recovery; only metadata goes.
        if state.artifact_metadata.remove(id).is_some() {
            changes.push(format!("Deleted: {}", id));
        } else {
            errors.push(format!("Delete failed (not found): {}", id));
        }
    }

    if let Some(decl) = &proposal.proposed_new_tool_declaration {
        let implementation = proposal
            .generated_tool_implementation
            .clone()
            .unwrap_or_default();
        match validate_dynamic_tool(decl, &implementation) {
            Ok(()) => {
                let existed = state
                    .dynamic_tools
                    .iter()
                    .any(|t| t.declaration.name == decl.name);
                state.upsert_dynamic_tool(DynamicTool {
                    declaration: decl.clone(),
                    implementation,
                });
                changes.push(if existed {
                    format!("Tool Updated: {}", decl.name)
                } else {
                    format!("Tool Defined: {}", decl.name)
                });
            }
            Err(reason) => errors.push(reason),
        }
    }

    if let Some(full_source) = &proposal.full_source {
        state.last_generated_full_source = Some(full_source.clone());
        changes.push("Generated Full Source (Sandbox Required)".into());
        requires_sandbox = true;
        info!(cycle = current_cycle, "self-modification staged, sandbox required");
    }

    let success = errors.is_empty();
    if success && !requires_sandbox {
        state.record_confidence(proposal.agent_confidence_score);
    }
    if !errors.is_empty() {
        warn!(cycle = current_cycle, source, errors = errors.len(), "apply finished with errors");
    }

    ApplyResult {
        success,
        changes,
        errors,
        next_cycle: if success && !requires_sandbox {
            next_cycle
        } else {
            current_cycle
        },
        requires_sandbox,
    }
}
