// src/tools/mod.rs — Tool declarations, dynamic tool registry, runner trait

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::infra::errors::CycleError;

/// MCP-style tool declaration: name, description and a JSON-schema object
/// describing the parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A tool the agent registered at runtime: declaration plus the source string
/// of its implementation, executed by the external script host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicTool {
    pub declaration: ToolDeclaration,
    pub implementation: String,
}

/// Entry-point spellings accepted in a generated implementation.
const RUN_ENTRY_MARKERS: &[&str] = &["async fn run(params)", "fn run(params)", "run = async"];

/// Validate a proposed dynamic tool before registration. Returns a human
/// readable rejection reason on failure; the caller records it as an apply
/// error rather than crashing.
pub fn validate_dynamic_tool(decl: &ToolDeclaration, implementation: &str) -> Result<(), String> {
    if decl.name.trim().is_empty() {
        return Err("tool declaration missing name".into());
    }
    if decl.description.trim().is_empty() {
        return Err(format!("tool '{}' missing description", decl.name));
    }
    if !decl.input_schema.is_object() {
        return Err(format!("tool '{}' input schema must be an object", decl.name));
    }
    if implementation.trim().is_empty() {
        return Err(format!("tool '{}' missing implementation", decl.name));
    }
    if !RUN_ENTRY_MARKERS.iter().any(|m| implementation.contains(m)) {
        return Err(format!(
            "tool '{}' implementation missing a run(params) entry point",
            decl.name
        ));
    }
    Ok(())
}

/// Executes a named tool against the static and dynamic registries.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run_tool(
        &self,
        name: &str,
        args: &serde_json::Value,
        static_tools: &[ToolDeclaration],
        dynamic_tools: &[DynamicTool],
    ) -> Result<serde_json::Value, CycleError>;
}
