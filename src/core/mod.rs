// src/core/mod.rs — Cycle engine: state machine, policies, mutation apply

pub mod apply;
pub mod critique;
pub mod iteration;
pub mod orchestrator;
pub mod prompt;
pub mod resume;
pub mod summarize;
pub mod types;
